// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The repeat program: one child lifecycle per iteration, `index` exposed
//! to the child's environment.

use super::{await_served, resume_parent_served, Deferred, Program, ProgramExecEvent, ProgramLocation};
use crate::error::ExecError;
use crate::master::{Control, ControlRx, HandleId, ProgramHandle};
use async_trait::async_trait;
use labrun_core::{EvalStack, Notice, Point, RepeatBlock, Value};
use serde::Serialize;
use std::collections::HashMap;
use tokio::pin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    Normal,
    Paused,
    Halting,
    Terminated,
}

labrun_core::simple_display! {
    RepeatMode {
        Normal => "normal",
        Paused => "paused",
        Halting => "halting",
        Terminated => "terminated",
    }
}

impl RepeatMode {
    pub fn may_enter(self, next: RepeatMode) -> bool {
        use RepeatMode::*;
        matches!(
            (self, next),
            (Normal, Paused)
                | (Normal, Halting)
                | (Normal, Terminated)
                | (Paused, Normal)
                | (Paused, Halting)
                | (Paused, Terminated)
                | (Halting, Terminated)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepeatLocation {
    pub iteration: u64,
    pub mode: RepeatMode,
}

fn set_mode(mode: &mut RepeatMode, next: RepeatMode, handle: &ProgramHandle) {
    debug_assert!(mode.may_enter(next), "repeat {mode} -> {next}");
    tracing::debug!(program = %handle.id(), from = %mode, to = %next, "repeat mode");
    *mode = next;
}

fn emit(handle: &ProgramHandle, iteration: u64, mode: RepeatMode, errors: Vec<Notice>) {
    handle.send(ProgramExecEvent {
        location: ProgramLocation::Repeat(RepeatLocation { iteration, mode }),
        time_ms: handle.epoch_ms(),
        stopped: matches!(mode, RepeatMode::Paused | RepeatMode::Terminated),
        errors,
    });
}

fn begin_halt(mode: &mut RepeatMode, handle: &ProgramHandle, iteration: u64, child: &HandleId) {
    match *mode {
        RepeatMode::Normal | RepeatMode::Paused => {
            set_mode(mode, RepeatMode::Halting, handle);
            emit(handle, iteration, *mode, Vec::new());
            handle.forward(child, Control::Halt);
        }
        current => tracing::warn!(%current, "halt ignored"),
    }
}

pub(crate) struct RepeatProgram {
    block: RepeatBlock,
    handle: ProgramHandle,
    control: ControlRx,
    stack: EvalStack,
}

impl RepeatProgram {
    pub fn new(
        block: RepeatBlock,
        handle: ProgramHandle,
        control: ControlRx,
        stack: EvalStack,
    ) -> Self {
        Self { block, handle, control, stack }
    }
}

#[async_trait]
impl Program for RepeatProgram {
    async fn run(self: Box<Self>) -> Result<(), ExecError> {
        let RepeatProgram { block, handle, mut control, stack } = *self;
        let mut mode = RepeatMode::Normal;
        let mut iteration: u64 = 0;
        let mut jump_target: Option<u64> = None;
        let mut deferred = Deferred::default();
        let mut control_open = true;

        while !block.count.is_done(iteration) {
            let mut frame = HashMap::new();
            frame.insert("index".to_string(), Value::Number(iteration as f64));
            let iteration_stack = stack.push(frame);

            let owner = handle.create_child(block.child.clone());
            let child_id = owner.handle().id().clone();
            emit(&handle, iteration, mode, Vec::new());

            let child_run = owner.run(iteration_stack);
            pin!(child_run);

            let result = loop {
                if deferred.halt {
                    deferred.halt = false;
                    begin_halt(&mut mode, &handle, iteration, &child_id);
                }

                tokio::select! {
                    result = &mut child_run => break result,

                    message = control.recv(), if control_open => match message {
                        Some(Control::Halt) => begin_halt(&mut mode, &handle, iteration, &child_id),

                        Some(Control::Pause { loose, done }) => match mode {
                            RepeatMode::Normal => {
                                let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
                                if handle.forward(
                                    &child_id,
                                    Control::Pause { loose: true, done: ack_tx },
                                ) {
                                    if let Err(e) =
                                        await_served(ack_rx, &mut control, &mut deferred).await
                                    {
                                        let _ = done.send(Err(e));
                                        continue;
                                    }
                                }
                                set_mode(&mut mode, RepeatMode::Paused, &handle);
                                emit(&handle, iteration, mode, Vec::new());
                                let _ = done.send(Ok(()));
                            }
                            RepeatMode::Paused => {
                                let _ = done.send(Ok(()));
                            }
                            _ if loose => {
                                let _ = done.send(Ok(()));
                            }
                            _ => {
                                let _ = done.send(Err(ExecError::internal("repeat halting")));
                            }
                        },

                        Some(Control::Resume { loose, done }) => match mode {
                            RepeatMode::Paused => {
                                if let Err(e) =
                                    resume_parent_served(&handle, &mut control, &mut deferred).await
                                {
                                    let _ = done.send(Err(e));
                                    continue;
                                }
                                set_mode(&mut mode, RepeatMode::Normal, &handle);
                                emit(&handle, iteration, mode, Vec::new());
                                let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
                                if handle.forward(
                                    &child_id,
                                    Control::Resume { loose: true, done: ack_tx },
                                ) {
                                    let _ = await_served(ack_rx, &mut control, &mut deferred).await;
                                }
                                let _ = done.send(Ok(()));
                            }
                            RepeatMode::Normal => {
                                let _ = done.send(Ok(()));
                            }
                            _ if loose => {
                                let _ = done.send(Ok(()));
                            }
                            _ => {
                                let _ = done.send(Err(ExecError::ResumeRefused));
                            }
                        },

                        Some(Control::Jump { point }) => {
                            match serde_json::from_value::<Point>(point) {
                                Ok(Point::Repeat { iteration: target, .. })
                                    if !block.count.is_done(target) =>
                                {
                                    jump_target = Some(target);
                                    handle.forward(&child_id, Control::Halt);
                                }
                                _ => tracing::warn!("repeat jump point rejected"),
                            }
                        }

                        None => control_open = false,
                    },
                }
            };
            result?;

            if mode == RepeatMode::Halting {
                break;
            }
            match jump_target.take() {
                Some(target) => iteration = target,
                None => iteration += 1,
            }
        }

        set_mode(&mut mode, RepeatMode::Terminated, &handle);
        emit(&handle, iteration, mode, Vec::new());
        Ok(())
    }
}

#[cfg(test)]
#[path = "repeat_tests.rs"]
mod tests;
