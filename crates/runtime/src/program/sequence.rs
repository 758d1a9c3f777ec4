// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The sequence program: children in order, controls to the active child.

use super::{await_served, resume_parent_served, Deferred, Program, ProgramExecEvent, ProgramLocation};
use crate::error::ExecError;
use crate::master::{Control, ControlRx, HandleId, ProgramHandle};
use async_trait::async_trait;
use labrun_core::{EvalStack, Notice, Point, SequenceBlock};
use serde::Serialize;
use tokio::pin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceMode {
    Normal,
    Paused,
    Halting,
    Terminated,
}

labrun_core::simple_display! {
    SequenceMode {
        Normal => "normal",
        Paused => "paused",
        Halting => "halting",
        Terminated => "terminated",
    }
}

impl SequenceMode {
    pub fn may_enter(self, next: SequenceMode) -> bool {
        use SequenceMode::*;
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
pub struct SequenceLocation {
    pub index: u32,
    pub mode: SequenceMode,
}

fn set_mode(mode: &mut SequenceMode, next: SequenceMode, handle: &ProgramHandle) {
    debug_assert!(mode.may_enter(next), "sequence {mode} -> {next}");
    tracing::debug!(program = %handle.id(), from = %mode, to = %next, "sequence mode");
    *mode = next;
}

fn emit(handle: &ProgramHandle, index: usize, mode: SequenceMode, errors: Vec<Notice>) {
    handle.send(ProgramExecEvent {
        location: ProgramLocation::Sequence(SequenceLocation { index: index as u32, mode }),
        time_ms: handle.epoch_ms(),
        stopped: matches!(mode, SequenceMode::Paused | SequenceMode::Terminated),
        errors,
    });
}

fn begin_halt(mode: &mut SequenceMode, handle: &ProgramHandle, index: usize, child: &HandleId) {
    match *mode {
        SequenceMode::Normal | SequenceMode::Paused => {
            set_mode(mode, SequenceMode::Halting, handle);
            emit(handle, index, *mode, Vec::new());
            handle.forward(child, Control::Halt);
        }
        current => tracing::warn!(%current, "halt ignored"),
    }
}

pub(crate) struct SequenceProgram {
    block: SequenceBlock,
    handle: ProgramHandle,
    control: ControlRx,
    stack: EvalStack,
}

impl SequenceProgram {
    pub fn new(
        block: SequenceBlock,
        handle: ProgramHandle,
        control: ControlRx,
        stack: EvalStack,
    ) -> Self {
        Self { block, handle, control, stack }
    }
}

#[async_trait]
impl Program for SequenceProgram {
    async fn run(self: Box<Self>) -> Result<(), ExecError> {
        let SequenceProgram { block, handle, mut control, stack } = *self;
        let mut mode = SequenceMode::Normal;
        let mut index = 0usize;
        let mut jump_target: Option<usize> = None;
        let mut deferred = Deferred::default();
        let mut control_open = true;

        while index < block.children.len() {
            let owner = handle.create_child(block.children[index].clone());
            let child_id = owner.handle().id().clone();
            emit(&handle, index, mode, Vec::new());

            let child_run = owner.run(stack.clone());
            pin!(child_run);

            let result = loop {
                if deferred.halt {
                    deferred.halt = false;
                    begin_halt(&mut mode, &handle, index, &child_id);
                }

                tokio::select! {
                    result = &mut child_run => break result,

                    message = control.recv(), if control_open => match message {
                        Some(Control::Halt) => begin_halt(&mut mode, &handle, index, &child_id),

                        Some(Control::Pause { loose, done }) => match mode {
                            SequenceMode::Normal => {
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
                                set_mode(&mut mode, SequenceMode::Paused, &handle);
                                emit(&handle, index, mode, Vec::new());
                                let _ = done.send(Ok(()));
                            }
                            SequenceMode::Paused => {
                                let _ = done.send(Ok(()));
                            }
                            _ if loose => {
                                let _ = done.send(Ok(()));
                            }
                            _ => {
                                let _ = done.send(Err(ExecError::internal("sequence halting")));
                            }
                        },

                        Some(Control::Resume { loose, done }) => match mode {
                            SequenceMode::Paused => {
                                if let Err(e) =
                                    resume_parent_served(&handle, &mut control, &mut deferred).await
                                {
                                    let _ = done.send(Err(e));
                                    continue;
                                }
                                set_mode(&mut mode, SequenceMode::Normal, &handle);
                                emit(&handle, index, mode, Vec::new());
                                let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
                                if handle.forward(
                                    &child_id,
                                    Control::Resume { loose: true, done: ack_tx },
                                ) {
                                    let _ = await_served(ack_rx, &mut control, &mut deferred).await;
                                }
                                let _ = done.send(Ok(()));
                            }
                            SequenceMode::Normal => {
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
                                Ok(Point::Sequence { index: target, .. })
                                    if (target as usize) < block.children.len() =>
                                {
                                    // Restart at the target child's initial
                                    // point.
                                    jump_target = Some(target as usize);
                                    handle.forward(&child_id, Control::Halt);
                                }
                                _ => tracing::warn!("sequence jump point rejected"),
                            }
                        }

                        None => control_open = false,
                    },
                }
            };
            result?;

            if mode == SequenceMode::Halting {
                break;
            }
            match jump_target.take() {
                Some(target) => index = target,
                None => index += 1,
            }
        }

        set_mode(&mut mode, SequenceMode::Terminated, &handle);
        emit(&handle, index.min(block.children.len()), mode, Vec::new());
        Ok(())
    }
}

#[cfg(test)]
#[path = "sequence_tests.rs"]
mod tests;
