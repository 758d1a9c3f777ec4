// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The parallel program: one child per branch, controls broadcast.

use super::{await_served, resume_parent_served, Deferred, Program, ProgramExecEvent, ProgramLocation};
use crate::error::ExecError;
use crate::master::{Control, ControlRx, HandleId, ProgramHandle};
use async_trait::async_trait;
use futures_util::future::join_all;
use labrun_core::{EvalStack, Notice, ParallelBlock, Point};
use serde::Serialize;
use tokio::pin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelMode {
    Normal,
    Paused,
    Halting,
    Terminated,
}

labrun_core::simple_display! {
    ParallelMode {
        Normal => "normal",
        Paused => "paused",
        Halting => "halting",
        Terminated => "terminated",
    }
}

impl ParallelMode {
    pub fn may_enter(self, next: ParallelMode) -> bool {
        use ParallelMode::*;
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
pub struct ParallelLocation {
    pub mode: ParallelMode,
    pub branches: u32,
}

fn set_mode(mode: &mut ParallelMode, next: ParallelMode, handle: &ProgramHandle) {
    debug_assert!(mode.may_enter(next), "parallel {mode} -> {next}");
    tracing::debug!(program = %handle.id(), from = %mode, to = %next, "parallel mode");
    *mode = next;
}

fn emit(handle: &ProgramHandle, mode: ParallelMode, branches: usize, errors: Vec<Notice>) {
    handle.send(ProgramExecEvent {
        location: ProgramLocation::Parallel(ParallelLocation { mode, branches: branches as u32 }),
        time_ms: handle.epoch_ms(),
        stopped: matches!(mode, ParallelMode::Paused | ParallelMode::Terminated),
        errors,
    });
}

pub(crate) struct ParallelProgram {
    block: ParallelBlock,
    handle: ProgramHandle,
    control: ControlRx,
    stack: EvalStack,
}

impl ParallelProgram {
    pub fn new(
        block: ParallelBlock,
        handle: ProgramHandle,
        control: ControlRx,
        stack: EvalStack,
    ) -> Self {
        Self { block, handle, control, stack }
    }
}

#[async_trait]
impl Program for ParallelProgram {
    async fn run(self: Box<Self>) -> Result<(), ExecError> {
        let ParallelProgram { block, handle, mut control, stack } = *self;
        let branches = block.children.len();
        let mut mode = ParallelMode::Normal;
        let mut deferred = Deferred::default();
        let mut control_open = true;

        let mut child_ids: Vec<HandleId> = Vec::with_capacity(branches);
        let mut runs = Vec::with_capacity(branches);
        for child in block.children {
            let owner = handle.create_child(child);
            child_ids.push(owner.handle().id().clone());
            runs.push(owner.run(stack.clone()));
        }
        emit(&handle, mode, branches, Vec::new());

        // Termination waits for every branch; errors are surfaced after
        // all of them stopped, not fail-fast.
        let joined = join_all(runs);
        pin!(joined);

        let broadcast_halt = |mode: &mut ParallelMode, handle: &ProgramHandle| {
            match *mode {
                ParallelMode::Normal | ParallelMode::Paused => {
                    set_mode(mode, ParallelMode::Halting, handle);
                    emit(handle, *mode, branches, Vec::new());
                    for child in &child_ids {
                        handle.forward(child, Control::Halt);
                    }
                }
                current => tracing::warn!(%current, "halt ignored"),
            }
        };

        let results = loop {
            if deferred.halt {
                deferred.halt = false;
                broadcast_halt(&mut mode, &handle);
            }

            tokio::select! {
                results = &mut joined => break results,

                message = control.recv(), if control_open => match message {
                    Some(Control::Halt) => broadcast_halt(&mut mode, &handle),

                    Some(Control::Pause { loose, done }) => match mode {
                        ParallelMode::Normal => {
                            let mut failure = None;
                            for child in &child_ids {
                                let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
                                if handle
                                    .forward(child, Control::Pause { loose: true, done: ack_tx })
                                {
                                    if let Err(e) =
                                        await_served(ack_rx, &mut control, &mut deferred).await
                                    {
                                        failure = Some(e);
                                    }
                                }
                            }
                            match failure {
                                Some(e) => {
                                    let _ = done.send(Err(e));
                                }
                                None => {
                                    set_mode(&mut mode, ParallelMode::Paused, &handle);
                                    emit(&handle, mode, branches, Vec::new());
                                    let _ = done.send(Ok(()));
                                }
                            }
                        }
                        ParallelMode::Paused => {
                            let _ = done.send(Ok(()));
                        }
                        _ if loose => {
                            let _ = done.send(Ok(()));
                        }
                        _ => {
                            let _ = done.send(Err(ExecError::internal("parallel halting")));
                        }
                    },

                    Some(Control::Resume { loose, done }) => match mode {
                        ParallelMode::Paused => {
                            if let Err(e) =
                                resume_parent_served(&handle, &mut control, &mut deferred).await
                            {
                                let _ = done.send(Err(e));
                                continue;
                            }
                            set_mode(&mut mode, ParallelMode::Normal, &handle);
                            emit(&handle, mode, branches, Vec::new());
                            for child in &child_ids {
                                let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
                                if handle
                                    .forward(child, Control::Resume { loose: true, done: ack_tx })
                                {
                                    let _ =
                                        await_served(ack_rx, &mut control, &mut deferred).await;
                                }
                            }
                            let _ = done.send(Ok(()));
                        }
                        ParallelMode::Normal => {
                            let _ = done.send(Ok(()));
                        }
                        _ if loose => {
                            let _ = done.send(Ok(()));
                        }
                        _ => {
                            let _ = done.send(Err(ExecError::ResumeRefused));
                        }
                    },

                    Some(Control::Jump { point }) => match serde_json::from_value::<Point>(point) {
                        Ok(Point::Parallel { children }) => {
                            for (key, point) in children {
                                if let Some(child) = child_ids.get(key as usize) {
                                    handle.forward(child, Control::Jump { point: point.export() });
                                }
                            }
                        }
                        _ => tracing::warn!("parallel jump point rejected"),
                    },

                    None => control_open = false,
                },
            }
        };

        set_mode(&mut mode, ParallelMode::Terminated, &handle);
        emit(&handle, mode, branches, Vec::new());

        for result in results {
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "parallel_tests.rs"]
mod tests;
