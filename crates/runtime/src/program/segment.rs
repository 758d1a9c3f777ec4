// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The segment program: couples one process's event stream with the
//! enclosing state.

use super::{
    resume_parent_served, Deferred, Program, ProgramExecEvent, ProgramLocation,
};
use crate::error::ExecError;
use crate::master::{AckTx, Control, ControlRx, ProgramHandle};
use crate::process::{spawn_process, ProcessHandle};
use async_trait::async_trait;
use labrun_core::{EvalStack, Notice, Point, SegmentBlock};
use serde::Serialize;
use serde_json::Value as Json;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentMode {
    Halting,
    Normal,
    PausingProcess,
    PausingState,
    Paused,
    Halted,
    Terminated,
}

labrun_core::simple_display! {
    SegmentMode {
        Halting => "halting",
        Normal => "normal",
        PausingProcess => "pausing_process",
        PausingState => "pausing_state",
        Paused => "paused",
        Halted => "halted",
        Terminated => "terminated",
    }
}

impl SegmentMode {
    /// Declared transition set; every observed transition must be here.
    pub fn may_enter(self, next: SegmentMode) -> bool {
        use SegmentMode::*;
        matches!(
            (self, next),
            (Normal, Halting)
                | (Normal, PausingProcess)
                | (Normal, Terminated)
                | (Halting, Halted)
                | (PausingProcess, PausingState)
                | (PausingState, Paused)
                | (Paused, Normal)
                | (Paused, Halting)
                | (Paused, Terminated)
        )
    }

    fn busy(self) -> bool {
        matches!(self, SegmentMode::PausingProcess | SegmentMode::PausingState | SegmentMode::Halting)
    }

    fn stopped(self) -> bool {
        matches!(self, SegmentMode::Paused | SegmentMode::Halted | SegmentMode::Terminated)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentLocation {
    pub mode: SegmentMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Json>,
    pub time_ms: u64,
}

fn set_mode(mode: &mut SegmentMode, next: SegmentMode, handle: &ProgramHandle) {
    debug_assert!(mode.may_enter(next), "segment {mode} -> {next}");
    tracing::debug!(program = %handle.id(), from = %mode, to = %next, "segment mode");
    *mode = next;
    handle.set_busy(next.busy());
}

fn emit(
    handle: &ProgramHandle,
    mode: SegmentMode,
    process: &Option<Json>,
    state: &Option<Json>,
    errors: Vec<Notice>,
) {
    let time_ms = handle.epoch_ms();
    handle.send(ProgramExecEvent {
        location: ProgramLocation::Segment(SegmentLocation {
            mode,
            process: process.clone(),
            state: state.clone(),
            time_ms,
        }),
        time_ms,
        stopped: mode.stopped(),
        errors,
    });
}

fn begin_halt(mode: &mut SegmentMode, handle: &ProgramHandle, process: &ProcessHandle) {
    match *mode {
        SegmentMode::Normal | SegmentMode::Paused => {
            set_mode(mode, SegmentMode::Halting, handle);
            process.halt();
        }
        _ => tracing::warn!(current = %mode, "halt ignored, segment busy"),
    }
}

pub(crate) struct SegmentProgram {
    block: SegmentBlock,
    handle: ProgramHandle,
    control: ControlRx,
}

impl SegmentProgram {
    pub fn new(
        block: SegmentBlock,
        handle: ProgramHandle,
        control: ControlRx,
        _stack: EvalStack,
    ) -> Self {
        Self { block, handle, control }
    }
}

#[async_trait]
impl Program for SegmentProgram {
    async fn run(self: Box<Self>) -> Result<(), ExecError> {
        let SegmentProgram { block, handle, mut control } = *self;
        let master = handle.master().clone();
        let lineage = handle.lineage();

        let mut mode = SegmentMode::Normal;
        let mut latest_process: Option<Json> = None;
        let mut latest_state: Option<Json> = None;

        // A leaf entering a subtree triggers the first apply of every
        // non-settling ancestor state.
        if let Err(e) = master.state().apply(&lineage, true).await {
            if e.is_fatal() {
                return Err(e);
            }
        }

        // Couple the nearest state item's records with the process stream.
        let (_records_keepalive, mut records) = match master.state().record_watch(&lineage) {
            Some(rx) => (None, rx),
            None => {
                let (tx, rx) = watch::channel(None);
                (Some(tx), rx)
            }
        };
        if let Some(record) = records.borrow_and_update().as_ref() {
            latest_state = Some(record.location.export());
        }
        let mut records_open = true;

        let process = match master.processes().create(&block.namespace, &block.process) {
            Ok(process) => process,
            Err(e) => {
                emit(&handle, mode, &latest_process, &latest_state, vec![e.notice()]);
                set_mode(&mut mode, SegmentMode::Terminated, &handle);
                emit(&handle, mode, &latest_process, &latest_state, Vec::new());
                return Ok(());
            }
        };
        let mut process = spawn_process(process, None, master.clock());

        let mut pending_pause: Option<AckTx> = None;
        let mut deferred = Deferred::default();
        let mut control_open = true;

        loop {
            if deferred.halt {
                deferred.halt = false;
                begin_halt(&mut mode, &handle, &process);
            }

            tokio::select! {
                event = process.events.recv() => match event {
                    Some(event) => {
                        if event.location.is_some() {
                            latest_process = event.location.clone();
                        }

                        if event.stopped {
                            match mode {
                                SegmentMode::PausingProcess => {
                                    set_mode(&mut mode, SegmentMode::PausingState, &handle);
                                    emit(&handle, mode, &latest_process, &latest_state, Vec::new());
                                    master.state().suspend(&lineage).await?;
                                    set_mode(&mut mode, SegmentMode::Paused, &handle);
                                    if let Some(done) = pending_pause.take() {
                                        let _ = done.send(Ok(()));
                                    }
                                }
                                SegmentMode::Halting => {
                                    set_mode(&mut mode, SegmentMode::Halted, &handle);
                                }
                                _ => {}
                            }
                        }
                        if event.terminated && matches!(mode, SegmentMode::Normal | SegmentMode::Paused) {
                            set_mode(&mut mode, SegmentMode::Terminated, &handle);
                        }

                        emit(&handle, mode, &latest_process, &latest_state, event.errors.clone());

                        if event.terminated {
                            break;
                        }
                    }
                    None => {
                        if mode == SegmentMode::Normal {
                            set_mode(&mut mode, SegmentMode::Terminated, &handle);
                            emit(&handle, mode, &latest_process, &latest_state, Vec::new());
                        }
                        break;
                    }
                },

                changed = records.changed(), if records_open => match changed {
                    Ok(()) => {
                        let (location, errors) = match records.borrow_and_update().as_ref() {
                            Some(record) => (Some(record.location.export()), record.errors.clone()),
                            None => (None, Vec::new()),
                        };
                        if location.is_some() {
                            latest_state = location;
                        }
                        emit(&handle, mode, &latest_process, &latest_state, errors);
                    }
                    Err(_) => {
                        records_open = false;
                    }
                },

                message = control.recv(), if control_open => match message {
                    Some(Control::Halt) => begin_halt(&mut mode, &handle, &process),
                    Some(Control::Pause { loose, done }) => match mode {
                        SegmentMode::Normal => {
                            set_mode(&mut mode, SegmentMode::PausingProcess, &handle);
                            emit(&handle, mode, &latest_process, &latest_state, Vec::new());
                            process.pause();
                            pending_pause = Some(done);
                        }
                        SegmentMode::Paused => {
                            let _ = done.send(Ok(()));
                        }
                        _ if loose => {
                            let _ = done.send(Ok(()));
                        }
                        _ => {
                            let _ = done.send(Err(ExecError::internal("segment busy")));
                        }
                    },
                    Some(Control::Resume { loose, done }) => match mode {
                        SegmentMode::Paused => {
                            match resume_parent_served(&handle, &mut control, &mut deferred).await {
                                Err(e) => {
                                    let _ = done.send(Err(e));
                                }
                                Ok(()) => {
                                    // The state re-applies before the
                                    // process moves again.
                                    if let Err(e) = master.state().apply(&lineage, true).await {
                                        if e.is_fatal() {
                                            return Err(e);
                                        }
                                    }
                                    process.resume();
                                    set_mode(&mut mode, SegmentMode::Normal, &handle);
                                    emit(&handle, mode, &latest_process, &latest_state, Vec::new());
                                    let _ = done.send(Ok(()));
                                }
                            }
                        }
                        SegmentMode::Normal => {
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
                            Ok(Point::Segment { process: point }) => {
                                process.jump(point.unwrap_or(Json::Null));
                            }
                            _ => tracing::warn!("segment jump point rejected"),
                        }
                    }
                    None => control_open = false,
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "segment_tests.rs"]
mod tests;
