// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The state program: owns one state-manager item across its child's
//! lifetime.

use super::{
    await_served, pause_children_served, resume_parent_served, Deferred, Program,
    ProgramExecEvent, ProgramLocation,
};
use crate::error::ExecError;
use crate::master::{Control, ControlRx, HandleId, ProgramHandle};
use crate::state::StateRecord;
use async_trait::async_trait;
use labrun_core::{EvalStack, Notice, Point, StateBlock};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as Json;
use std::sync::Arc;
use tokio::pin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateMode {
    ApplyingState,
    HaltingChildThenState,
    HaltingChildWhilePaused,
    HaltingState,
    Normal,
    Paused,
    PausingChild,
    PausingState,
    Resuming,
    ResumingState,
    SuspendingState,
    Terminated,
}

labrun_core::simple_display! {
    StateMode {
        ApplyingState => "applying_state",
        HaltingChildThenState => "halting_child_then_state",
        HaltingChildWhilePaused => "halting_child_while_paused",
        HaltingState => "halting_state",
        Normal => "normal",
        Paused => "paused",
        PausingChild => "pausing_child",
        PausingState => "pausing_state",
        Resuming => "resuming",
        ResumingState => "resuming_state",
        SuspendingState => "suspending_state",
        Terminated => "terminated",
    }
}

impl StateMode {
    /// Declared transition set; every observed transition must be here.
    pub fn may_enter(self, next: StateMode) -> bool {
        use StateMode::*;
        matches!(
            (self, next),
            (ApplyingState, Normal)
                | (Normal, PausingChild)
                | (Normal, HaltingChildThenState)
                | (Normal, SuspendingState)
                | (PausingChild, PausingState)
                | (PausingChild, Normal)
                | (PausingState, Paused)
                | (Paused, Resuming)
                | (Paused, HaltingChildWhilePaused)
                | (Resuming, ResumingState)
                | (Resuming, Normal)
                | (Resuming, Paused)
                | (ResumingState, Normal)
                | (HaltingChildThenState, HaltingState)
                | (HaltingState, Terminated)
                | (SuspendingState, Terminated)
                | (HaltingChildWhilePaused, Terminated)
                | (Paused, Terminated)
        )
    }

    fn busy(self) -> bool {
        !matches!(self, StateMode::Normal | StateMode::Paused | StateMode::Terminated)
    }

    fn stopped(self) -> bool {
        matches!(self, StateMode::Paused | StateMode::Terminated)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateBlockLocation {
    pub mode: StateMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Json>,
}

/// Mode and latest state location, shared with the update callback.
struct SharedView {
    mode: StateMode,
    state: Option<Json>,
}

fn emit(handle: &ProgramHandle, view: &Arc<Mutex<SharedView>>, errors: Vec<Notice>) {
    let (mode, state) = {
        let view = view.lock();
        (view.mode, view.state.clone())
    };
    handle.send(ProgramExecEvent {
        location: ProgramLocation::State(StateBlockLocation { mode, state }),
        time_ms: handle.epoch_ms(),
        stopped: mode.stopped(),
        errors,
    });
}

fn set_mode(view: &Arc<Mutex<SharedView>>, next: StateMode, handle: &ProgramHandle) {
    let mut view = view.lock();
    debug_assert!(view.mode.may_enter(next), "state {} -> {next}", view.mode);
    tracing::debug!(program = %handle.id(), from = %view.mode, to = %next, "state mode");
    view.mode = next;
    handle.set_busy(next.busy());
}

fn mode_of(view: &Arc<Mutex<SharedView>>) -> StateMode {
    view.lock().mode
}

fn begin_halt(
    view: &Arc<Mutex<SharedView>>,
    handle: &ProgramHandle,
    child: &HandleId,
) {
    match mode_of(view) {
        StateMode::Normal => {
            set_mode(view, StateMode::HaltingChildThenState, handle);
            emit(handle, view, Vec::new());
            handle.forward(child, Control::Halt);
        }
        StateMode::Paused => {
            set_mode(view, StateMode::HaltingChildWhilePaused, handle);
            emit(handle, view, Vec::new());
            handle.forward(child, Control::Halt);
        }
        current => tracing::warn!(%current, "halt ignored, state program busy"),
    }
}

pub(crate) struct StateProgram {
    block: StateBlock,
    handle: ProgramHandle,
    control: ControlRx,
    stack: EvalStack,
}

impl StateProgram {
    pub fn new(
        block: StateBlock,
        handle: ProgramHandle,
        control: ControlRx,
        stack: EvalStack,
    ) -> Self {
        Self { block, handle, control, stack }
    }
}

#[async_trait]
impl Program for StateProgram {
    async fn run(self: Box<Self>) -> Result<(), ExecError> {
        let StateProgram { block, handle, mut control, stack } = *self;
        let StateBlock { state, settle, child } = block;
        let master = handle.master().clone();
        let lineage = handle.lineage();

        let view = Arc::new(Mutex::new(SharedView {
            mode: if settle { StateMode::ApplyingState } else { StateMode::Normal },
            state: None,
        }));

        let update = {
            let handle = handle.clone();
            let view = Arc::clone(&view);
            Arc::new(move |record: StateRecord| {
                let errors = record.errors.clone();
                view.lock().state = Some(record.location.export());
                emit(&handle, &view, errors);
            }) as Arc<dyn Fn(StateRecord) + Send + Sync>
        };
        master.state().add(&lineage, handle.position(), &state, &stack, update);

        if settle {
            emit(&handle, &view, Vec::new());
            master.state().apply(&lineage, false).await?;
            set_mode(&view, StateMode::Normal, &handle);
            emit(&handle, &view, Vec::new());
        }
        // Without settle the first apply comes from a descendant leaf; the
        // mode is reported once the state settles.

        let owner = handle.create_child(child);
        let child_id = owner.handle().id().clone();
        let child_run = owner.run(stack.clone());
        pin!(child_run);

        let mut deferred = Deferred::default();
        let mut control_open = true;
        let child_result = loop {
            if deferred.halt {
                deferred.halt = false;
                begin_halt(&view, &handle, &child_id);
            }

            tokio::select! {
                result = &mut child_run => break result,

                message = control.recv(), if control_open => match message {
                    Some(Control::Halt) => begin_halt(&view, &handle, &child_id),

                    Some(Control::Pause { loose, done }) => match mode_of(&view) {
                        StateMode::Normal => {
                            set_mode(&view, StateMode::PausingChild, &handle);
                            emit(&handle, &view, Vec::new());
                            if let Err(e) =
                                pause_children_served(&handle, &mut control, &mut deferred).await
                            {
                                set_mode(&view, StateMode::Normal, &handle);
                                emit(&handle, &view, vec![e.notice()]);
                                let _ = done.send(Err(e));
                                continue;
                            }
                            set_mode(&view, StateMode::PausingState, &handle);
                            emit(&handle, &view, Vec::new());
                            master.state().suspend(&lineage).await?;
                            set_mode(&view, StateMode::Paused, &handle);
                            emit(&handle, &view, Vec::new());
                            let _ = done.send(Ok(()));
                        }
                        StateMode::Paused => {
                            let _ = done.send(Ok(()));
                        }
                        _ if loose => {
                            let _ = done.send(Ok(()));
                        }
                        _ => {
                            let _ = done.send(Err(ExecError::internal("state program busy")));
                        }
                    },

                    Some(Control::Resume { loose, done }) => match mode_of(&view) {
                        StateMode::Paused => {
                            set_mode(&view, StateMode::Resuming, &handle);
                            emit(&handle, &view, Vec::new());
                            match resume_parent_served(&handle, &mut control, &mut deferred).await {
                                Err(e) => {
                                    // Parent refused: restore Paused, the
                                    // client may retry.
                                    set_mode(&view, StateMode::Paused, &handle);
                                    emit(&handle, &view, vec![e.notice()]);
                                    let _ = done.send(Err(e));
                                }
                                Ok(()) => {
                                    if settle || !loose {
                                        set_mode(&view, StateMode::ResumingState, &handle);
                                        emit(&handle, &view, Vec::new());
                                        master.state().apply(&lineage, !loose).await?;
                                        set_mode(&view, StateMode::Normal, &handle);
                                    } else {
                                        set_mode(&view, StateMode::Normal, &handle);
                                    }
                                    emit(&handle, &view, Vec::new());
                                    // Cascade downwards so the subtree
                                    // leaves its paused modes.
                                    let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
                                    if handle.forward(
                                        &child_id,
                                        Control::Resume { loose: true, done: ack_tx },
                                    ) {
                                        let _ = await_served(ack_rx, &mut control, &mut deferred)
                                            .await;
                                    }
                                    let _ = done.send(Ok(()));
                                }
                            }
                        }
                        StateMode::Normal => {
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
                        Ok(Point::State { child: Some(point) }) => {
                            handle.forward(&child_id, Control::Jump { point: point.export() });
                        }
                        Ok(Point::State { child: None }) => {}
                        _ => tracing::warn!("state jump point rejected"),
                    },

                    None => control_open = false,
                },
            }
        };

        match mode_of(&view) {
            StateMode::HaltingChildThenState => {
                set_mode(&view, StateMode::HaltingState, &handle);
                emit(&handle, &view, Vec::new());
                master.state().suspend(&lineage).await?;
            }
            StateMode::HaltingChildWhilePaused | StateMode::Paused => {
                // Already suspended; nothing to release.
            }
            _ => {
                set_mode(&view, StateMode::SuspendingState, &handle);
                emit(&handle, &view, Vec::new());
                master.state().suspend(&lineage).await?;
            }
        }

        master.state().remove(handle.id()).await?;
        set_mode(&view, StateMode::Terminated, &handle);
        emit(&handle, &view, Vec::new());

        child_result
    }
}

#[cfg(test)]
#[path = "state_block_tests.rs"]
mod tests;
