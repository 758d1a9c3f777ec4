// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Block programs: one mode machine per block kind.
//!
//! Programs run on their own tasks and exchange acknowledged controls, so
//! a parent awaiting a child's ack keeps servicing its own control queue —
//! the resume handshake climbs up through `resume_parent` while the
//! initiator's queue keeps draining.

pub(crate) mod parallel;
pub(crate) mod repeat;
pub(crate) mod segment;
pub(crate) mod sequence;
pub(crate) mod state_block;

pub use parallel::{ParallelLocation, ParallelMode};
pub use repeat::{RepeatLocation, RepeatMode};
pub use segment::{SegmentLocation, SegmentMode};
pub use sequence::{SequenceLocation, SequenceMode};
pub use state_block::{StateBlockLocation, StateMode};

use crate::error::ExecError;
use crate::master::{AckRx, Control, ControlRx, ProgramHandle};
use async_trait::async_trait;
use labrun_core::{Block, EvalStack, Notice};
use serde::Serialize;
use serde_json::Value as Json;

/// Location of one program, per block kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgramLocation {
    Segment(SegmentLocation),
    State(StateBlockLocation),
    Sequence(SequenceLocation),
    Parallel(ParallelLocation),
    Repeat(RepeatLocation),
}

impl ProgramLocation {
    pub fn export(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Null)
    }
}

/// One emission of a running program.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramExecEvent {
    pub location: ProgramLocation,
    pub time_ms: u64,
    pub stopped: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Notice>,
}

/// Runtime instance of a block.
#[async_trait]
pub(crate) trait Program: Send {
    async fn run(self: Box<Self>) -> Result<(), ExecError>;
}

/// Instantiate and run the program for `block`.
pub(crate) async fn run_block(
    block: Block,
    handle: ProgramHandle,
    control: ControlRx,
    stack: EvalStack,
) -> Result<(), ExecError> {
    match block {
        Block::Segment(block) => {
            Box::new(segment::SegmentProgram::new(block, handle, control, stack)).run().await
        }
        Block::State(block) => {
            Box::new(state_block::StateProgram::new(*block, handle, control, stack)).run().await
        }
        Block::Sequence(block) => {
            Box::new(sequence::SequenceProgram::new(block, handle, control, stack)).run().await
        }
        Block::Parallel(block) => {
            Box::new(parallel::ParallelProgram::new(block, handle, control, stack)).run().await
        }
        Block::Repeat(block) => {
            Box::new(repeat::RepeatProgram::new(*block, handle, control, stack)).run().await
        }
    }
}

/// Controls deferred while a program is mid-transition.
#[derive(Debug, Default)]
pub(crate) struct Deferred {
    pub halt: bool,
}

/// Acknowledge controls that arrive while this program is itself waiting
/// on another program's ack; a halt is remembered for afterwards.
pub(crate) fn answer_while_busy(control: Control, deferred: &mut Deferred) {
    match control {
        Control::Halt => deferred.halt = true,
        Control::Pause { done, .. } => {
            tracing::debug!("pause acknowledged mid-transition");
            let _ = done.send(Ok(()));
        }
        Control::Resume { done, .. } => {
            let _ = done.send(Ok(()));
        }
        Control::Jump { .. } => {
            tracing::warn!("jump ignored mid-transition");
        }
    }
}

/// Await an ack while servicing this program's own control queue. A
/// dropped sender (the peer terminated first) counts as acknowledged.
pub(crate) async fn await_served(
    mut ack: AckRx,
    control: &mut ControlRx,
    deferred: &mut Deferred,
) -> Result<(), ExecError> {
    loop {
        tokio::select! {
            result = &mut ack => {
                return result.unwrap_or(Ok(()));
            }
            message = control.recv() => match message {
                Some(message) => answer_while_busy(message, deferred),
                None => {
                    return ack.await.unwrap_or(Ok(()));
                }
            }
        }
    }
}

/// Pause every child and wait for each to reach a paused mode.
pub(crate) async fn pause_children_served(
    handle: &ProgramHandle,
    control: &mut ControlRx,
    deferred: &mut Deferred,
) -> Result<(), ExecError> {
    for ack in handle.request_pause_children() {
        await_served(ack, control, deferred).await?;
    }
    Ok(())
}

/// Ask the parent to reach `Normal` before proceeding.
pub(crate) async fn resume_parent_served(
    handle: &ProgramHandle,
    control: &mut ControlRx,
    deferred: &mut Deferred,
) -> Result<(), ExecError> {
    match handle.request_resume_parent() {
        Some(ack) => await_served(ack, control, deferred).await,
        None => Ok(()),
    }
}
