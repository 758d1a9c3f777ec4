// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! labrun-runtime: the protocol execution core.
//!
//! A [`Master`] instantiates one program per block of the parsed tree and
//! drives it to completion. Programs coordinate device setpoints through
//! the claim-arbitrated [`state::StateManager`]; segment leaves run
//! [`process::Process`] implementations and couple their event streams
//! with the enclosing state.

pub mod error;
pub mod master;
pub mod process;
pub mod program;
pub mod state;
pub mod sync;

pub use error::ExecError;
pub use master::{Control, HandleId, Master, MasterConfig, ProgramHandle, ProgramOwner, RunCommand};
pub use process::{
    Process, ProcessContext, ProcessControl, ProcessEvent, ProcessFactory, ProcessRegistry,
};
pub use program::{ProgramExecEvent, ProgramLocation};
pub use state::{StateEvent, StateLocation, StateManager, StateRecord};
pub use sync::ManualEvent;
