// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! labrun-core: shared data model for the labrun protocol runtime.
//!
//! Blocks, block state, expressions, node paths and values, program points,
//! plus the small ambient pieces (ids, clock, error notices) every other
//! crate leans on.

pub mod macros;

pub mod block;
pub mod clock;
pub mod error;
pub mod expr;
pub mod id;
pub mod path;
pub mod state;
pub mod value;

pub use block::{
    Block, ParallelBlock, Point, PointError, RepeatBlock, RepeatCount, SegmentBlock,
    SequenceBlock, StateBlock,
};
pub use clock::{Clock, FakeClock, SystemClock};
pub use error::Notice;
pub use expr::{EvalError, EvalStack, Expr};
pub use path::NodePath;
pub use state::{BlockState, DeviceDemands, UnitState, NAMESPACE_DEVICES, NAMESPACE_NAME};
pub use value::{Value, ValueType};
