// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! labrun-wire: the client protocol.
//!
//! Wire format: newline-delimited JSON over a bidirectional channel.
//! Clients send [`ClientMessage`]s; the host answers every state change
//! with one full [`Snapshot`].

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod request;
mod snapshot;

pub use request::{decode_message, ClientMessage, WireError};
pub use snapshot::{ChipSnapshot, HostInfo, Snapshot};
