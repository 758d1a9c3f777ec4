// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime execution errors.
//!
//! Every kind except `Internal` is recoverable: it rides along with the
//! emitted event and reaches the client snapshot without unwinding the
//! program tree.

use labrun_core::{EvalError, NodePath, Notice};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecError {
    /// Transient driver disconnection, retried at the node-lifecycle layer.
    #[error("disconnected node '{0}'")]
    NodeUnavailable(NodePath),

    /// A higher-priority holder owns the node.
    #[error("unclaimable node '{0}'")]
    NodeUnclaimable(NodePath),

    /// An expression failed to evaluate; the candidate is dropped.
    #[error("evaluation failed: {0}")]
    Evaluation(#[from] EvalError),

    #[error("unknown process namespace '{0}'")]
    UnknownProcess(String),

    #[error("malformed process data: {0}")]
    ProcessData(String),

    /// The parent refused to resume; the requester restores `Paused`.
    #[error("parent cannot resume")]
    ResumeRefused,

    /// Programming error in the core; the only kind that aborts a master.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecError {
    pub fn internal(message: impl Into<String>) -> Self {
        ExecError::Internal(message.into())
    }

    /// Exportable record for the client snapshot.
    pub fn notice(&self) -> Notice {
        Notice::new(self.to_string())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecError::Internal(_))
    }
}
