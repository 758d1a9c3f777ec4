// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The node contract between device drivers and the runtime core.

use crate::claim::{Claim, ClaimSymbol};
use async_trait::async_trait;
use labrun_core::{NodePath, Value, ValueType};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// Transient driver disconnection; the caller retries after
    /// reconnection.
    #[error("node unavailable")]
    Unavailable,
    /// The node does not support the requested operation.
    #[error("operation not supported")]
    NotSupported,
}

/// Declared capabilities of a node, published to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub readable: bool,
    pub writable: bool,
    #[serde(default)]
    pub nullable: bool,
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// An addressable device endpoint.
#[async_trait]
pub trait Node: Send + Sync {
    fn id(&self) -> &str;

    fn path(&self) -> &NodePath;

    fn spec(&self) -> &NodeSpec;

    fn connected(&self) -> bool;

    /// Watch connection transitions; used to retry writes after a
    /// disconnection.
    fn connection(&self) -> watch::Receiver<bool>;

    /// Refresh the cached value. Returns whether the value changed.
    async fn read(&self) -> Result<bool, NodeError>;

    /// Last value observed or successfully written.
    fn value(&self) -> Value;

    /// Set the node's target value.
    async fn write(&self, value: Value) -> Result<(), NodeError>;

    /// Acquire a write token ordered by `symbol`.
    fn claim(&self, symbol: ClaimSymbol) -> Result<Claim, NodeError>;

    /// Snapshot for the client protocol.
    fn export(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id(),
            "path": self.path(),
            "spec": self.spec(),
            "connected": self.connected(),
            "value": self.value(),
        })
    }
}
