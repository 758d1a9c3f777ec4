// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node registry, the executor contract, and per-chip runners.
//!
//! Executors own driver connections and register their nodes during host
//! initialization; the registry is the single lookup point for programs.
//! For every chip, each executor creates a [`UnitRunner`] that handles the
//! namespace's manual commands and exports its chip-local state.

use crate::node::{Node, NodeError};
use async_trait::async_trait;
use labrun_core::NodePath;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Process-wide registry of device nodes, keyed by path.
#[derive(Clone, Default)]
pub struct NodeTree {
    nodes: Arc<Mutex<BTreeMap<NodePath, Arc<dyn Node>>>>,
}

impl NodeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: Arc<dyn Node>) {
        self.nodes.lock().insert(node.path().clone(), node);
    }

    pub fn find(&self, path: &NodePath) -> Option<Arc<dyn Node>> {
        self.nodes.lock().get(path).cloned()
    }

    /// Find a node and require it to be writable.
    pub fn find_writable(&self, path: &NodePath) -> Result<Arc<dyn Node>, NodeError> {
        let node = self.find(path).ok_or(NodeError::NotSupported)?;
        if !node.spec().writable {
            return Err(NodeError::NotSupported);
        }
        Ok(node)
    }

    pub fn all(&self) -> Vec<Arc<dyn Node>> {
        self.nodes.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }
}

/// Chip-side companion of an executor: receives the namespace's manual
/// commands and exports chip-local state into the snapshot.
#[async_trait]
pub trait UnitRunner: Send + Sync {
    fn namespace(&self) -> &str;

    /// Handle one client command payload for this namespace.
    async fn command(&self, payload: &serde_json::Value) -> Result<(), NodeError>;

    /// Snapshot for the client protocol.
    fn export(&self) -> serde_json::Value;
}

/// A unit executor: owns driver connections for one namespace and registers
/// the nodes they expose.
#[async_trait]
pub trait DeviceExecutor: Send + Sync {
    fn namespace(&self) -> &str;

    /// Connect to hardware and register nodes. Called once at host startup.
    async fn initialize(&self, tree: &NodeTree) -> Result<(), NodeError>;

    /// Disconnect and drop registrations. Called once at host shutdown.
    async fn destroy(&self);

    /// Runner for one chip; called whenever a chip is created.
    fn create_runner(&self, chip_id: &str) -> Arc<dyn UnitRunner>;

    /// Snapshot for the client protocol.
    fn export(&self) -> serde_json::Value;
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
