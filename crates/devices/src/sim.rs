// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Simulated devices.
//!
//! Stands in for hardware drivers: nodes hold their value in memory, log
//! every accepted write, and can be disconnected and reconnected to
//! exercise the retry path.

use crate::claim::{Claim, ClaimSymbol, Claimable};
use crate::node::{Node, NodeError, NodeSpec};
use crate::registry::{DeviceExecutor, NodeTree, UnitRunner};
use async_trait::async_trait;
use labrun_core::{NodePath, Value, ValueType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::sync::Arc;
use tokio::sync::watch;

/// One simulated node from the executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimNodeConfig {
    /// Dotted path, e.g. `sim.valve`.
    pub path: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimExecutorConfig {
    #[serde(default)]
    pub nodes: Vec<SimNodeConfig>,
}

struct SimNodeState {
    value: Value,
    writes: Vec<Value>,
}

/// In-memory writable node with a write log.
pub struct SimNode {
    id: String,
    path: NodePath,
    spec: NodeSpec,
    connected: watch::Sender<bool>,
    state: Mutex<SimNodeState>,
    claims: Claimable,
}

impl SimNode {
    pub fn new(path: NodePath, value_type: ValueType, nullable: bool) -> Arc<Self> {
        let id = path.to_string();
        Arc::new(Self {
            id,
            path,
            spec: NodeSpec {
                readable: true,
                writable: true,
                nullable,
                value_type,
                label: None,
            },
            connected: watch::channel(true).0,
            state: Mutex::new(SimNodeState { value: Value::Null, writes: Vec::new() }),
            claims: Claimable::new(),
        })
    }

    /// Numeric node without range limits.
    pub fn numeric(path: &str) -> Arc<Self> {
        Self::new(
            NodePath::from_dotted(path),
            ValueType::Numeric { unit: None, range: None, resolution: None },
            false,
        )
    }

    pub fn from_config(config: &SimNodeConfig) -> Arc<Self> {
        Self::new(NodePath::from_dotted(&config.path), config.value_type.clone(), config.nullable)
    }

    /// Toggle the simulated connection.
    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    /// Every accepted write, in order.
    pub fn writes(&self) -> Vec<Value> {
        self.state.lock().writes.clone()
    }

    /// The node's claim arbiter, for tests that preempt externally.
    pub fn claims(&self) -> &Claimable {
        &self.claims
    }
}

#[async_trait]
impl Node for SimNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn path(&self) -> &NodePath {
        &self.path
    }

    fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    fn connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn connection(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    async fn read(&self) -> Result<bool, NodeError> {
        if !self.connected() {
            return Err(NodeError::Unavailable);
        }
        Ok(false)
    }

    fn value(&self) -> Value {
        self.state.lock().value.clone()
    }

    async fn write(&self, value: Value) -> Result<(), NodeError> {
        if value.is_null() && !self.spec.nullable {
            return Err(NodeError::NotSupported);
        }
        if !self.connected() {
            return Err(NodeError::Unavailable);
        }
        let mut state = self.state.lock();
        tracing::debug!(node = %self.path, %value, "sim write");
        state.value = value.clone();
        state.writes.push(value);
        Ok(())
    }

    fn claim(&self, symbol: ClaimSymbol) -> Result<Claim, NodeError> {
        if !self.spec.writable {
            return Err(NodeError::NotSupported);
        }
        Ok(self.claims.claim(symbol))
    }
}

/// Executor wrapping a set of simulated nodes.
pub struct SimExecutor {
    namespace: String,
    nodes: Vec<Arc<SimNode>>,
}

impl SimExecutor {
    pub fn new(namespace: impl Into<String>, nodes: Vec<Arc<SimNode>>) -> Self {
        Self { namespace: namespace.into(), nodes }
    }

    pub fn from_config(namespace: impl Into<String>, config: &SimExecutorConfig) -> Self {
        let nodes = config.nodes.iter().map(SimNode::from_config).collect();
        Self::new(namespace, nodes)
    }

    pub fn nodes(&self) -> &[Arc<SimNode>] {
        &self.nodes
    }
}

#[async_trait]
impl DeviceExecutor for SimExecutor {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn initialize(&self, tree: &NodeTree) -> Result<(), NodeError> {
        for node in &self.nodes {
            tree.register(Arc::clone(node) as Arc<dyn Node>);
        }
        tracing::info!(namespace = %self.namespace, nodes = self.nodes.len(), "sim executor ready");
        Ok(())
    }

    async fn destroy(&self) {}

    fn create_runner(&self, chip_id: &str) -> Arc<dyn UnitRunner> {
        Arc::new(SimRunner {
            namespace: self.namespace.clone(),
            chip: chip_id.to_string(),
            nodes: self.nodes.clone(),
        })
    }

    fn export(&self) -> serde_json::Value {
        serde_json::json!({
            "namespace": self.namespace,
            "nodes": self.nodes.iter().map(|n| n.export()).collect::<Vec<_>>(),
        })
    }
}

/// Chip companion for the simulated namespace. Commands take the shape
/// `{set: {<path>: <value>}}`; each write claims the node above any
/// running plan, writes, and releases.
pub struct SimRunner {
    namespace: String,
    chip: String,
    nodes: Vec<Arc<SimNode>>,
}

impl SimRunner {
    fn find(&self, path: &NodePath) -> Option<&Arc<SimNode>> {
        self.nodes.iter().find(|node| node.path() == path)
    }
}

#[async_trait]
impl UnitRunner for SimRunner {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn command(&self, payload: &Json) -> Result<(), NodeError> {
        let Some(sets) = payload.get("set").and_then(Json::as_object) else {
            return Ok(());
        };
        for (path, value) in sets {
            let path = NodePath::from_dotted(path);
            let node = self.find(&path).ok_or(NodeError::NotSupported)?;
            let value: Value =
                serde_json::from_value(value.clone()).map_err(|_| NodeError::NotSupported)?;

            // Manual claims outrank the state manager's.
            let mut claim = node.claim(ClaimSymbol::root().child(1))?;
            claim.wait().await;
            let written = node.write(value).await;
            drop(claim);
            written?;
            tracing::debug!(chip = %self.chip, node = %path, "manual write");
        }
        Ok(())
    }

    fn export(&self) -> Json {
        let values: serde_json::Map<String, Json> = self
            .nodes
            .iter()
            .map(|node| {
                (node.path().to_string(), serde_json::to_value(node.value()).unwrap_or(Json::Null))
            })
            .collect();
        serde_json::json!({
            "chip": self.chip,
            "values": values,
        })
    }
}

#[cfg(test)]
#[path = "sim_tests.rs"]
mod tests;
