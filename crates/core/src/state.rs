// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Block state: per-namespace unit states with the two lattice operations
//! the runtime relies on.
//!
//! `merge` is the override composition used when an inner block refines an
//! outer one; `split` decomposes a pair of nested states so the outer block
//! reclaims only what the inner block does not keep.

use crate::expr::Expr;
use crate::path::NodePath;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

pub const NAMESPACE_DEVICES: &str = "devices";
pub const NAMESPACE_NAME: &str = "name";

/// Demands of one state block on device nodes: path → value expression.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceDemands(pub BTreeMap<NodePath, Expr>);

impl DeviceDemands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: NodePath, expr: Expr) {
        self.0.insert(path, expr);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodePath, &Expr)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Keyed by dotted path on the wire; JSON maps require string keys.
impl Serialize for DeviceDemands {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (path, expr) in &self.0 {
            map.serialize_entry(&path.to_string(), expr)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DeviceDemands {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DemandsVisitor;

        impl<'de> Visitor<'de> for DemandsVisitor {
            type Value = DeviceDemands;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of dotted node paths to expressions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut demands = DeviceDemands::new();
                while let Some((key, expr)) = access.next_entry::<String, Expr>()? {
                    demands.insert(NodePath::from_dotted(&key), expr);
                }
                Ok(demands)
            }
        }

        deserializer.deserialize_map(DemandsVisitor)
    }
}

/// State owned by one namespace, opaque to every other consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnitState {
    Devices(DeviceDemands),
    Name(String),
}

impl UnitState {
    pub fn namespace(&self) -> &'static str {
        match self {
            UnitState::Devices(_) => NAMESPACE_DEVICES,
            UnitState::Name(_) => NAMESPACE_NAME,
        }
    }

    /// Override composition within one namespace; `over`'s entries win.
    fn merge(&self, over: &UnitState) -> UnitState {
        match (self, over) {
            (UnitState::Devices(base), UnitState::Devices(over)) => {
                let mut merged = base.0.clone();
                for (path, expr) in &over.0 {
                    merged.insert(path.clone(), expr.clone());
                }
                UnitState::Devices(DeviceDemands(merged))
            }
            _ => over.clone(),
        }
    }

    /// Decompose nested same-namespace states: what the outer block must
    /// keep driving, and what the inner block owns.
    fn split(outer: &UnitState, inner: &UnitState) -> (Option<UnitState>, UnitState) {
        match (outer, inner) {
            (UnitState::Devices(outer), UnitState::Devices(inner)) => {
                let kept: BTreeMap<_, _> = outer
                    .0
                    .iter()
                    .filter(|(path, _)| !inner.0.contains_key(*path))
                    .map(|(path, expr)| (path.clone(), expr.clone()))
                    .collect();
                let kept = if kept.is_empty() {
                    None
                } else {
                    Some(UnitState::Devices(DeviceDemands(kept)))
                };
                (kept, UnitState::Devices(inner.clone()))
            }
            _ => (None, inner.clone()),
        }
    }
}

/// Mapping namespace → unit state. An absent namespace is the null entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockState(BTreeMap<String, UnitState>);

impl BlockState {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, state: UnitState) {
        self.0.insert(state.namespace().to_string(), state);
    }

    pub fn with(mut self, state: UnitState) -> Self {
        self.insert(state);
        self
    }

    pub fn get(&self, namespace: &str) -> Option<&UnitState> {
        self.0.get(namespace)
    }

    pub fn devices(&self) -> Option<&DeviceDemands> {
        match self.0.get(NAMESPACE_DEVICES) {
            Some(UnitState::Devices(demands)) => Some(demands),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self.0.get(NAMESPACE_NAME) {
            Some(UnitState::Name(name)) => Some(name),
            _ => None,
        }
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge-override: `over`'s non-null entries win, others fall back to
    /// `self`. Identity w.r.t. `BlockState::empty()` and associative.
    pub fn merge(&self, over: &BlockState) -> BlockState {
        let mut result = self.0.clone();
        for (namespace, unit) in &over.0 {
            let merged = match result.get(namespace) {
                Some(base) => base.merge(unit),
                None => unit.clone(),
            };
            result.insert(namespace.clone(), merged);
        }
        BlockState(result)
    }

    /// Split against a nested inner state: returns `(outer', inner')` where
    /// `outer'` holds only what `inner` does not keep.
    pub fn split(&self, inner: &BlockState) -> (BlockState, BlockState) {
        let mut outer_result = BTreeMap::new();
        let mut inner_result = inner.0.clone();

        for (namespace, outer_unit) in &self.0 {
            match inner.0.get(namespace) {
                Some(inner_unit) => {
                    let (kept, owned) = UnitState::split(outer_unit, inner_unit);
                    if let Some(kept) = kept {
                        outer_result.insert(namespace.clone(), kept);
                    }
                    inner_result.insert(namespace.clone(), owned);
                }
                None => {
                    outer_result.insert(namespace.clone(), outer_unit.clone());
                }
            }
        }

        (BlockState(outer_result), BlockState(inner_result))
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
