// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub id: String,
    pub name: String,
    pub start_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChipSnapshot {
    pub id: String,
    pub name: String,
    pub model_id: String,
    /// Recursive program location tree while a plan runs.
    pub master: Option<Json>,
    pub matrices: BTreeMap<String, Json>,
    pub runners: BTreeMap<String, Json>,
}

/// Full host state, sent after every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub info: HostInfo,
    pub chips: BTreeMap<String, ChipSnapshot>,
    pub models: BTreeMap<String, Json>,
    pub devices: BTreeMap<String, Json>,
    pub drafts: BTreeMap<String, Json>,
    pub executors: BTreeMap<String, Json>,
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
