// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Message from a client to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Manual device command, routed to one namespace's runner.
    Command {
        chip_id: String,
        command: BTreeMap<String, Json>,
    },

    CreateChip {
        model_id: String,
    },

    DeleteChip {
        chip_id: String,
    },

    CreateDraft {
        draft_id: String,
        source: String,
    },

    StartPlan {
        chip_id: String,
        draft_id: String,
        #[serde(default)]
        codes: Json,
    },

    SetMatrix {
        chip_id: String,
        update: BTreeMap<String, Json>,
    },

    // Running-program controls, addressed by handle path.
    Halt {
        chip_id: String,
        #[serde(default)]
        path: Vec<u32>,
    },

    Pause {
        chip_id: String,
        #[serde(default)]
        path: Vec<u32>,
    },

    Resume {
        chip_id: String,
        #[serde(default)]
        path: Vec<u32>,
    },

    Jump {
        chip_id: String,
        #[serde(default)]
        path: Vec<u32>,
        point: Json,
    },
}

/// Parse one newline-delimited message.
pub fn decode_message(line: &str) -> Result<ClientMessage, WireError> {
    Ok(serde_json::from_str(line)?)
}

#[cfg(test)]
#[path = "request_tests.rs"]
mod tests;
