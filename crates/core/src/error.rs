// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Exportable error records.

use serde::{Deserialize, Serialize};

/// An error attached to an emitted event or a draft, shipped to clients.
///
/// Notices never unwind the program tree; they travel with the location
/// snapshot they describe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub message: String,
    /// Byte range in the draft source, when the error is static.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<(usize, usize)>,
}

impl Notice {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), range: None }
    }

    pub fn with_range(message: impl Into<String>, range: (usize, usize)) -> Self {
        Self { message: message.into(), range: Some(range) }
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}
