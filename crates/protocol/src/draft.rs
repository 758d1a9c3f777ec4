// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Drafts: a protocol source plus its parse outcome.

use crate::parser::{parse_protocol, ParsedProtocol};
use labrun_core::Notice;

/// A client-submitted protocol source. Parse errors never reach the
/// runtime; they are reported back on the draft.
#[derive(Debug, Clone)]
pub struct Draft {
    pub id: String,
    pub source: String,
    pub protocol: Option<ParsedProtocol>,
    pub errors: Vec<Notice>,
}

impl Draft {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        let source = source.into();
        let (protocol, errors) = match parse_protocol(&source) {
            Ok(protocol) => (Some(protocol), Vec::new()),
            Err(errors) => (None, errors.iter().map(|e| e.notice()).collect()),
        };
        Self { id: id.into(), source, protocol, errors }
    }

    pub fn is_valid(&self) -> bool {
        self.protocol.is_some()
    }

    pub fn export(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "source": self.source,
            "errors": self.errors,
            "protocol": self.protocol.as_ref().map(|p| p.export()),
        })
    }
}

#[cfg(test)]
#[path = "draft_tests.rs"]
mod tests;
