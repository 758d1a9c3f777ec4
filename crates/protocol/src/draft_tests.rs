// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn valid_source_yields_protocol() {
    let draft = Draft::new("d1", "steps:\n  - noop: {}\n");
    assert!(draft.is_valid());
    assert!(draft.errors.is_empty());

    let json = draft.export();
    assert_eq!(json["id"], "d1");
    assert_eq!(json["protocol"]["root"]["kind"], "sequence");
}

#[test]
fn invalid_source_yields_errors() {
    let draft = Draft::new("d2", "steps:\n  - {}\n");
    assert!(!draft.is_valid());
    assert!(!draft.errors.is_empty());

    let json = draft.export();
    assert!(json["protocol"].is_null());
    assert!(json["errors"][0]["message"].as_str().unwrap().contains("missing process"));
}
