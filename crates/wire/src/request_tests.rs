// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn start_plan_decodes_with_camel_case_fields() {
    let message = decode_message(
        r#"{"type":"startPlan","chipId":"chp-1","draftId":"d1","codes":{"flow":2}}"#,
    )
    .unwrap();
    assert_eq!(
        message,
        ClientMessage::StartPlan {
            chip_id: "chp-1".into(),
            draft_id: "d1".into(),
            codes: serde_json::json!({"flow": 2}),
        }
    );
}

#[test]
fn controls_default_to_the_root_path() {
    let message = decode_message(r#"{"type":"pause","chipId":"chp-1"}"#).unwrap();
    assert_eq!(message, ClientMessage::Pause { chip_id: "chp-1".into(), path: Vec::new() });

    let message = decode_message(r#"{"type":"halt","chipId":"chp-1","path":[0,2]}"#).unwrap();
    assert_eq!(message, ClientMessage::Halt { chip_id: "chp-1".into(), path: vec![0, 2] });
}

#[test]
fn jump_carries_a_point() {
    let message = decode_message(
        r#"{"type":"jump","chipId":"chp-1","path":[0],"point":{"kind":"segment"}}"#,
    )
    .unwrap();
    match message {
        ClientMessage::Jump { point, .. } => assert_eq!(point["kind"], "segment"),
        other => panic!("unexpected message: {other:?}"),
    }
}

#[test]
fn command_routes_by_namespace() {
    let message = decode_message(
        r#"{"type":"command","chipId":"chp-1","command":{"sim":{"set":{"sim.valve":4}}}}"#,
    )
    .unwrap();
    match message {
        ClientMessage::Command { command, .. } => {
            assert!(command.contains_key("sim"));
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[test]
fn unknown_type_is_rejected() {
    assert!(decode_message(r#"{"type":"reboot"}"#).is_err());
}

#[test]
fn serialization_round_trips() {
    let message = ClientMessage::CreateDraft { draft_id: "d1".into(), source: "steps: []".into() };
    let json = serde_json::to_string(&message).unwrap();
    assert!(json.contains("\"type\":\"createDraft\""));
    assert!(json.contains("\"draftId\":\"d1\""));
    assert_eq!(decode_message(&json).unwrap(), message);
}
