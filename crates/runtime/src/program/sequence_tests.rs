// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::master::{Master, MasterConfig, RunCommand};
use crate::process::ProcessRegistry;
use labrun_core::{Block, SegmentBlock, SequenceBlock, SystemClock};
use labrun_devices::NodeTree;
use std::sync::Arc;
use std::time::Duration;

fn master() -> Master {
    Master::new(MasterConfig {
        nodes: NodeTree::new(),
        processes: ProcessRegistry::builtin(),
        clock: Arc::new(SystemClock),
    })
}

fn timer(duration_ms: u64) -> Block {
    Block::Segment(SegmentBlock {
        namespace: "timer".into(),
        process: serde_json::json!({"duration_ms": duration_ms}),
    })
}

fn sequence(children: Vec<Block>) -> Block {
    Block::Sequence(SequenceBlock { children })
}

fn sequence_locations(master: &Master) -> Vec<SequenceLocation> {
    let mut locations = Vec::new();
    for (_, event) in master.history() {
        if let ProgramLocation::Sequence(location) = &event.location {
            if locations.last() != Some(location) {
                locations.push(location.clone());
            }
        }
    }
    locations
}

async fn wait_until(mut probe: impl FnMut() -> bool, what: &str) {
    for _ in 0..400 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[yare::parameterized(
    pause        = { SequenceMode::Normal, SequenceMode::Paused, true },
    halt         = { SequenceMode::Normal, SequenceMode::Halting, true },
    finish       = { SequenceMode::Normal, SequenceMode::Terminated, true },
    resume       = { SequenceMode::Paused, SequenceMode::Normal, true },
    halt_paused  = { SequenceMode::Paused, SequenceMode::Halting, true },
    halt_done    = { SequenceMode::Halting, SequenceMode::Terminated, true },
    skip_pausing = { SequenceMode::Normal, SequenceMode::Normal, false },
    revive       = { SequenceMode::Terminated, SequenceMode::Normal, false },
    unhalt       = { SequenceMode::Halting, SequenceMode::Normal, false },
)]
fn declared_transitions(from: SequenceMode, to: SequenceMode, legal: bool) {
    assert_eq!(from.may_enter(to), legal);
}

#[tokio::test]
async fn jump_restarts_at_the_target_child() {
    let master = master();
    master.start(sequence(vec![timer(60_000), timer(10)]), labrun_core::EvalStack::new());

    wait_until(
        || sequence_locations(&master).iter().any(|l| l.index == 0),
        "first child to start",
    )
    .await;

    let point = labrun_core::Point::Sequence { index: 1, child: None };
    master.dispatch(&[], RunCommand::Jump { point: point.export() }).unwrap();

    // The short second child runs out on its own.
    master.wait().await.unwrap();

    let locations = sequence_locations(&master);
    assert!(locations.iter().any(|l| l.index == 1));
    assert_eq!(locations.last().map(|l| l.mode), Some(SequenceMode::Terminated));
}

#[tokio::test]
async fn out_of_range_jump_is_ignored() {
    let master = master();
    master.start(sequence(vec![timer(60_000)]), labrun_core::EvalStack::new());
    wait_until(|| !sequence_locations(&master).is_empty(), "sequence to start").await;

    let point = labrun_core::Point::Sequence { index: 0, child: None };
    // Bypass block validation with a raw payload for an invalid index.
    let mut raw = point.export();
    raw["index"] = serde_json::json!(7);
    master.dispatch(&[], RunCommand::Jump { point: raw }).unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(master.is_running());

    master.dispatch(&[], RunCommand::Halt).unwrap();
    master.wait().await.unwrap();
}

#[tokio::test]
async fn pause_and_resume_propagate_to_the_active_child() {
    let master = master();
    master.start(sequence(vec![timer(60_000)]), labrun_core::EvalStack::new());
    wait_until(|| !sequence_locations(&master).is_empty(), "sequence to start").await;

    master.dispatch(&[], RunCommand::Pause).unwrap();
    wait_until(
        || sequence_locations(&master).iter().any(|l| l.mode == SequenceMode::Paused),
        "sequence to pause",
    )
    .await;

    master.dispatch(&[], RunCommand::Resume).unwrap();
    wait_until(
        || {
            sequence_locations(&master)
                .last()
                .is_some_and(|l| l.mode == SequenceMode::Normal)
        },
        "sequence to resume",
    )
    .await;

    master.dispatch(&[], RunCommand::Halt).unwrap();
    master.wait().await.unwrap();
}

#[tokio::test]
async fn resume_while_halting_is_refused() {
    let master = master();
    let owner = master.create_root(sequence(vec![timer(60_000)]));
    let root = owner.handle().id().clone();
    let run = tokio::spawn(owner.run(labrun_core::EvalStack::new()));

    wait_until(|| !sequence_locations(&master).is_empty(), "sequence to start").await;

    // The halt is queued first; the resume meets the Halting mode.
    assert!(master.send_control(&root, Control::Halt));
    let (done, ack) = tokio::sync::oneshot::channel();
    assert!(master.send_control(&root, Control::Resume { loose: false, done }));

    let refusal = ack.await.unwrap_or(Ok(()));
    assert_eq!(refusal, Err(ExecError::ResumeRefused));

    run.await.unwrap().unwrap();
}
