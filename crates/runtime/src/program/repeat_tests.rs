// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::master::{Master, MasterConfig, RunCommand};
use crate::process::ProcessRegistry;
use labrun_core::{Block, RepeatCount, SegmentBlock, SystemClock};
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

fn repeat(count: RepeatCount, child: Block) -> Block {
    Block::Repeat(Box::new(RepeatBlock { count, child }))
}

fn repeat_locations(master: &Master) -> Vec<RepeatLocation> {
    let mut locations = Vec::new();
    for (_, event) in master.history() {
        if let ProgramLocation::Repeat(location) = &event.location {
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
    pause       = { RepeatMode::Normal, RepeatMode::Paused, true },
    halt        = { RepeatMode::Normal, RepeatMode::Halting, true },
    finish      = { RepeatMode::Normal, RepeatMode::Terminated, true },
    resume      = { RepeatMode::Paused, RepeatMode::Normal, true },
    halt_paused = { RepeatMode::Paused, RepeatMode::Halting, true },
    halt_done   = { RepeatMode::Halting, RepeatMode::Terminated, true },
    revive      = { RepeatMode::Terminated, RepeatMode::Paused, false },
    unhalt      = { RepeatMode::Halting, RepeatMode::Normal, false },
)]
fn declared_transitions(from: RepeatMode, to: RepeatMode, legal: bool) {
    assert_eq!(from.may_enter(to), legal);
}

#[tokio::test]
async fn jump_reindexes_the_iteration() {
    let master = master();
    master.start(repeat(RepeatCount::Times(3), timer(60_000)), labrun_core::EvalStack::new());
    wait_until(
        || repeat_locations(&master).iter().any(|l| l.iteration == 0),
        "first iteration to start",
    )
    .await;

    let point = labrun_core::Point::Repeat { iteration: 2, child: None };
    master.dispatch(&[], RunCommand::Jump { point: point.export() }).unwrap();

    wait_until(
        || repeat_locations(&master).iter().any(|l| l.iteration == 2),
        "jump to iteration 2",
    )
    .await;

    master.dispatch(&[], RunCommand::Halt).unwrap();
    master.wait().await.unwrap();
    assert_eq!(repeat_locations(&master).last().map(|l| l.mode), Some(RepeatMode::Terminated));
}

#[tokio::test]
async fn jump_past_the_count_is_ignored() {
    let master = master();
    master.start(repeat(RepeatCount::Times(2), timer(60_000)), labrun_core::EvalStack::new());
    wait_until(|| !repeat_locations(&master).is_empty(), "repeat to start").await;

    let point = labrun_core::Point::Repeat { iteration: 9, child: None };
    master.dispatch(&[], RunCommand::Jump { point: point.export() }).unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(master.is_running());
    assert!(!repeat_locations(&master).iter().any(|l| l.iteration == 9));

    master.dispatch(&[], RunCommand::Halt).unwrap();
    master.wait().await.unwrap();
}

#[tokio::test]
async fn pause_and_resume_carry_the_iteration() {
    let master = master();
    master.start(repeat(RepeatCount::Forever, timer(60_000)), labrun_core::EvalStack::new());
    wait_until(|| !repeat_locations(&master).is_empty(), "repeat to start").await;

    master.dispatch(&[], RunCommand::Pause).unwrap();
    wait_until(
        || repeat_locations(&master).iter().any(|l| l.mode == RepeatMode::Paused),
        "repeat to pause",
    )
    .await;

    master.dispatch(&[], RunCommand::Resume).unwrap();
    wait_until(
        || repeat_locations(&master).last().is_some_and(|l| l.mode == RepeatMode::Normal),
        "repeat to resume",
    )
    .await;
    // Pausing never advanced the iteration.
    assert!(repeat_locations(&master).iter().all(|l| l.iteration == 0));

    master.dispatch(&[], RunCommand::Halt).unwrap();
    master.wait().await.unwrap();
}

#[tokio::test]
async fn resume_while_halting_is_refused() {
    let master = master();
    let owner = master.create_root(repeat(RepeatCount::Forever, timer(60_000)));
    let root = owner.handle().id().clone();
    let run = tokio::spawn(owner.run(labrun_core::EvalStack::new()));

    wait_until(|| !repeat_locations(&master).is_empty(), "repeat to start").await;

    assert!(master.send_control(&root, Control::Halt));
    let (done, ack) = tokio::sync::oneshot::channel();
    assert!(master.send_control(&root, Control::Resume { loose: false, done }));

    let refusal = ack.await.unwrap_or(Ok(()));
    assert_eq!(refusal, Err(ExecError::ResumeRefused));

    run.await.unwrap().unwrap();
}
