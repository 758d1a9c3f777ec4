// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::master::{Master, MasterConfig, RunCommand};
use crate::process::ProcessRegistry;
use labrun_core::{Block, ParallelBlock, SegmentBlock, SystemClock};
use labrun_devices::NodeTree;
use std::collections::BTreeMap;
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

fn parallel(children: Vec<Block>) -> Block {
    Block::Parallel(ParallelBlock { children })
}

fn parallel_modes(master: &Master) -> Vec<ParallelMode> {
    let mut modes = Vec::new();
    for (_, event) in master.history() {
        if let ProgramLocation::Parallel(location) = &event.location {
            if modes.last() != Some(&location.mode) {
                modes.push(location.mode);
            }
        }
    }
    modes
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
    pause       = { ParallelMode::Normal, ParallelMode::Paused, true },
    halt        = { ParallelMode::Normal, ParallelMode::Halting, true },
    finish      = { ParallelMode::Normal, ParallelMode::Terminated, true },
    resume      = { ParallelMode::Paused, ParallelMode::Normal, true },
    halt_paused = { ParallelMode::Paused, ParallelMode::Halting, true },
    halt_done   = { ParallelMode::Halting, ParallelMode::Terminated, true },
    end_paused  = { ParallelMode::Paused, ParallelMode::Terminated, true },
    revive      = { ParallelMode::Terminated, ParallelMode::Normal, false },
    unhalt      = { ParallelMode::Halting, ParallelMode::Paused, false },
)]
fn declared_transitions(from: ParallelMode, to: ParallelMode, legal: bool) {
    assert_eq!(from.may_enter(to), legal);
}

#[tokio::test]
async fn jump_forwards_points_to_each_branch() {
    let master = master();
    master.start(parallel(vec![timer(60_000), timer(60_000)]), labrun_core::EvalStack::new());
    wait_until(|| !parallel_modes(&master).is_empty(), "branches to start").await;

    let children: BTreeMap<u32, labrun_core::Point> = [
        (0u32, labrun_core::Point::Segment { process: Some(serde_json::json!({"remaining_ms": 5})) }),
        (1u32, labrun_core::Point::Segment { process: Some(serde_json::json!({"remaining_ms": 5})) }),
    ]
    .into_iter()
    .collect();
    let point = labrun_core::Point::Parallel { children };
    master.dispatch(&[], RunCommand::Jump { point: point.export() }).unwrap();

    // Both shortened branches run out; termination waits for all of them.
    master.wait().await.unwrap();
    assert_eq!(parallel_modes(&master).last(), Some(&ParallelMode::Terminated));
}

#[tokio::test]
async fn pause_and_resume_broadcast_to_all_branches() {
    let master = master();
    master.start(parallel(vec![timer(60_000), timer(60_000)]), labrun_core::EvalStack::new());
    wait_until(|| !parallel_modes(&master).is_empty(), "branches to start").await;

    master.dispatch(&[], RunCommand::Pause).unwrap();
    wait_until(
        || parallel_modes(&master).contains(&ParallelMode::Paused),
        "both branches to pause",
    )
    .await;

    master.dispatch(&[], RunCommand::Resume).unwrap();
    wait_until(
        || parallel_modes(&master).last() == Some(&ParallelMode::Normal),
        "both branches to resume",
    )
    .await;

    master.dispatch(&[], RunCommand::Halt).unwrap();
    master.wait().await.unwrap();
    let modes = parallel_modes(&master);
    assert!(modes.contains(&ParallelMode::Halting));
    assert_eq!(modes.last(), Some(&ParallelMode::Terminated));
}

#[tokio::test]
async fn resume_while_halting_is_refused() {
    let master = master();
    let owner = master.create_root(parallel(vec![timer(60_000)]));
    let root = owner.handle().id().clone();
    let run = tokio::spawn(owner.run(labrun_core::EvalStack::new()));

    wait_until(|| !parallel_modes(&master).is_empty(), "branch to start").await;

    assert!(master.send_control(&root, Control::Halt));
    let (done, ack) = tokio::sync::oneshot::channel();
    assert!(master.send_control(&root, Control::Resume { loose: false, done }));

    let refusal = ack.await.unwrap_or(Ok(()));
    assert_eq!(refusal, Err(ExecError::ResumeRefused));

    run.await.unwrap().unwrap();
}
