// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios: YAML drafts through the parser, run against
//! simulated devices, observing mode sequences, write logs and settling.

use labrun_core::{EvalStack, Value};
use labrun_devices::{Node, NodeTree, SimNode};
use labrun_protocol::parse_protocol;
use labrun_runtime::program::{SegmentMode, StateMode};
use labrun_runtime::{Master, MasterConfig, ProcessRegistry, ProgramLocation, RunCommand};
use std::sync::Arc;
use std::time::Duration;

fn bench() -> (Master, Arc<SimNode>) {
    let tree = NodeTree::new();
    let valve = SimNode::numeric("sim.valve");
    tree.register(valve.clone());
    let master = Master::new(MasterConfig {
        nodes: tree,
        processes: ProcessRegistry::builtin(),
        clock: Arc::new(labrun_core::SystemClock),
    });
    (master, valve)
}

fn start(master: &Master, source: &str) {
    let protocol = parse_protocol(source).expect("scenario protocol must parse");
    master.start(protocol.root, EvalStack::new());
}

fn numbers(values: &[Value]) -> Vec<f64> {
    values.iter().filter_map(Value::as_number).collect()
}

fn state_modes(master: &Master) -> Vec<StateMode> {
    let mut modes = Vec::new();
    for (_, event) in master.history() {
        if let ProgramLocation::State(location) = &event.location {
            if modes.last() != Some(&location.mode) {
                modes.push(location.mode);
            }
        }
    }
    modes
}

fn segment_modes(master: &Master) -> Vec<SegmentMode> {
    let mut modes = Vec::new();
    for (_, event) in master.history() {
        if let ProgramLocation::Segment(location) = &event.location {
            if modes.last() != Some(&location.mode) {
                modes.push(location.mode);
            }
        }
    }
    modes
}

async fn wait_until(mut probe: impl FnMut() -> bool, what: &str) {
    for _ in 0..600 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Scenario 1: a single step setting one node runs and settles.
#[tokio::test]
async fn single_segment_writes_and_settles() {
    let (master, valve) = bench();
    start(&master, "steps:\n  - devices:\n      sim.valve: 3\n    noop: {}\n");
    master.wait().await.unwrap();

    assert_eq!(numbers(&valve.writes()), vec![3.0]);

    let modes = segment_modes(&master);
    assert!(modes.contains(&SegmentMode::Normal));
    assert_eq!(modes.last(), Some(&SegmentMode::Terminated));

    // The state location reported fully settled before winding down.
    let settled_seen = master.history().iter().any(|(_, event)| match &event.location {
        ProgramLocation::State(location) => location
            .state
            .as_ref()
            .and_then(|state| state.as_object())
            .is_some_and(|entries| {
                !entries.is_empty()
                    && entries.values().all(|entry| entry["settled"] == true)
            }),
        _ => false,
    });
    assert!(settled_seen);
}

/// Scenario 2: a settling state applies before its segment starts.
#[tokio::test]
async fn settling_state_applies_first() {
    let (master, valve) = bench();
    start(&master, "steps:\n  - devices:\n      sim.valve: 7\n    settle: true\n    noop: {}\n");
    master.wait().await.unwrap();

    assert_eq!(numbers(&valve.writes()), vec![7.0]);
    assert_eq!(
        state_modes(&master),
        vec![
            StateMode::ApplyingState,
            StateMode::Normal,
            StateMode::SuspendingState,
            StateMode::Terminated,
        ]
    );

    let history = master.history();
    let first_segment = history
        .iter()
        .position(|(_, e)| matches!(e.location, ProgramLocation::Segment(_)))
        .unwrap();
    let state_settled = history
        .iter()
        .position(|(_, e)| {
            matches!(&e.location, ProgramLocation::State(l) if l.mode == StateMode::Normal)
        })
        .unwrap();
    assert!(state_settled < first_segment);
}

/// Scenario 3: sequential states write in order, the first terminating
/// before the second applies.
#[tokio::test]
async fn sequential_states_write_in_order() {
    let (master, valve) = bench();
    start(
        &master,
        "steps:\n  - devices:\n      sim.valve: 1\n    settle: true\n    noop: {}\n  - devices:\n      sim.valve: 2\n    settle: true\n    noop: {}\n",
    );
    master.wait().await.unwrap();

    assert_eq!(numbers(&valve.writes()), vec![1.0, 2.0]);

    let modes = state_modes(&master);
    let terminated = modes.iter().position(|m| *m == StateMode::Terminated).unwrap();
    let second_applying = modes
        .iter()
        .enumerate()
        .filter(|(_, m)| **m == StateMode::ApplyingState)
        .map(|(at, _)| at)
        .nth(1)
        .unwrap();
    assert!(terminated < second_applying);
}

/// Scenario 4: a deeper state overrides its ancestor and the ancestor's
/// value is restored when the inner block ends.
#[tokio::test]
async fn nested_states_override_and_restore() {
    let (master, valve) = bench();
    start(
        &master,
        "steps:\n  - devices:\n      sim.valve: 1\n    settle: true\n    actions:\n      - wait: 30\n      - devices:\n          sim.valve: 2\n        settle: true\n        noop: {}\n",
    );
    master.wait().await.unwrap();

    assert_eq!(numbers(&valve.writes()), vec![1.0, 2.0, 1.0]);
}

/// Scenario 5: parallel same-depth branches — the source-later branch
/// drives the node, and its termination falls back to the earlier one.
#[tokio::test]
async fn parallel_branches_arbitrate_by_source_order() {
    let (master, valve) = bench();
    start(
        &master,
        "steps:\n  - parallel:\n      - devices:\n          sim.valve: 10\n        settle: true\n        wait: 400\n      - devices:\n          sim.valve: 20\n        settle: true\n        wait: 50\n",
    );

    // While both branches hold, the source-later one wins.
    wait_until(|| valve.value() == Value::Number(20.0), "later branch to win").await;
    // The later branch ends first; the earlier one takes the node back.
    wait_until(|| valve.value() == Value::Number(10.0), "fallback to earlier branch").await;
    master.wait().await.unwrap();

    let writes = numbers(&valve.writes());
    assert!(writes.starts_with(&[10.0, 20.0]) || writes.starts_with(&[20.0, 10.0]));
    assert_eq!(writes.last(), Some(&10.0));
}

/// Scenario 6: repeat exposes `index`; one child lifecycle per iteration.
#[tokio::test]
async fn repeat_counts_through_index() {
    let (master, valve) = bench();
    start(
        &master,
        "steps:\n  - repeat: 3\n    do:\n      devices:\n        sim.valve: $index\n      settle: true\n      noop: {}\n",
    );
    master.wait().await.unwrap();

    assert_eq!(numbers(&valve.writes()), vec![0.0, 1.0, 2.0]);

    let terminations = state_modes_count(&master, StateMode::Terminated);
    assert_eq!(terminations, 3);
}

fn state_modes_count(master: &Master, needle: StateMode) -> usize {
    master
        .history()
        .iter()
        .filter(|(_, event)| {
            matches!(&event.location, ProgramLocation::State(l) if l.mode == needle)
        })
        .map(|(id, _)| id.clone())
        .collect::<std::collections::HashSet<_>>()
        .len()
}

/// Scenario 7: halting a paused state skips re-suspension.
#[tokio::test]
async fn halt_while_paused_stays_suspended() {
    let (master, valve) = bench();
    start(
        &master,
        "steps:\n  - devices:\n      sim.valve: 5\n    settle: true\n    wait: 60000\n",
    );
    wait_until(|| state_modes(&master).contains(&StateMode::Normal), "state to settle").await;
    assert_eq!(numbers(&valve.writes()), vec![5.0]);

    // Pause the state program (root sequence forwards to it).
    master.dispatch(&[0], RunCommand::Pause).unwrap();
    wait_until(|| state_modes(&master).contains(&StateMode::Paused), "state to pause").await;
    wait_until(|| valve.claims().is_empty(), "claim release on pause").await;

    master.dispatch(&[0], RunCommand::Halt).unwrap();
    master.wait().await.unwrap();

    let modes = state_modes(&master);
    assert!(modes.contains(&StateMode::HaltingChildWhilePaused));
    assert!(!modes.contains(&StateMode::SuspendingState));
    assert_eq!(modes.last(), Some(&StateMode::Terminated));
    // No further write happened after the pause released the node.
    assert_eq!(numbers(&valve.writes()), vec![5.0]);
}

/// Scenario 8: a disconnected node blocks settling; reconnection retries
/// the write and settles.
#[tokio::test]
async fn disconnected_node_retries_on_reconnect() {
    let (master, valve) = bench();
    valve.set_connected(false);
    start(
        &master,
        "steps:\n  - devices:\n      sim.valve: 6\n    settle: true\n    noop: {}\n",
    );

    // The disconnection surfaces in the state location.
    wait_until(
        || {
            master.history().iter().any(|(_, event)| {
                event.errors.iter().any(|n| n.message.contains("disconnected"))
            })
        },
        "disconnect error to surface",
    )
    .await;
    assert!(valve.writes().is_empty());
    // Not settled: the state program is still applying.
    assert!(!state_modes(&master).contains(&StateMode::Normal));

    valve.set_connected(true);
    master.wait().await.unwrap();
    assert_eq!(numbers(&valve.writes()), vec![6.0]);
    assert!(state_modes(&master).contains(&StateMode::Normal));
}
