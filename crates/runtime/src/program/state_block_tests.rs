// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::master::{Master, MasterConfig, RunCommand};
use crate::process::ProcessRegistry;
use labrun_core::{
    Block, BlockState, DeviceDemands, Expr, NodePath, SegmentBlock, StateBlock, SystemClock,
    UnitState, Value,
};
use labrun_devices::{NodeTree, SimNode};
use std::sync::Arc;
use std::time::Duration;

fn master_with_valve() -> (Master, Arc<SimNode>) {
    let tree = NodeTree::new();
    let valve = SimNode::numeric("sim.valve");
    tree.register(valve.clone());
    let master = Master::new(MasterConfig {
        nodes: tree,
        processes: ProcessRegistry::builtin(),
        clock: Arc::new(SystemClock),
    });
    (master, valve)
}

fn valve_state(value: f64) -> BlockState {
    let mut demands = DeviceDemands::new();
    demands.insert(NodePath::from_dotted("sim.valve"), Expr::literal(value));
    BlockState::empty().with(UnitState::Devices(demands))
}

fn noop() -> Block {
    Block::Segment(SegmentBlock { namespace: "noop".into(), process: serde_json::Value::Null })
}

fn timer(duration_ms: u64) -> Block {
    Block::Segment(SegmentBlock {
        namespace: "timer".into(),
        process: serde_json::json!({"duration_ms": duration_ms}),
    })
}

fn state_over(state: BlockState, settle: bool, child: Block) -> Block {
    Block::State(Box::new(StateBlock { state, settle, child }))
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

async fn wait_until(mut probe: impl FnMut() -> bool, what: &str) {
    for _ in 0..400 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn settling_state_applies_before_its_child() {
    let (master, valve) = master_with_valve();
    master.start(state_over(valve_state(7.0), true, noop()), labrun_core::EvalStack::new());
    master.wait().await.unwrap();

    assert_eq!(valve.writes(), vec![Value::Number(7.0)]);
    assert_eq!(
        state_modes(&master),
        vec![
            StateMode::ApplyingState,
            StateMode::Normal,
            StateMode::SuspendingState,
            StateMode::Terminated,
        ]
    );

    // The write settled before the segment emitted anything.
    let history = master.history();
    let first_segment = history
        .iter()
        .position(|(_, e)| matches!(e.location, ProgramLocation::Segment(_)))
        .unwrap();
    let state_normal = history
        .iter()
        .position(|(_, e)| {
            matches!(&e.location, ProgramLocation::State(l) if l.mode == StateMode::Normal)
        })
        .unwrap();
    assert!(state_normal < first_segment);
}

#[tokio::test]
async fn loose_state_is_applied_by_its_leaf() {
    let (master, valve) = master_with_valve();
    master.start(state_over(valve_state(3.0), false, noop()), labrun_core::EvalStack::new());
    master.wait().await.unwrap();

    assert_eq!(valve.writes(), vec![Value::Number(3.0)]);
    // Claims were released on removal.
    assert!(valve.claims().is_empty());
}

#[tokio::test]
async fn pause_suspends_and_resume_reapplies() {
    let (master, valve) = master_with_valve();
    master.start(
        state_over(valve_state(5.0), true, timer(60_000)),
        labrun_core::EvalStack::new(),
    );

    wait_until(|| state_modes(&master).contains(&StateMode::Normal), "state to settle").await;
    assert_eq!(valve.writes(), vec![Value::Number(5.0)]);

    master.dispatch(&[], RunCommand::Pause).unwrap();
    wait_until(|| state_modes(&master).contains(&StateMode::Paused), "state to pause").await;
    // Pausing released the device hold.
    wait_until(|| valve.claims().is_empty(), "claim release").await;

    master.dispatch(&[], RunCommand::Resume).unwrap();
    wait_until(
        || {
            let modes = state_modes(&master);
            let paused = modes.iter().position(|m| *m == StateMode::Paused);
            match paused {
                Some(at) => modes[at..].contains(&StateMode::Normal),
                None => false,
            }
        },
        "state to resume",
    )
    .await;
    // Re-applied on resume.
    wait_until(|| valve.writes().len() == 2, "reapply write").await;
    assert_eq!(valve.writes(), vec![Value::Number(5.0), Value::Number(5.0)]);

    let modes = state_modes(&master);
    let pause_at = modes.iter().position(|m| *m == StateMode::PausingChild).unwrap();
    assert_eq!(
        &modes[pause_at..pause_at + 3],
        &[StateMode::PausingChild, StateMode::PausingState, StateMode::Paused]
    );
    assert!(modes.contains(&StateMode::Resuming));
    assert!(modes.contains(&StateMode::ResumingState));

    master.dispatch(&[], RunCommand::Halt).unwrap();
    master.wait().await.unwrap();
}

#[tokio::test]
async fn halt_from_normal_suspends_through_halting_state() {
    let (master, valve) = master_with_valve();
    master.start(
        state_over(valve_state(2.0), true, timer(60_000)),
        labrun_core::EvalStack::new(),
    );
    wait_until(|| state_modes(&master).contains(&StateMode::Normal), "state to settle").await;

    master.dispatch(&[], RunCommand::Halt).unwrap();
    master.wait().await.unwrap();

    let modes = state_modes(&master);
    assert!(modes.contains(&StateMode::HaltingChildThenState));
    assert!(modes.contains(&StateMode::HaltingState));
    assert_eq!(modes.last(), Some(&StateMode::Terminated));
    assert!(!modes.contains(&StateMode::SuspendingState));
    assert!(valve.claims().is_empty());
}

#[tokio::test]
async fn halt_while_paused_skips_suspension() {
    let (master, valve) = master_with_valve();
    master.start(
        state_over(valve_state(9.0), true, timer(60_000)),
        labrun_core::EvalStack::new(),
    );
    wait_until(|| state_modes(&master).contains(&StateMode::Normal), "state to settle").await;

    master.dispatch(&[], RunCommand::Pause).unwrap();
    wait_until(|| state_modes(&master).contains(&StateMode::Paused), "state to pause").await;

    master.dispatch(&[], RunCommand::Halt).unwrap();
    master.wait().await.unwrap();

    let modes = state_modes(&master);
    assert!(modes.contains(&StateMode::HaltingChildWhilePaused));
    assert!(!modes.contains(&StateMode::SuspendingState));
    assert!(!modes.contains(&StateMode::HaltingState));
    assert_eq!(modes.last(), Some(&StateMode::Terminated));
    assert!(valve.claims().is_empty());
    assert_eq!(valve.writes(), vec![Value::Number(9.0)]);
}

#[tokio::test]
async fn nested_states_restore_outer_value() {
    let (master, valve) = master_with_valve();
    // Outer holds 1; the inner state wraps the leaf and holds 2.
    let inner = state_over(valve_state(2.0), true, noop());
    let outer = state_over(valve_state(1.0), true, inner);
    master.start(outer, labrun_core::EvalStack::new());
    master.wait().await.unwrap();

    assert_eq!(
        valve.writes(),
        vec![Value::Number(1.0), Value::Number(2.0), Value::Number(1.0)]
    );
    assert!(valve.claims().is_empty());
}

#[test]
fn declared_transitions_are_consistent() {
    use StateMode::*;
    assert!(ApplyingState.may_enter(Normal));
    assert!(Normal.may_enter(PausingChild));
    assert!(PausingChild.may_enter(PausingState));
    assert!(PausingState.may_enter(Paused));
    assert!(Paused.may_enter(Resuming));
    assert!(Resuming.may_enter(ResumingState));
    assert!(ResumingState.may_enter(Normal));
    assert!(Resuming.may_enter(Paused));
    assert!(Normal.may_enter(HaltingChildThenState));
    assert!(Paused.may_enter(HaltingChildWhilePaused));

    assert!(!Terminated.may_enter(Normal));
    assert!(!Paused.may_enter(PausingChild));
    assert!(!Normal.may_enter(Resuming));
}
