// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::master::HandleId;
use labrun_core::{DeviceDemands, Expr, UnitState, Value};
use labrun_devices::{Node, NodeTree, SimNode};
use std::sync::Arc;
use std::time::Duration;

fn manager_for(tree: NodeTree) -> StateManager {
    StateManager::new(vec![
        ("devices".to_string(), Arc::new(DeviceStateConsumer::new(tree)) as Arc<dyn StateConsumer>),
        ("name".to_string(), Arc::new(NameConsumer::new()) as Arc<dyn StateConsumer>),
    ])
}

fn device_state(entries: &[(&str, Expr)]) -> BlockState {
    let mut demands = DeviceDemands::new();
    for (path, expr) in entries {
        demands.insert(labrun_core::NodePath::from_dotted(path), expr.clone());
    }
    BlockState::empty().with(UnitState::Devices(demands))
}

fn recorder() -> (UpdateFn, Arc<parking_lot::Mutex<Vec<StateRecord>>>) {
    let records = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&records);
    let update: UpdateFn = Arc::new(move |record| sink.lock().push(record));
    (update, records)
}

async fn wait_for_writes(node: &Arc<SimNode>, count: usize) {
    for _ in 0..200 {
        if node.writes().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("node never reached {count} writes: {:?}", node.writes());
}

#[tokio::test]
async fn apply_writes_and_settles() {
    let tree = NodeTree::new();
    let valve = SimNode::numeric("sim.valve");
    tree.register(valve.clone());
    let manager = manager_for(tree);

    let handle = HandleId::new();
    let lineage = vec![handle.clone()];
    let (update, records) = recorder();

    manager.add(&lineage, vec![], &device_state(&[("sim.valve", Expr::literal(3.0))]), &EvalStack::new(), update);
    manager.apply(&lineage, false).await.unwrap();

    assert_eq!(valve.writes(), vec![Value::Number(3.0)]);
    let last = records.lock().last().cloned().unwrap();
    assert!(last.settled);
}

#[tokio::test]
async fn terminal_apply_without_item_is_noop() {
    let manager = manager_for(NodeTree::new());
    let lineage = vec![HandleId::new()];
    manager.apply(&lineage, true).await.unwrap();

    let err = manager.apply(&lineage, false).await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn second_apply_on_applied_item_is_terminal_noop() {
    let tree = NodeTree::new();
    tree.register(SimNode::numeric("sim.valve"));
    let manager = manager_for(tree);

    let lineage = vec![HandleId::new()];
    let (update, _) = recorder();
    manager.add(&lineage, vec![], &device_state(&[("sim.valve", Expr::literal(1.0))]), &EvalStack::new(), update);
    manager.apply(&lineage, false).await.unwrap();

    // A descendant segment's terminal apply finds everything applied.
    manager.apply(&lineage, true).await.unwrap();
    assert!(manager.apply(&lineage, false).await.is_err());
}

#[tokio::test]
async fn deeper_item_preempts_and_removal_falls_back() {
    let tree = NodeTree::new();
    let valve = SimNode::numeric("sim.valve");
    tree.register(valve.clone());
    let manager = manager_for(tree);

    let outer = HandleId::new();
    let inner = HandleId::new();
    let outer_lineage = vec![outer.clone()];
    let inner_lineage = vec![inner.clone(), outer.clone()];

    let (outer_update, _) = recorder();
    manager.add(&outer_lineage, vec![0], &device_state(&[("sim.valve", Expr::literal(1.0))]), &EvalStack::new(), outer_update);
    manager.apply(&outer_lineage, false).await.unwrap();
    assert_eq!(valve.writes(), vec![Value::Number(1.0)]);

    let (inner_update, _) = recorder();
    manager.add(&inner_lineage, vec![0, 0], &device_state(&[("sim.valve", Expr::literal(2.0))]), &EvalStack::new(), inner_update);
    manager.apply(&inner_lineage, false).await.unwrap();
    assert_eq!(valve.writes(), vec![Value::Number(1.0), Value::Number(2.0)]);

    // Inner terminates: suspend then remove restores the outer demand.
    manager.suspend(&inner_lineage).await.unwrap();
    manager.remove(&inner).await.unwrap();
    wait_for_writes(&valve, 3).await;
    assert_eq!(
        valve.writes(),
        vec![Value::Number(1.0), Value::Number(2.0), Value::Number(1.0)]
    );
}

#[tokio::test]
async fn suspend_releases_claim_and_reapply_rewrites() {
    let tree = NodeTree::new();
    let valve = SimNode::numeric("sim.valve");
    tree.register(valve.clone());
    let manager = manager_for(tree);

    let handle = HandleId::new();
    let lineage = vec![handle.clone()];
    let (update, records) = recorder();
    manager.add(&lineage, vec![], &device_state(&[("sim.valve", Expr::literal(4.0))]), &EvalStack::new(), update);
    manager.apply(&lineage, false).await.unwrap();
    assert_eq!(valve.claims().len(), 1);

    manager.suspend(&lineage).await.unwrap();
    // The lifecycle task releases its claim once nothing applied remains.
    for _ in 0..200 {
        if valve.claims().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(valve.claims().is_empty());
    assert!(!records.lock().last().unwrap().settled);

    manager.apply(&lineage, false).await.unwrap();
    assert_eq!(valve.writes(), vec![Value::Number(4.0), Value::Number(4.0)]);
    assert!(records.lock().last().unwrap().settled);
}

#[tokio::test]
async fn same_depth_source_later_wins_then_falls_back() {
    let tree = NodeTree::new();
    let valve = SimNode::numeric("sim.valve");
    tree.register(valve.clone());
    let manager = manager_for(tree);

    let a = HandleId::new();
    let b = HandleId::new();
    let (update_a, _) = recorder();
    let (update_b, _) = recorder();

    manager.add(&[a.clone()], vec![0], &device_state(&[("sim.valve", Expr::literal(10.0))]), &EvalStack::new(), update_a);
    manager.add(&[b.clone()], vec![1], &device_state(&[("sim.valve", Expr::literal(20.0))]), &EvalStack::new(), update_b);
    manager.apply(&[a.clone()], false).await.unwrap();
    manager.apply(&[b.clone()], false).await.unwrap();

    // The source-later branch drives the node.
    assert_eq!(valve.value(), Value::Number(20.0));

    manager.suspend(&[b.clone()]).await.unwrap();
    manager.remove(&b).await.unwrap();
    for _ in 0..200 {
        if valve.value() == Value::Number(10.0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(valve.value(), Value::Number(10.0));
}

#[tokio::test]
async fn evaluation_error_drops_candidate_but_settles() {
    let tree = NodeTree::new();
    let valve = SimNode::numeric("sim.valve");
    tree.register(valve.clone());
    let manager = manager_for(tree);

    let lineage = vec![HandleId::new()];
    let (update, records) = recorder();
    manager.add(&lineage, vec![], &device_state(&[("sim.valve", Expr::var("missing"))]), &EvalStack::new(), update);
    manager.apply(&lineage, false).await.unwrap();

    assert!(valve.writes().is_empty());
    let last = records.lock().last().cloned().unwrap();
    assert!(last.settled);
    assert!(!last.errors.is_empty() || records.lock().iter().any(|r| !r.errors.is_empty()));
}

#[tokio::test]
async fn disconnected_node_blocks_settle_until_reconnect() {
    let tree = NodeTree::new();
    let valve = SimNode::numeric("sim.valve");
    valve.set_connected(false);
    tree.register(valve.clone());
    let manager = manager_for(tree);

    let lineage = vec![HandleId::new()];
    let (update, records) = recorder();
    manager.add(&lineage, vec![], &device_state(&[("sim.valve", Expr::literal(6.0))]), &EvalStack::new(), update);

    let apply = {
        let manager = manager.clone();
        let lineage = lineage.clone();
        tokio::spawn(async move { manager.apply(&lineage, false).await })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!apply.is_finished());
    assert!(valve.writes().is_empty());
    // The disconnection surfaced in the item's location.
    let saw_disconnect = records.lock().iter().any(|r| {
        r.errors.iter().any(|n| n.message.contains("disconnected"))
    });
    assert!(saw_disconnect);

    valve.set_connected(true);
    apply.await.unwrap().unwrap();
    assert_eq!(valve.writes(), vec![Value::Number(6.0)]);
    assert!(records.lock().last().unwrap().settled);
}

#[tokio::test]
async fn record_watch_follows_nearest_item() {
    let tree = NodeTree::new();
    tree.register(SimNode::numeric("sim.valve"));
    let manager = manager_for(tree);

    let state_handle = HandleId::new();
    let segment_handle = HandleId::new();
    let (update, _) = recorder();
    manager.add(
        &[state_handle.clone()],
        vec![],
        &device_state(&[("sim.valve", Expr::literal(9.0))]),
        &EvalStack::new(),
        update,
    );

    // The segment walks its lineage up to the state item.
    let watch = manager
        .record_watch(&[segment_handle.clone(), state_handle.clone()])
        .unwrap();
    assert!(watch.borrow().is_none());

    manager.apply(&[state_handle], false).await.unwrap();
    assert!(watch.borrow().as_ref().unwrap().settled);
}

#[tokio::test]
async fn name_namespace_settles_on_apply() {
    let manager = manager_for(NodeTree::new());
    let lineage = vec![HandleId::new()];
    let (update, records) = recorder();

    let state = BlockState::empty().with(UnitState::Name("mix".into()));
    manager.add(&lineage, vec![], &state, &EvalStack::new(), update);
    manager.apply(&lineage, false).await.unwrap();

    let last = records.lock().last().cloned().unwrap();
    assert!(last.settled);
    let entry = last.location.entries.get("name").unwrap().as_ref().unwrap();
    assert_eq!(entry.location, Json::String("mix".into()));
}
