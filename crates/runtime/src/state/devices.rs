// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `devices` consumer: multiplexes item demands onto device nodes.
//!
//! Per node, candidates are kept ordered ancestor-before-descendant (with
//! source order breaking ties) and the deepest applied candidate drives
//! the node. One lifecycle task per touched node holds the claim, writes
//! the winning value, observes settling, and retries after disconnection.

use super::{AddedItem, ItemId, Notifier, StateConsumer, StateEvent};
use crate::error::ExecError;
use crate::sync::ManualEvent;
use async_trait::async_trait;
use labrun_core::{EvalStack, NodePath, Notice, UnitState, Value};
use labrun_devices::{ClaimSymbol, Node, NodeError, NodeTree};
use parking_lot::Mutex;
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-node slice of an item's location.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLocation {
    pub value: Value,
    pub error_disconnected: bool,
    pub error_evaluation: bool,
    pub error_unclaimable: bool,
}

impl NodeLocation {
    fn demanding(value: Value) -> Self {
        Self { value, error_disconnected: false, error_evaluation: false, error_unclaimable: false }
    }

    fn evaluation_failed() -> Self {
        Self {
            value: Value::Null,
            error_disconnected: false,
            error_evaluation: true,
            error_unclaimable: false,
        }
    }

    fn clear_errors(&mut self) {
        self.error_disconnected = false;
        self.error_evaluation = false;
        self.error_unclaimable = false;
    }

    pub fn export(&self) -> Json {
        serde_json::json!({
            "value": self.value,
            "errors": {
                "disconnected": self.error_disconnected,
                "evaluation": self.error_evaluation,
                "unclaimable": self.error_unclaimable,
            },
        })
    }
}

struct ItemInfo {
    /// Item ids from this item up to the root, self first.
    ancestry: Vec<ItemId>,
    /// Handle path in the program tree; source order for unrelated items,
    /// the source-later sibling outranking the earlier one.
    position: Vec<u32>,
    /// Insertion counter, the last-resort tiebreak.
    order: u64,
    applied: bool,
    nodes: Vec<NodePath>,
    location: BTreeMap<NodePath, NodeLocation>,
    eval_errors: Vec<Notice>,
    notify: Notifier,
}

struct Candidate {
    item: ItemId,
    value: Value,
}

struct NodeState {
    /// Ordered shallow → deep; the last applied entry wins.
    candidates: Vec<Candidate>,
    current: Option<ItemId>,
    settled: bool,
    /// Level-triggered mirror of `settled`; suspend/remove await it when a
    /// shallower candidate must be restored.
    settle_event: ManualEvent,
    update: ManualEvent,
    cancel: Option<CancellationToken>,
}

impl NodeState {
    fn new() -> Self {
        Self {
            candidates: Vec::new(),
            current: None,
            settled: false,
            settle_event: ManualEvent::new(),
            update: ManualEvent::new(),
            cancel: None,
        }
    }

    fn mark_settled(&mut self) {
        self.settled = true;
        self.settle_event.set();
    }

    fn mark_unsettled(&mut self) {
        self.settled = false;
        self.settle_event.clear();
    }
}

#[derive(Default)]
struct Inner {
    items: HashMap<ItemId, ItemInfo>,
    nodes: HashMap<NodePath, NodeState>,
    updated: BTreeSet<NodePath>,
    next_order: u64,
}

/// `a` strictly precedes `b`: ancestors before descendants, unrelated
/// items by source position, then by insertion order.
fn precedes(items: &HashMap<ItemId, ItemInfo>, a: &ItemId, b: &ItemId) -> bool {
    let (Some(a_info), Some(b_info)) = (items.get(a), items.get(b)) else {
        return false;
    };
    if b_info.ancestry.contains(a) {
        return true;
    }
    if a_info.ancestry.contains(b) {
        return false;
    }
    match a_info.position.cmp(&b_info.position) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => a_info.order < b_info.order,
    }
}

/// Deepest applied candidate, scanning from the end.
fn select_current(items: &HashMap<ItemId, ItemInfo>, candidates: &[Candidate]) -> Option<ItemId> {
    candidates
        .iter()
        .rev()
        .find(|c| items.get(&c.item).is_some_and(|info| info.applied))
        .map(|c| c.item.clone())
}

fn build_event(inner: &Inner, id: &ItemId) -> Option<(Notifier, StateEvent)> {
    let info = inner.items.get(id)?;
    let settled = info.nodes.iter().all(|path| match inner.nodes.get(path) {
        Some(node) if node.current.as_ref() == Some(id) => node.settled,
        _ => true,
    });
    let location: serde_json::Map<String, Json> = info
        .location
        .iter()
        .map(|(path, loc)| (path.to_string(), loc.export()))
        .collect();
    Some((
        info.notify.clone(),
        StateEvent {
            location: Some(Json::Object(location)),
            settled,
            errors: info.eval_errors.clone(),
        },
    ))
}

struct Shared {
    tree: NodeTree,
    inner: Mutex<Inner>,
}

pub struct DeviceStateConsumer {
    shared: Arc<Shared>,
}

impl DeviceStateConsumer {
    pub fn new(tree: NodeTree) -> Self {
        Self { shared: Arc::new(Shared { tree, inner: Mutex::new(Inner::default()) }) }
    }
}

#[async_trait]
impl StateConsumer for DeviceStateConsumer {
    fn add(&self, ctx: AddedItem, unit: Option<&UnitState>, stack: &EvalStack, notify: Notifier) {
        let mut location = BTreeMap::new();
        let mut eval_errors = Vec::new();
        let mut demands = Vec::new();

        if let Some(UnitState::Devices(unit)) = unit {
            for (path, expr) in unit.iter() {
                if self.shared.tree.find_writable(path).is_err() {
                    eval_errors.push(Notice::new(format!("unknown writable node '{path}'")));
                    location.insert(path.clone(), NodeLocation::evaluation_failed());
                    continue;
                }
                match expr.eval(stack) {
                    Ok(value) => {
                        location.insert(path.clone(), NodeLocation::demanding(value.clone()));
                        demands.push((path.clone(), value));
                    }
                    Err(e) => {
                        eval_errors.push(ExecError::Evaluation(e).notice());
                        location.insert(path.clone(), NodeLocation::evaluation_failed());
                    }
                }
            }
        }

        let mut inner = self.shared.inner.lock();
        let order = inner.next_order;
        inner.next_order += 1;

        let info = ItemInfo {
            ancestry: ctx.ancestry,
            position: ctx.position,
            order,
            applied: false,
            nodes: demands.iter().map(|(path, _)| path.clone()).collect(),
            location,
            eval_errors,
            notify,
        };
        inner.items.insert(ctx.item.clone(), info);

        for (path, value) in demands {
            let inner = &mut *inner;
            let node = inner.nodes.entry(path.clone()).or_insert_with(NodeState::new);
            let position = node
                .candidates
                .partition_point(|c| precedes(&inner.items, &c.item, &ctx.item));
            node.candidates.insert(position, Candidate { item: ctx.item.clone(), value });
            inner.updated.insert(path);
        }
    }

    fn apply(&self, relevant: &[ItemId]) {
        let mut notifications = Vec::new();
        let mut spawns = Vec::new();

        {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;

            for id in relevant {
                if let Some(info) = inner.items.get_mut(id) {
                    info.applied = true;
                }
            }

            let updated: Vec<NodePath> = std::mem::take(&mut inner.updated).into_iter().collect();
            for path in updated {
                let new_current = match inner.nodes.get(&path) {
                    Some(node) => select_current(&inner.items, &node.candidates),
                    None => continue,
                };

                let mut displaced = None;
                if let Some(node) = inner.nodes.get_mut(&path) {
                    if node.current != new_current {
                        displaced = node.current.take();
                        node.current = new_current;
                        node.mark_unsettled();
                        node.update.set();
                    }
                    if node.cancel.is_none() {
                        if let Ok(device) = self.shared.tree.find_writable(&path) {
                            let token = CancellationToken::new();
                            node.cancel = Some(token.clone());
                            spawns.push((path.clone(), device, token, node.update.clone()));
                        }
                    }
                }

                if let Some(prev) = displaced {
                    if let Some(info) = inner.items.get_mut(&prev) {
                        if let Some(loc) = info.location.get_mut(&path) {
                            loc.clear_errors();
                        }
                    }
                    notifications.extend(build_event(inner, &prev));
                }
            }

            for id in relevant {
                notifications.extend(build_event(inner, id));
            }
        }

        for (path, device, token, update) in spawns {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(node_task(shared, path, device, token, update));
        }
        for (notify, event) in notifications {
            notify.notify(event);
        }
    }

    async fn suspend(&self, id: &ItemId) -> Option<StateEvent> {
        let mut restores = Vec::new();
        let event = {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;

            let paths = {
                let info = inner.items.get_mut(id)?;
                info.applied = false;
                info.nodes.clone()
            };

            for path in paths {
                let new_current = match inner.nodes.get(&path) {
                    Some(node) => select_current(&inner.items, &node.candidates),
                    None => continue,
                };
                if let Some(node) = inner.nodes.get_mut(&path) {
                    if node.current != new_current {
                        node.current = new_current.clone();
                        node.mark_unsettled();
                        node.update.set();
                        if new_current.is_some() {
                            restores.push(node.settle_event.clone());
                        }
                    }
                    if new_current.is_none() {
                        // Nothing applied remains: release the claim while
                        // suspended.
                        if let Some(token) = node.cancel.take() {
                            token.cancel();
                        }
                        node.mark_unsettled();
                    }
                }
                inner.updated.insert(path);
            }

            let info = inner.items.get(id)?;
            let location: serde_json::Map<String, Json> =
                info.location.iter().map(|(path, loc)| (path.to_string(), loc.export())).collect();
            Some(StateEvent {
                location: Some(Json::Object(location)),
                settled: false,
                errors: Vec::new(),
            })
        };

        // A shallower demand took the node back; hold the caller until the
        // restore write lands.
        for restore in restores {
            restore.wait().await;
        }
        event
    }

    async fn remove(&self, id: &ItemId) {
        let mut restores = Vec::new();
        {
            let mut guard = self.shared.inner.lock();
            let inner = &mut *guard;

            let Some(info) = inner.items.remove(id) else {
                return;
            };

            let mut emptied = Vec::new();
            for path in info.nodes {
                let new_current = match inner.nodes.get_mut(&path) {
                    Some(node) => {
                        node.candidates.retain(|c| &c.item != id);
                        select_current(&inner.items, &node.candidates)
                    }
                    None => continue,
                };
                if let Some(node) = inner.nodes.get_mut(&path) {
                    if node.candidates.is_empty() {
                        if let Some(token) = node.cancel.take() {
                            token.cancel();
                        }
                        emptied.push(path.clone());
                    } else if node.current != new_current {
                        node.current = new_current.clone();
                        node.mark_unsettled();
                        node.update.set();
                        if new_current.is_some() {
                            restores.push(node.settle_event.clone());
                        }
                    }
                }
                inner.updated.insert(path);
            }

            for path in emptied {
                inner.nodes.remove(&path);
                inner.updated.remove(&path);
            }
        }

        // Fall back to the shallower demand before the owner's program
        // reports termination.
        for restore in restores {
            restore.wait().await;
        }
    }

    async fn clear(&self, _item: Option<&ItemId>) {}
}

enum WriteOutcome {
    Written,
    Disconnected,
    Idle,
}

/// One write attempt against the currently selected candidate.
async fn write_current(shared: &Arc<Shared>, path: &NodePath, device: &Arc<dyn Node>) -> WriteOutcome {
    let target = {
        let inner = shared.inner.lock();
        inner.nodes.get(path).and_then(|node| node.current.clone()).and_then(|item| {
            inner
                .items
                .get(&item)
                .and_then(|info| info.location.get(path))
                .map(|loc| (item, loc.value.clone()))
        })
    };

    let Some((item, value)) = target else {
        return WriteOutcome::Idle;
    };

    match device.write(value).await {
        Ok(()) => {
            let notification = {
                let mut guard = shared.inner.lock();
                let inner = &mut *guard;
                if let Some(node) = inner.nodes.get_mut(path) {
                    // A reassignment during the write invalidates it; the
                    // pending update event drives the rewrite.
                    if node.current.as_ref() == Some(&item) {
                        node.mark_settled();
                    }
                }
                if let Some(info) = inner.items.get_mut(&item) {
                    if let Some(loc) = info.location.get_mut(path) {
                        loc.clear_errors();
                    }
                }
                build_event(inner, &item)
            };
            if let Some((notify, event)) = notification {
                notify.notify(event);
            }
            WriteOutcome::Written
        }
        Err(NodeError::Unavailable) => {
            let notification = {
                let mut guard = shared.inner.lock();
                let inner = &mut *guard;
                if let Some(node) = inner.nodes.get_mut(path) {
                    node.mark_unsettled();
                }
                if let Some(info) = inner.items.get_mut(&item) {
                    if let Some(loc) = info.location.get_mut(path) {
                        loc.error_disconnected = true;
                    }
                }
                build_event(inner, &item).map(|(notify, mut event)| {
                    event.errors.push(ExecError::NodeUnavailable(path.clone()).notice());
                    (notify, event)
                })
            };
            if let Some((notify, event)) = notification {
                notify.notify(event);
            }
            WriteOutcome::Disconnected
        }
        Err(NodeError::NotSupported) => {
            let notification = {
                let mut guard = shared.inner.lock();
                let inner = &mut *guard;
                if let Some(node) = inner.nodes.get_mut(path) {
                    node.mark_unsettled();
                }
                if let Some(info) = inner.items.get_mut(&item) {
                    if let Some(loc) = info.location.get_mut(path) {
                        loc.error_evaluation = true;
                    }
                }
                build_event(inner, &item).map(|(notify, mut event)| {
                    event.errors.push(Notice::new(format!("node '{path}' rejected value")));
                    (notify, event)
                })
            };
            if let Some((notify, event)) = notification {
                notify.notify(event);
            }
            WriteOutcome::Idle
        }
    }
}

fn notify_claim_lost(shared: &Arc<Shared>, path: &NodePath) {
    let notification = {
        let mut guard = shared.inner.lock();
        let inner = &mut *guard;
        let current = inner.nodes.get(path).and_then(|node| node.current.clone());
        if let Some(node) = inner.nodes.get_mut(path) {
            node.mark_unsettled();
        }
        current.and_then(|item| {
            if let Some(info) = inner.items.get_mut(&item) {
                if let Some(loc) = info.location.get_mut(path) {
                    loc.error_unclaimable = true;
                }
            }
            build_event(inner, &item).map(|(notify, mut event)| {
                event.errors.push(ExecError::NodeUnclaimable(path.clone()).notice());
                (notify, event)
            })
        })
    };
    if let Some((notify, event)) = notification {
        notify.notify(event);
    }
}

/// Per-node lifecycle: claim, write the winning candidate, observe
/// settling, retry after disconnection, re-wait after preemption. Always
/// releases the claim on cancellation.
async fn node_task(
    shared: Arc<Shared>,
    path: NodePath,
    device: Arc<dyn Node>,
    cancel: CancellationToken,
    update: ManualEvent,
) {
    let mut claim = match device.claim(ClaimSymbol::root()) {
        Ok(claim) => claim,
        Err(_) => return,
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = claim.wait() => {}
        }
        tracing::debug!(node = %path, "claim granted");

        loop {
            let outcome = write_current(&shared, &path, &device).await;

            match outcome {
                WriteOutcome::Disconnected => {
                    let mut connection = device.connection();
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = claim.lost() => {
                            notify_claim_lost(&shared, &path);
                            break;
                        }
                        _ = update.wait() => {
                            update.clear();
                        }
                        _ = connection.wait_for(|connected| *connected) => {}
                    }
                }
                WriteOutcome::Written | WriteOutcome::Idle => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = claim.lost() => {
                            notify_claim_lost(&shared, &path);
                            break;
                        }
                        _ = update.wait() => {
                            update.clear();
                        }
                    }
                }
            }
        }
    }
}
