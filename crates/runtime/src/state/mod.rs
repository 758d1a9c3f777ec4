// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The state manager: reconciles per-node demands across overlapping
//! program lifetimes.
//!
//! State-owning programs register an item, `apply` brings its demands to
//! the devices, `suspend` releases them without forgetting the item, and
//! `remove` drops it. Items form a tree parallel to a subtree of the
//! program tree; per-namespace consumers translate unit states into
//! effects and report settling back through [`Notifier`].

mod consumer;
mod devices;

pub use consumer::{AddedItem, NameConsumer, StateConsumer};
pub use devices::{DeviceStateConsumer, NodeLocation};

use crate::error::ExecError;
use crate::master::HandleId;
use crate::sync::ManualEvent;
use labrun_core::{BlockState, EvalStack, Notice};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

labrun_core::define_id! {
    /// Identifier of one state-owning program's item.
    pub struct ItemId("itm-");
}

/// One consumer's report for one item.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEvent {
    /// Replacement unit location, when it changed.
    pub location: Option<Json>,
    pub settled: bool,
    pub errors: Vec<Notice>,
}

impl StateEvent {
    pub fn settled(location: Json) -> Self {
        Self { location: Some(location), settled: true, errors: Vec::new() }
    }

    pub fn pending(location: Json) -> Self {
        Self { location: Some(location), settled: false, errors: Vec::new() }
    }
}

/// Latest location and settle flag of one namespace within an item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitEntry {
    pub location: Json,
    pub settled: bool,
}

/// Per-item snapshot across namespaces.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct StateLocation {
    pub entries: BTreeMap<String, Option<UnitEntry>>,
}

impl StateLocation {
    fn with_namespaces<'a>(namespaces: impl Iterator<Item = &'a str>) -> Self {
        Self { entries: namespaces.map(|ns| (ns.to_string(), None)).collect() }
    }

    /// Settled iff every namespace has reported and settled.
    pub fn settled(&self) -> bool {
        self.entries.values().all(|entry| entry.as_ref().is_some_and(|e| e.settled))
    }

    pub fn export(&self) -> Json {
        serde_json::to_value(self).unwrap_or(Json::Null)
    }
}

/// Aggregate pushed to the owning program on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    pub errors: Vec<Notice>,
    pub location: StateLocation,
    pub settled: bool,
}

/// Callback into the owning program.
pub type UpdateFn = Arc<dyn Fn(StateRecord) + Send + Sync>;

/// Routes consumer events back into the manager. Holds a weak reference so
/// consumers never keep a dead manager alive.
#[derive(Clone)]
pub struct Notifier {
    shared: Weak<ManagerShared>,
    item: ItemId,
    namespace: String,
}

impl Notifier {
    pub fn item(&self) -> &ItemId {
        &self.item
    }

    pub fn notify(&self, event: StateEvent) {
        if let Some(shared) = self.shared.upgrade() {
            StateManager::handle_event(&shared, &self.item, &self.namespace, event);
        }
    }
}

struct Item {
    handle: HandleId,
    depth: usize,
    parent: Option<ItemId>,
    children: Vec<ItemId>,
    applied: bool,
    location: StateLocation,
    settle: ManualEvent,
    update: UpdateFn,
    record: watch::Sender<Option<StateRecord>>,
}

#[derive(Default)]
struct ItemTable {
    by_handle: HashMap<HandleId, ItemId>,
    items: HashMap<ItemId, Item>,
}

impl ItemTable {
    /// Item ids from `id` up to the root, self first.
    fn ancestors(&self, id: &ItemId) -> Vec<ItemId> {
        let mut chain = Vec::new();
        let mut current = Some(id.clone());
        while let Some(id) = current {
            current = self.items.get(&id).and_then(|item| item.parent.clone());
            chain.push(id);
        }
        chain
    }

    /// Nearest item at or above the first handle of `lineage`.
    fn nearest(&self, lineage: &[HandleId]) -> Option<ItemId> {
        lineage.iter().find_map(|handle| self.by_handle.get(handle).cloned())
    }
}

struct ManagerShared {
    consumers: Vec<(String, Arc<dyn StateConsumer>)>,
    table: Mutex<ItemTable>,
}

/// Claim-arbitrated state multiplexer shared by one master's programs.
#[derive(Clone)]
pub struct StateManager {
    shared: Arc<ManagerShared>,
}

impl StateManager {
    pub fn new(consumers: Vec<(String, Arc<dyn StateConsumer>)>) -> Self {
        Self { shared: Arc::new(ManagerShared { consumers, table: Mutex::new(ItemTable::default()) }) }
    }

    pub fn has_item(&self, handle: &HandleId) -> bool {
        self.shared.table.lock().by_handle.contains_key(handle)
    }

    /// Register a new item at the first handle of `lineage` (self first,
    /// then ancestors). `position` is the owning handle's child-key path;
    /// it orders unrelated items by source. Expressions are evaluated now,
    /// against `stack`.
    pub fn add(
        &self,
        lineage: &[HandleId],
        position: Vec<u32>,
        state: &BlockState,
        stack: &EvalStack,
        update: UpdateFn,
    ) -> ItemId {
        let id = ItemId::new();
        let (ancestry, depth) = {
            let mut table = self.shared.table.lock();

            let parent = lineage.get(1..).unwrap_or(&[]).iter().find_map(|handle| {
                table.by_handle.get(handle).cloned()
            });
            let depth = parent
                .as_ref()
                .and_then(|p| table.items.get(p))
                .map(|p| p.depth + 1)
                .unwrap_or(0);

            let item = Item {
                handle: lineage[0].clone(),
                depth,
                parent: parent.clone(),
                children: Vec::new(),
                applied: false,
                location: StateLocation::with_namespaces(
                    self.shared.consumers.iter().map(|(ns, _)| ns.as_str()),
                ),
                settle: ManualEvent::new(),
                update,
                record: watch::channel(None).0,
            };

            if let Some(parent) = &parent {
                if let Some(parent_item) = table.items.get_mut(parent) {
                    parent_item.children.push(id.clone());
                }
            }
            table.by_handle.insert(lineage[0].clone(), id.clone());
            table.items.insert(id.clone(), item);

            (table.ancestors(&id), depth)
        };

        for (namespace, consumer) in &self.shared.consumers {
            let notifier = Notifier {
                shared: Arc::downgrade(&self.shared),
                item: id.clone(),
                namespace: namespace.clone(),
            };
            let ctx = AddedItem {
                item: id.clone(),
                depth,
                ancestry: ancestry.clone(),
                position: position.clone(),
            };
            consumer.add(ctx, state.get(namespace), stack, notifier);
        }

        tracing::debug!(item = %id, depth, "state item added");
        id
    }

    /// Mark every unapplied ancestor of the nearest item as applied, drive
    /// the consumers, and resolve once every ancestor settles.
    ///
    /// With `terminal`, the absence of an item (or an already-applied one)
    /// is a no-op; without it, it is an internal error.
    pub async fn apply(&self, lineage: &[HandleId], terminal: bool) -> Result<(), ExecError> {
        let (relevant, waits) = {
            let table = self.shared.table.lock();
            let origin = match table.nearest(lineage) {
                Some(origin) => origin,
                None if terminal => return Ok(()),
                None => return Err(ExecError::internal("apply without a state item")),
            };
            let already = table.items.get(&origin).map(|i| i.applied).unwrap_or(true);
            if already {
                if terminal {
                    return Ok(());
                }
                return Err(ExecError::internal("apply on an applied item"));
            }

            let ancestors = table.ancestors(&origin);
            let relevant: Vec<ItemId> = ancestors
                .iter()
                .filter(|id| table.items.get(*id).is_some_and(|item| !item.applied))
                .cloned()
                .collect();
            let waits: Vec<ManualEvent> = ancestors
                .iter()
                .filter_map(|id| table.items.get(id).map(|item| item.settle.clone()))
                .collect();
            (relevant, waits)
        };

        for (_, consumer) in &self.shared.consumers {
            consumer.apply(&relevant);
        }

        {
            let mut table = self.shared.table.lock();
            for id in &relevant {
                if let Some(item) = table.items.get_mut(id) {
                    item.applied = true;
                }
            }
        }

        for wait in waits {
            wait.wait().await;
        }
        Ok(())
    }

    /// Mark the nearest item unapplied and ask each consumer to yield its
    /// hold. Tolerates an unapplied (or absent) item: a segment pause may
    /// already have suspended it.
    pub async fn suspend(&self, lineage: &[HandleId]) -> Result<(), ExecError> {
        let id = {
            let mut table = self.shared.table.lock();
            let Some(id) = table.nearest(lineage) else {
                return Ok(());
            };
            let Some(item) = table.items.get_mut(&id) else {
                return Ok(());
            };
            if !item.applied {
                return Ok(());
            }
            item.applied = false;
            item.settle.clear();
            for entry in item.location.entries.values_mut() {
                if let Some(entry) = entry {
                    entry.settled = false;
                }
            }
            id
        };

        for (namespace, consumer) in &self.shared.consumers {
            if let Some(event) = consumer.suspend(&id).await {
                Self::handle_event(&self.shared, &id, namespace, event);
            }
        }
        tracing::debug!(item = %id, "state item suspended");
        Ok(())
    }

    /// Drop the item registered at exactly `handle`, removing its candidacy
    /// everywhere and detaching it from the item tree.
    pub async fn remove(&self, handle: &HandleId) -> Result<(), ExecError> {
        let id = {
            let mut table = self.shared.table.lock();
            let Some(id) = table.by_handle.remove(handle) else {
                return Ok(());
            };
            let parent = table.items.get(&id).and_then(|item| item.parent.clone());
            if let Some(parent) = parent {
                if let Some(parent_item) = table.items.get_mut(&parent) {
                    parent_item.children.retain(|child| child != &id);
                }
            }
            table.items.remove(&id);
            id
        };

        for (_, consumer) in &self.shared.consumers {
            consumer.remove(&id).await;
        }
        tracing::debug!(item = %id, "state item removed");
        Ok(())
    }

    /// Consumer-defined reset.
    pub async fn clear(&self, handle: Option<&HandleId>) {
        let id = handle.and_then(|h| self.shared.table.lock().by_handle.get(h).cloned());
        for (_, consumer) in &self.shared.consumers {
            consumer.clear(id.as_ref()).await;
        }
    }

    /// Watch the nearest item's records; used by segments to couple state
    /// updates with their process stream.
    pub fn record_watch(
        &self,
        lineage: &[HandleId],
    ) -> Option<watch::Receiver<Option<StateRecord>>> {
        let table = self.shared.table.lock();
        let id = table.nearest(lineage)?;
        table.items.get(&id).map(|item| item.record.subscribe())
    }

    /// Fold a consumer's event into the item and push the aggregate to the
    /// owning program.
    fn handle_event(shared: &Arc<ManagerShared>, id: &ItemId, namespace: &str, event: StateEvent) {
        let (record, update, record_tx) = {
            let mut table = shared.table.lock();
            let Some(item) = table.items.get_mut(id) else {
                return;
            };

            let slot = item
                .location
                .entries
                .entry(namespace.to_string())
                .or_insert(None);
            match slot {
                Some(entry) => {
                    entry.settled = event.settled;
                    if let Some(location) = event.location {
                        entry.location = location;
                    }
                }
                None => {
                    *slot = Some(UnitEntry {
                        location: event.location.unwrap_or(Json::Null),
                        settled: event.settled,
                    });
                }
            }

            let settled = item.location.settled();
            if settled {
                item.settle.set();
            } else {
                item.settle.clear();
            }

            let record = StateRecord { errors: event.errors, location: item.location.clone(), settled };
            (record, item.update.clone(), item.record.clone())
        };

        record_tx.send_replace(Some(record.clone()));
        (update)(record);
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
