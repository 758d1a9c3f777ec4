// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The consumer contract: one implementation per state namespace.

use super::{ItemId, Notifier, StateEvent};
use async_trait::async_trait;
use labrun_core::{EvalStack, UnitState};
use parking_lot::Mutex;
use serde_json::Value as Json;
use std::collections::HashMap;

/// Context handed to a consumer when an item is registered.
#[derive(Debug, Clone)]
pub struct AddedItem {
    pub item: ItemId,
    pub depth: usize,
    /// Item ids from this item up to the root, self first. Lets consumers
    /// order candidates without reaching back into the manager.
    pub ancestry: Vec<ItemId>,
    /// Owning handle's child-key path; lexicographic order is source
    /// order, breaking ties between unrelated items.
    pub position: Vec<u32>,
}

/// Translates one namespace's unit states into device effects.
///
/// Every consumer must report each relevant item on `apply`, even when the
/// item holds nothing for this namespace; an unreported entry keeps the
/// item from ever settling.
#[async_trait]
pub trait StateConsumer: Send + Sync {
    /// Register an item. `unit` is this namespace's slice of the block
    /// state, or `None` for the null entry.
    fn add(&self, ctx: AddedItem, unit: Option<&UnitState>, stack: &EvalStack, notify: Notifier);

    /// Bring the demands of `items` (now considered applied) to the
    /// devices and notify each of them.
    fn apply(&self, items: &[ItemId]);

    /// Yield the holds owned exclusively for `item`; the returned event,
    /// if any, replaces the item's unit location.
    async fn suspend(&self, item: &ItemId) -> Option<StateEvent>;

    /// Forget the item entirely.
    async fn remove(&self, item: &ItemId);

    /// Consumer-defined reset.
    async fn clear(&self, item: Option<&ItemId>);
}

/// Trivial consumer for the `name` namespace: a display label that settles
/// as soon as it is applied.
#[derive(Default)]
pub struct NameConsumer {
    items: Mutex<HashMap<ItemId, (Option<String>, Notifier)>>,
}

impl NameConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    fn location(name: &Option<String>) -> Json {
        match name {
            Some(name) => Json::String(name.clone()),
            None => Json::Null,
        }
    }
}

#[async_trait]
impl StateConsumer for NameConsumer {
    fn add(&self, ctx: AddedItem, unit: Option<&UnitState>, _stack: &EvalStack, notify: Notifier) {
        let name = match unit {
            Some(UnitState::Name(name)) => Some(name.clone()),
            _ => None,
        };
        self.items.lock().insert(ctx.item, (name, notify));
    }

    fn apply(&self, items: &[ItemId]) {
        let snapshot: Vec<(Notifier, Json)> = {
            let table = self.items.lock();
            items
                .iter()
                .filter_map(|id| table.get(id))
                .map(|(name, notify)| (notify.clone(), Self::location(name)))
                .collect()
        };
        for (notify, location) in snapshot {
            notify.notify(StateEvent::settled(location));
        }
    }

    async fn suspend(&self, _item: &ItemId) -> Option<StateEvent> {
        None
    }

    async fn remove(&self, item: &ItemId) {
        self.items.lock().remove(item);
    }

    async fn clear(&self, _item: Option<&ItemId>) {}
}
