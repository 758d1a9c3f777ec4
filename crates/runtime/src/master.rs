// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The master: root owner of a running protocol.
//!
//! Handles form an arena keyed by [`HandleId`]; children hold a parent
//! reference, parents key children by a stable `u32` used as the client
//! routing path. Each program runs on its own task and talks to the rest
//! of the tree through acknowledged [`Control`] messages.

use crate::error::ExecError;
use crate::process::ProcessRegistry;
use crate::program::{run_block, ProgramExecEvent, ProgramLocation};
use crate::state::{DeviceStateConsumer, NameConsumer, StateConsumer, StateManager};
use labrun_core::{Block, Clock, EvalStack, Notice, NAMESPACE_DEVICES, NAMESPACE_NAME};
use labrun_devices::{ClaimSymbol, NodeTree};
use parking_lot::Mutex;
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

labrun_core::define_id! {
    /// Identifier of one program handle in the master's arena.
    pub struct HandleId("prg-");
}

pub(crate) type AckTx = oneshot::Sender<Result<(), ExecError>>;
pub(crate) type AckRx = oneshot::Receiver<Result<(), ExecError>>;
pub(crate) type ControlRx = mpsc::UnboundedReceiver<Control>;

/// Control inputs routed to a running program.
///
/// `loose` relaxes the mode precondition: a loose pause of an already
/// paused (or terminated) program acknowledges instead of failing.
#[derive(Debug)]
pub enum Control {
    Halt,
    Pause { loose: bool, done: AckTx },
    Resume { loose: bool, done: AckTx },
    Jump { point: Json },
}

/// Client-facing command for a program, addressed by handle path.
#[derive(Debug, Clone)]
pub enum RunCommand {
    Halt,
    Pause,
    Resume,
    Jump { point: Json },
}

struct HandleNode {
    parent: Option<HandleId>,
    children: BTreeMap<u32, HandleId>,
    next_child_key: u32,
    next_symbol_index: u64,
    symbol: ClaimSymbol,
    location: Option<ProgramLocation>,
    errors: Vec<Notice>,
    busy: bool,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: Option<ControlRx>,
}

impl HandleNode {
    fn new(parent: Option<HandleId>, symbol: ClaimSymbol) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            parent,
            children: BTreeMap::new(),
            next_child_key: 0,
            next_symbol_index: 0,
            symbol,
            location: None,
            errors: Vec::new(),
            busy: false,
            control_tx,
            control_rx: Some(control_rx),
        }
    }
}

/// Construction inputs for a master.
pub struct MasterConfig {
    pub nodes: NodeTree,
    pub processes: ProcessRegistry,
    pub clock: Arc<dyn Clock>,
}

struct MasterInner {
    handles: Mutex<HashMap<HandleId, HandleNode>>,
    root: Mutex<Option<HandleId>>,
    state: StateManager,
    processes: ProcessRegistry,
    nodes: NodeTree,
    clock: Arc<dyn Clock>,
    updates: watch::Sender<u64>,
    history: Mutex<Vec<(HandleId, ProgramExecEvent)>>,
    run: Mutex<Option<JoinHandle<Result<(), ExecError>>>>,
}

/// Root program owner: handle arena, state manager, claim-symbol
/// allocator, update fan-out.
#[derive(Clone)]
pub struct Master {
    inner: Arc<MasterInner>,
}

impl Master {
    pub fn new(config: MasterConfig) -> Self {
        let state = StateManager::new(vec![
            (
                NAMESPACE_DEVICES.to_string(),
                Arc::new(DeviceStateConsumer::new(config.nodes.clone())) as Arc<dyn StateConsumer>,
            ),
            (NAMESPACE_NAME.to_string(), Arc::new(NameConsumer::new()) as Arc<dyn StateConsumer>),
        ]);

        Self {
            inner: Arc::new(MasterInner {
                handles: Mutex::new(HashMap::new()),
                root: Mutex::new(None),
                state,
                processes: config.processes,
                nodes: config.nodes,
                clock: config.clock,
                updates: watch::channel(0).0,
                history: Mutex::new(Vec::new()),
                run: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> &StateManager {
        &self.inner.state
    }

    pub fn nodes(&self) -> &NodeTree {
        &self.inner.nodes
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.inner.processes
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// Subscribe to coalesced snapshot updates.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.inner.updates.subscribe()
    }

    /// Coalesce sends within one scheduling tick into one exported
    /// snapshot: consumers read the latest counter value, not each bump.
    pub fn update_soon(&self) {
        self.inner.updates.send_modify(|tick| *tick = tick.wrapping_add(1));
    }

    /// Create the root owner without running it; tests drive it directly.
    pub fn create_root(&self, block: Block) -> ProgramOwner {
        let id = self.create_handle(None);
        *self.inner.root.lock() = Some(id.clone());
        ProgramOwner { handle: ProgramHandle { master: self.clone(), id }, block }
    }

    /// Instantiate the root program and run it on a background task.
    pub fn start(&self, block: Block, stack: EvalStack) {
        let owner = self.create_root(block);
        let master = self.clone();
        let task = tokio::spawn(async move {
            let result = owner.run(stack).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "protocol run failed");
            }
            master.update_soon();
            result
        });
        *self.inner.run.lock() = Some(task);
    }

    /// Await the background run started by [`Master::start`].
    pub async fn wait(&self) -> Result<(), ExecError> {
        let task = self.inner.run.lock().take();
        match task {
            Some(task) => task
                .await
                .unwrap_or_else(|e| Err(ExecError::internal(format!("run task failed: {e}")))),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.root.lock().is_some()
    }

    /// Recursive location tree for the client snapshot.
    pub fn export(&self) -> Option<Json> {
        let root = self.inner.root.lock().clone()?;
        let handles = self.inner.handles.lock();
        Some(export_node(&handles, &root)?)
    }

    /// Route a client command along a child-key path from the root.
    pub fn dispatch(&self, path: &[u32], command: RunCommand) -> Result<(), ExecError> {
        let id = self.resolve(path)?;
        let control = match command {
            RunCommand::Halt => Control::Halt,
            RunCommand::Jump { point } => Control::Jump { point },
            RunCommand::Pause => {
                let (done, ack) = oneshot::channel();
                spawn_ack_logger("pause", ack);
                Control::Pause { loose: false, done }
            }
            RunCommand::Resume => {
                let (done, ack) = oneshot::channel();
                spawn_ack_logger("resume", ack);
                Control::Resume { loose: false, done }
            }
        };
        if !self.send_control(&id, control) {
            return Err(ExecError::internal(format!("no running program at {path:?}")));
        }
        Ok(())
    }

    fn resolve(&self, path: &[u32]) -> Result<HandleId, ExecError> {
        let mut current = self
            .inner
            .root
            .lock()
            .clone()
            .ok_or_else(|| ExecError::internal("no running protocol"))?;
        let handles = self.inner.handles.lock();
        for key in path {
            let node = handles
                .get(&current)
                .ok_or_else(|| ExecError::internal("dangling handle"))?;
            current = node
                .children
                .get(key)
                .cloned()
                .ok_or_else(|| ExecError::internal(format!("no child {key}")))?;
        }
        Ok(current)
    }

    fn create_handle(&self, parent: Option<HandleId>) -> HandleId {
        let id = HandleId::new();
        let mut handles = self.inner.handles.lock();
        let symbol = match &parent {
            Some(parent_id) => {
                let parent_node = handles.get_mut(parent_id);
                match parent_node {
                    Some(node) => {
                        let index = node.next_symbol_index;
                        node.next_symbol_index += 1;
                        node.symbol.child(index)
                    }
                    None => ClaimSymbol::root().child(0),
                }
            }
            None => ClaimSymbol::root().child(0),
        };
        if let Some(parent_id) = &parent {
            if let Some(parent_node) = handles.get_mut(parent_id) {
                let key = parent_node.next_child_key;
                parent_node.next_child_key += 1;
                parent_node.children.insert(key, id.clone());
            }
        }
        handles.insert(id.clone(), HandleNode::new(parent, symbol));
        id
    }

    pub(crate) fn take_control(&self, id: &HandleId) -> Option<ControlRx> {
        self.inner.handles.lock().get_mut(id).and_then(|node| node.control_rx.take())
    }

    pub(crate) fn send_control(&self, id: &HandleId, control: Control) -> bool {
        let sender = self.inner.handles.lock().get(id).map(|node| node.control_tx.clone());
        match sender {
            Some(sender) => sender.send(control).is_ok(),
            None => false,
        }
    }

    pub(crate) fn detach(&self, id: &HandleId) {
        let mut handles = self.inner.handles.lock();
        let parent = handles.get(id).and_then(|node| node.parent.clone());
        if let Some(parent) = parent {
            if let Some(parent_node) = handles.get_mut(&parent) {
                parent_node.children.retain(|_, child| &*child != id);
            }
        }
        handles.remove(id);
        drop(handles);

        let mut root = self.inner.root.lock();
        if root.as_ref() == Some(id) {
            *root = None;
        }
    }

    pub(crate) fn record_event(&self, id: &HandleId, event: &ProgramExecEvent) {
        {
            let mut handles = self.inner.handles.lock();
            if let Some(node) = handles.get_mut(id) {
                node.location = Some(event.location.clone());
                if !event.errors.is_empty() {
                    node.errors.extend(event.errors.iter().cloned());
                }
            }
        }
        self.inner.history.lock().push((id.clone(), event.clone()));
    }

    /// Every event received so far, in emission order.
    pub fn history(&self) -> Vec<(HandleId, ProgramExecEvent)> {
        self.inner.history.lock().clone()
    }

    pub(crate) fn set_busy(&self, id: &HandleId, busy: bool) {
        if let Some(node) = self.inner.handles.lock().get_mut(id) {
            node.busy = busy;
        }
    }

    pub(crate) fn busy(&self, id: &HandleId) -> bool {
        self.inner.handles.lock().get(id).map(|node| node.busy).unwrap_or(false)
    }

    /// Handle ids from `id` up to the root, self first.
    pub(crate) fn lineage(&self, id: &HandleId) -> Vec<HandleId> {
        let handles = self.inner.handles.lock();
        let mut chain = Vec::new();
        let mut current = Some(id.clone());
        while let Some(id) = current {
            current = handles.get(&id).and_then(|node| node.parent.clone());
            chain.push(id);
        }
        chain
    }

    /// Child-key path from the root to `id`; lexicographic order is source
    /// order.
    pub(crate) fn position_of(&self, id: &HandleId) -> Vec<u32> {
        let handles = self.inner.handles.lock();
        let mut position = Vec::new();
        let mut current = id.clone();
        while let Some(parent) = handles.get(&current).and_then(|node| node.parent.clone()) {
            if let Some(parent_node) = handles.get(&parent) {
                if let Some((key, _)) =
                    parent_node.children.iter().find(|(_, child)| **child == current)
                {
                    position.push(*key);
                }
            }
            current = parent;
        }
        position.reverse();
        position
    }

    pub(crate) fn children_of(&self, id: &HandleId) -> Vec<HandleId> {
        self.inner
            .handles
            .lock()
            .get(id)
            .map(|node| node.children.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn parent_of(&self, id: &HandleId) -> Option<HandleId> {
        self.inner.handles.lock().get(id).and_then(|node| node.parent.clone())
    }

    pub(crate) fn symbol_of(&self, id: &HandleId) -> ClaimSymbol {
        self.inner
            .handles
            .lock()
            .get(id)
            .map(|node| node.symbol.clone())
            .unwrap_or_else(ClaimSymbol::root)
    }
}

fn spawn_ack_logger(what: &'static str, ack: AckRx) {
    tokio::spawn(async move {
        match ack.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "{what} refused"),
            Err(_) => tracing::debug!("{what} target terminated before acknowledging"),
        }
    });
}

fn export_node(handles: &HashMap<HandleId, HandleNode>, id: &HandleId) -> Option<Json> {
    let node = handles.get(id)?;
    let children: serde_json::Map<String, Json> = node
        .children
        .iter()
        .filter_map(|(key, child)| Some((key.to_string(), export_node(handles, child)?)))
        .collect();
    Some(serde_json::json!({
        "location": node.location.as_ref().map(|loc| loc.export()),
        "errors": node.errors,
        "children": children,
    }))
}

/// A program's connection to the master: its structural tree node.
#[derive(Clone)]
pub struct ProgramHandle {
    master: Master,
    id: HandleId,
}

impl ProgramHandle {
    pub fn id(&self) -> &HandleId {
        &self.id
    }

    pub fn master(&self) -> &Master {
        &self.master
    }

    /// Publish an event; the master coalesces into the next snapshot.
    pub fn send(&self, event: ProgramExecEvent) {
        self.master.record_event(&self.id, &event);
        self.master.update_soon();
    }

    /// Instantiate a child program; drive it with [`ProgramOwner::run`].
    pub fn create_child(&self, block: Block) -> ProgramOwner {
        let child = self.master.create_handle(Some(self.id.clone()));
        ProgramOwner { handle: ProgramHandle { master: self.master.clone(), id: child }, block }
    }

    /// Request every child to pause; returns one ack per child. The caller
    /// awaits them while servicing its own control queue.
    pub(crate) fn request_pause_children(&self) -> Vec<AckRx> {
        self.master
            .children_of(&self.id)
            .into_iter()
            .filter_map(|child| {
                let (done, ack) = oneshot::channel();
                if self.master.send_control(&child, Control::Pause { loose: true, done }) {
                    Some(ack)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Request the parent to reach `Normal`; `None` at the root.
    pub(crate) fn request_resume_parent(&self) -> Option<AckRx> {
        let parent = self.master.parent_of(&self.id)?;
        let (done, ack) = oneshot::channel();
        if self.master.send_control(&parent, Control::Resume { loose: true, done }) {
            Some(ack)
        } else {
            None
        }
    }

    pub(crate) fn forward(&self, child: &HandleId, control: Control) -> bool {
        self.master.send_control(child, control)
    }

    pub fn set_busy(&self, busy: bool) {
        self.master.set_busy(&self.id, busy);
    }

    /// Handle ids from this handle up to the root, self first.
    pub fn lineage(&self) -> Vec<HandleId> {
        self.master.lineage(&self.id)
    }

    /// Child-key path from the root; lexicographic order is source order.
    pub fn position(&self) -> Vec<u32> {
        self.master.position_of(&self.id)
    }

    pub fn symbol(&self) -> ClaimSymbol {
        self.master.symbol_of(&self.id)
    }

    pub fn epoch_ms(&self) -> u64 {
        self.master.inner.clock.epoch_ms()
    }
}

/// Drives one child program to completion.
pub struct ProgramOwner {
    handle: ProgramHandle,
    block: Block,
}

impl ProgramOwner {
    pub fn handle(&self) -> &ProgramHandle {
        &self.handle
    }

    /// The child's mode machine is mid-transition.
    pub fn busy(&self) -> bool {
        self.handle.master.busy(&self.handle.id)
    }

    /// Run the program on its own task; detaches the handle when it
    /// returns.
    pub async fn run(self, stack: EvalStack) -> Result<(), ExecError> {
        let ProgramOwner { handle, block } = self;
        let control = handle
            .master
            .take_control(&handle.id)
            .ok_or_else(|| ExecError::internal("program already running"))?;

        let task = tokio::spawn(run_block(block, handle.clone(), control, stack));
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(ExecError::internal(format!("program task failed: {e}"))),
        };

        handle.master.detach(&handle.id);
        handle.master.update_soon();
        result
    }
}

#[cfg(test)]
#[path = "master_tests.rs"]
mod tests;
