// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The host: chips, models, drafts, executors, and running masters.

use crate::config::{Config, ConfigError, Setup};
use labrun_core::{Clock, EvalStack, SystemClock, Value};
use labrun_devices::{DeviceExecutor, NodeTree, SimExecutor, SimExecutorConfig, UnitRunner};
use labrun_protocol::Draft;
use labrun_runtime::{ExecError, Master, MasterConfig, ProcessRegistry, RunCommand};
use labrun_wire::{ChipSnapshot, ClientMessage, HostInfo, Snapshot};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

labrun_core::define_id! {
    /// Identifier of one chip.
    pub struct ChipId("chp-");
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown chip '{0}'")]
    UnknownChip(String),
    #[error("unknown draft '{0}'")]
    UnknownDraft(String),
    #[error("unknown model '{0}'")]
    UnknownModel(String),
    #[error("draft '{0}' has errors")]
    InvalidDraft(String),
    #[error("chip '{0}' is already running a plan")]
    AlreadyRunning(String),
    #[error("unknown command namespace '{0}'")]
    UnknownNamespace(String),
    #[error(transparent)]
    Runtime(#[from] ExecError),
    #[error("device error: {0}")]
    Device(#[from] labrun_devices::NodeError),
}

/// A chip model loaded from `models/*.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    /// Per-namespace template for new chips' matrices.
    #[serde(default)]
    pub sheets: BTreeMap<String, Json>,
}

/// One bench assembly: a model instance that can run a plan.
pub struct Chip {
    pub id: ChipId,
    pub name: String,
    pub model_id: String,
    pub master: Option<Master>,
    /// Per-namespace mutable settings, updated by `setMatrix`.
    pub matrices: BTreeMap<String, Json>,
    /// Per-namespace executor companions; manual commands route here.
    pub runners: BTreeMap<String, Arc<dyn UnitRunner>>,
}

pub struct Host {
    id: String,
    name: String,
    start_time: u64,
    clock: Arc<dyn Clock>,
    nodes: NodeTree,
    processes: ProcessRegistry,
    executors: Vec<Arc<dyn DeviceExecutor>>,
    models: BTreeMap<String, Model>,
    chips: Mutex<HashMap<String, Chip>>,
    drafts: Mutex<BTreeMap<String, Draft>>,
    /// Bumped on every state change; the listener pushes a snapshot per
    /// observed change.
    changes: watch::Sender<u64>,
}

impl Host {
    /// Load configuration and bring up the executors.
    pub async fn new(config: &Config) -> Result<Arc<Self>, HostError> {
        let setup = Setup::load_or_init(&config.setup_path())?;
        let models = load_models(config)?;

        let nodes = NodeTree::new();
        let mut executors: Vec<Arc<dyn DeviceExecutor>> = Vec::new();
        for (namespace, unit_config) in &setup.units {
            // The simulated executor stands in for hardware drivers; any
            // unit section parseable as one becomes a sim namespace.
            match serde_yaml::from_value::<SimExecutorConfig>(unit_config.clone()) {
                Ok(sim) => {
                    executors.push(Arc::new(SimExecutor::from_config(namespace.clone(), &sim)));
                }
                Err(e) => {
                    tracing::warn!(namespace = %namespace, error = %e, "unit config ignored");
                }
            }
        }
        for executor in &executors {
            executor.initialize(&nodes).await?;
        }

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let start_time = clock.epoch_ms();
        tracing::info!(
            id = %setup.id,
            models = models.len(),
            executors = executors.len(),
            "host initialized"
        );

        Ok(Arc::new(Self {
            id: setup.id,
            name: setup.name,
            start_time,
            clock,
            nodes,
            processes: ProcessRegistry::builtin(),
            executors,
            models,
            chips: Mutex::new(HashMap::new()),
            drafts: Mutex::new(BTreeMap::new()),
            changes: watch::channel(0).0,
        }))
    }

    pub fn nodes(&self) -> &NodeTree {
        &self.nodes
    }

    /// Subscribe to state-change ticks.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn touched(&self) {
        self.changes.send_modify(|tick| *tick = tick.wrapping_add(1));
    }

    pub fn create_chip(&self, model_id: &str, name: &str) -> Result<ChipId, HostError> {
        let model = self
            .models
            .get(model_id)
            .ok_or_else(|| HostError::UnknownModel(model_id.to_string()))?;
        let id = ChipId::new();
        let runners = self
            .executors
            .iter()
            .map(|executor| {
                (executor.namespace().to_string(), executor.create_runner(id.as_str()))
            })
            .collect();
        let chip = Chip {
            id: id.clone(),
            name: name.to_string(),
            model_id: model.id.clone(),
            master: None,
            matrices: model.sheets.clone(),
            runners,
        };
        self.chips.lock().insert(id.to_string(), chip);
        self.touched();
        Ok(id)
    }

    pub fn delete_chip(&self, chip_id: &str) -> Result<(), HostError> {
        let removed = self.chips.lock().remove(chip_id);
        match removed {
            Some(chip) => {
                if let Some(master) = &chip.master {
                    let _ = master.dispatch(&[], RunCommand::Halt);
                }
                self.touched();
                Ok(())
            }
            None => Err(HostError::UnknownChip(chip_id.to_string())),
        }
    }

    pub fn create_draft(&self, draft_id: &str, source: &str) {
        let draft = Draft::new(draft_id, source);
        self.drafts.lock().insert(draft_id.to_string(), draft);
        self.touched();
    }

    /// Instantiate the draft's protocol on a chip and run it. Consumes the
    /// draft.
    pub fn start_plan(&self, chip_id: &str, draft_id: &str, codes: &Json) -> Result<(), HostError> {
        let draft = {
            let drafts = self.drafts.lock();
            drafts
                .get(draft_id)
                .cloned()
                .ok_or_else(|| HostError::UnknownDraft(draft_id.to_string()))?
        };
        let protocol = draft
            .protocol
            .as_ref()
            .ok_or_else(|| HostError::InvalidDraft(draft_id.to_string()))?;

        let mut chips = self.chips.lock();
        let chip = chips
            .get_mut(chip_id)
            .ok_or_else(|| HostError::UnknownChip(chip_id.to_string()))?;
        if chip.master.as_ref().is_some_and(Master::is_running) {
            return Err(HostError::AlreadyRunning(chip_id.to_string()));
        }

        let master = Master::new(MasterConfig {
            nodes: self.nodes.clone(),
            processes: self.processes.clone(),
            clock: Arc::clone(&self.clock),
        });
        master.start(protocol.root.clone(), codes_stack(codes));

        // Forward master updates into the host's change stream.
        let mut updates = master.updates();
        let changes = self.changes.clone();
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                changes.send_modify(|tick| *tick = tick.wrapping_add(1));
            }
        });

        chip.master = Some(master);
        drop(chips);

        self.drafts.lock().remove(draft_id);
        self.touched();
        tracing::info!(chip = chip_id, draft = draft_id, "plan started");
        Ok(())
    }

    /// Route a running-program control along a handle path.
    pub fn dispatch_run(
        &self,
        chip_id: &str,
        path: &[u32],
        command: RunCommand,
    ) -> Result<(), HostError> {
        let chips = self.chips.lock();
        let chip = chips
            .get(chip_id)
            .ok_or_else(|| HostError::UnknownChip(chip_id.to_string()))?;
        let master = chip
            .master
            .as_ref()
            .ok_or_else(|| HostError::UnknownChip(chip_id.to_string()))?;
        master.dispatch(path, command)?;
        Ok(())
    }

    /// Manual device control, routed to the chip's per-namespace runner.
    pub async fn command(
        &self,
        chip_id: &str,
        command: &BTreeMap<String, Json>,
    ) -> Result<(), HostError> {
        for (namespace, payload) in command {
            let runner = {
                let chips = self.chips.lock();
                let chip = chips
                    .get(chip_id)
                    .ok_or_else(|| HostError::UnknownChip(chip_id.to_string()))?;
                chip.runners
                    .get(namespace)
                    .cloned()
                    .ok_or_else(|| HostError::UnknownNamespace(namespace.clone()))?
            };
            runner.command(payload).await?;
        }
        self.touched();
        Ok(())
    }

    pub fn set_matrix(
        &self,
        chip_id: &str,
        update: &BTreeMap<String, Json>,
    ) -> Result<(), HostError> {
        let mut chips = self.chips.lock();
        let chip = chips
            .get_mut(chip_id)
            .ok_or_else(|| HostError::UnknownChip(chip_id.to_string()))?;
        for (namespace, value) in update {
            chip.matrices.insert(namespace.clone(), value.clone());
        }
        drop(chips);
        self.touched();
        Ok(())
    }

    /// Dispatch one client message.
    pub async fn process_message(&self, message: ClientMessage) -> Result<(), HostError> {
        match message {
            ClientMessage::Command { chip_id, command } => self.command(&chip_id, &command).await,
            ClientMessage::CreateChip { model_id } => {
                self.create_chip(&model_id, "Untitled chip").map(|_| ())
            }
            ClientMessage::DeleteChip { chip_id } => self.delete_chip(&chip_id),
            ClientMessage::CreateDraft { draft_id, source } => {
                self.create_draft(&draft_id, &source);
                Ok(())
            }
            ClientMessage::StartPlan { chip_id, draft_id, codes } => {
                self.start_plan(&chip_id, &draft_id, &codes)
            }
            ClientMessage::SetMatrix { chip_id, update } => self.set_matrix(&chip_id, &update),
            ClientMessage::Halt { chip_id, path } => {
                self.dispatch_run(&chip_id, &path, RunCommand::Halt)
            }
            ClientMessage::Pause { chip_id, path } => {
                self.dispatch_run(&chip_id, &path, RunCommand::Pause)
            }
            ClientMessage::Resume { chip_id, path } => {
                self.dispatch_run(&chip_id, &path, RunCommand::Resume)
            }
            ClientMessage::Jump { chip_id, path, point } => {
                self.dispatch_run(&chip_id, &path, RunCommand::Jump { point })
            }
        }
    }

    /// Full host state for the client protocol.
    pub fn snapshot(&self) -> Snapshot {
        let chips = {
            let chips = self.chips.lock();
            chips
                .values()
                .map(|chip| {
                    (
                        chip.id.to_string(),
                        ChipSnapshot {
                            id: chip.id.to_string(),
                            name: chip.name.clone(),
                            model_id: chip.model_id.clone(),
                            master: chip.master.as_ref().and_then(Master::export),
                            matrices: chip.matrices.clone(),
                            runners: chip
                                .runners
                                .iter()
                                .map(|(namespace, runner)| (namespace.clone(), runner.export()))
                                .collect(),
                        },
                    )
                })
                .collect()
        };

        let drafts = {
            let drafts = self.drafts.lock();
            drafts.iter().map(|(id, draft)| (id.clone(), draft.export())).collect()
        };

        Snapshot {
            info: HostInfo {
                id: self.id.clone(),
                name: self.name.clone(),
                start_time: self.start_time,
            },
            chips,
            models: self
                .models
                .iter()
                .map(|(id, model)| {
                    (id.clone(), serde_json::to_value(model).unwrap_or(Json::Null))
                })
                .collect(),
            devices: self
                .nodes
                .all()
                .into_iter()
                .map(|node| (node.id().to_string(), node.export()))
                .collect(),
            drafts,
            executors: self
                .executors
                .iter()
                .map(|e| (e.namespace().to_string(), e.export()))
                .collect(),
        }
    }
}

fn load_models(config: &Config) -> Result<BTreeMap<String, Model>, HostError> {
    let dir = config.models_dir();
    let mut models = BTreeMap::new();
    if !dir.exists() {
        return Ok(models);
    }
    let entries = std::fs::read_dir(&dir)
        .map_err(|source| ConfigError::Io { path: dir.clone(), source })?;
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::Io { path: dir.clone(), source })?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yml") {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        let model: Model = serde_yaml::from_str(&text)
            .map_err(|source| ConfigError::Yaml { path: path.clone(), source })?;
        models.insert(model.id.clone(), model);
    }
    Ok(models)
}

/// Start arguments become `$codes.<key>` variables.
fn codes_stack(codes: &Json) -> EvalStack {
    let mut frame = HashMap::new();
    if let Some(map) = codes.as_object() {
        for (key, value) in map {
            if let Ok(value) = serde_json::from_value::<Value>(value.clone()) {
                frame.insert(format!("codes.{key}"), value);
            }
        }
    }
    EvalStack::new().push(frame)
}

#[cfg(test)]
#[path = "host_tests.rs"]
mod tests;
