// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The process runtime: user-supplied leaf operations as event streams.
//!
//! A process runs as its own task, pushing [`ProcessEvent`]s into a bounded
//! channel and draining a control channel for halt/pause/resume/jump. The
//! segment program couples this stream with its state location updates.

use crate::error::ExecError;
use async_trait::async_trait;
use labrun_core::{Clock, Notice};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One tick of a process's event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    /// The process reached a stable stop (pause or halt acknowledged).
    pub stopped: bool,
    /// The process will emit no further events.
    pub terminated: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Notice>,
}

impl ProcessEvent {
    pub fn running(location: Json) -> Self {
        Self { location: Some(location), time_ms: None, stopped: false, terminated: false, errors: Vec::new() }
    }

    pub fn stopped(location: Json) -> Self {
        Self { location: Some(location), time_ms: None, stopped: true, terminated: false, errors: Vec::new() }
    }

    pub fn terminated(location: Json) -> Self {
        Self { location: Some(location), time_ms: None, stopped: true, terminated: true, errors: Vec::new() }
    }
}

/// Control inputs forwarded by the segment program.
#[derive(Debug)]
pub enum ProcessControl {
    Halt,
    Pause,
    Resume,
    Jump { point: Json },
}

/// Everything a running process needs from its segment.
pub struct ProcessContext {
    pub events: mpsc::Sender<ProcessEvent>,
    pub control: mpsc::UnboundedReceiver<ProcessControl>,
    /// Resume position from a jump or an imported point.
    pub point: Option<Json>,
    pub clock: Arc<dyn Clock>,
}

impl ProcessContext {
    /// Push an event; a dropped receiver means the segment is gone and the
    /// process should wind down.
    pub async fn emit(&self, event: ProcessEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

/// A user-supplied leaf operation.
#[async_trait]
pub trait Process: Send + std::fmt::Debug {
    async fn run(self: Box<Self>, ctx: ProcessContext) -> Result<(), ExecError>;
}

/// Builds processes from segment payload data.
pub trait ProcessFactory: Send + Sync {
    fn create(&self, data: &Json) -> Result<Box<dyn Process>, ExecError>;
}

/// Namespace → factory registry, shared by every master on a host.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    factories: Arc<Mutex<HashMap<String, Arc<dyn ProcessFactory>>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in `timer` and `noop` processes.
    pub fn builtin() -> Self {
        let registry = Self::new();
        registry.register("timer", Arc::new(TimerFactory));
        registry.register("noop", Arc::new(NoopFactory));
        registry
    }

    pub fn register(&self, namespace: impl Into<String>, factory: Arc<dyn ProcessFactory>) {
        self.factories.lock().insert(namespace.into(), factory);
    }

    pub fn create(&self, namespace: &str, data: &Json) -> Result<Box<dyn Process>, ExecError> {
        let factory = self
            .factories
            .lock()
            .get(namespace)
            .cloned()
            .ok_or_else(|| ExecError::UnknownProcess(namespace.to_string()))?;
        factory.create(data)
    }
}

/// A spawned process: event stream out, control stream in.
pub(crate) struct ProcessHandle {
    pub events: mpsc::Receiver<ProcessEvent>,
    control: mpsc::UnboundedSender<ProcessControl>,
    pub task: JoinHandle<Result<(), ExecError>>,
}

impl ProcessHandle {
    pub fn halt(&self) {
        let _ = self.control.send(ProcessControl::Halt);
    }

    pub fn pause(&self) {
        let _ = self.control.send(ProcessControl::Pause);
    }

    pub fn resume(&self) {
        let _ = self.control.send(ProcessControl::Resume);
    }

    pub fn jump(&self, point: Json) {
        let _ = self.control.send(ProcessControl::Jump { point });
    }
}

/// Spawn `process` on its own task with a bounded event channel.
pub(crate) fn spawn_process(
    process: Box<dyn Process>,
    point: Option<Json>,
    clock: Arc<dyn Clock>,
) -> ProcessHandle {
    let (event_tx, event_rx) = mpsc::channel(8);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let ctx = ProcessContext { events: event_tx, control: control_rx, point, clock };
    let task = tokio::spawn(async move { process.run(ctx).await });
    ProcessHandle { events: event_rx, control: control_tx, task }
}

// ---- built-in processes ----

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TimerSpec {
    duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TimerPoint {
    remaining_ms: u64,
}

struct TimerFactory;

impl ProcessFactory for TimerFactory {
    fn create(&self, data: &Json) -> Result<Box<dyn Process>, ExecError> {
        let spec: TimerSpec = serde_json::from_value(data.clone())
            .map_err(|e| ExecError::ProcessData(e.to_string()))?;
        Ok(Box::new(TimerProcess { spec }))
    }
}

/// Waits a fixed duration; pausing remembers the remaining time.
#[derive(Debug)]
struct TimerProcess {
    spec: TimerSpec,
}

impl TimerProcess {
    fn location(remaining: Duration, paused: bool) -> Json {
        serde_json::json!({
            "remaining_ms": remaining.as_millis() as u64,
            "paused": paused,
        })
    }
}

#[async_trait]
impl Process for TimerProcess {
    async fn run(self: Box<Self>, mut ctx: ProcessContext) -> Result<(), ExecError> {
        let mut remaining = match &ctx.point {
            Some(point) => {
                let point: TimerPoint = serde_json::from_value(point.clone())
                    .map_err(|e| ExecError::ProcessData(e.to_string()))?;
                Duration::from_millis(point.remaining_ms)
            }
            None => Duration::from_millis(self.spec.duration_ms),
        };

        'running: loop {
            let deadline = tokio::time::Instant::now() + remaining;
            if !ctx.emit(ProcessEvent::running(Self::location(remaining, false))).await {
                return Ok(());
            }

            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        ctx.emit(ProcessEvent::terminated(Self::location(Duration::ZERO, false))).await;
                        return Ok(());
                    }
                    msg = ctx.control.recv() => match msg {
                        Some(ProcessControl::Halt) | None => {
                            ctx.emit(ProcessEvent::terminated(Self::location(
                                deadline.saturating_duration_since(tokio::time::Instant::now()),
                                false,
                            ))).await;
                            return Ok(());
                        }
                        Some(ProcessControl::Pause) => {
                            remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                            if !ctx.emit(ProcessEvent::stopped(Self::location(remaining, true))).await {
                                return Ok(());
                            }
                            // Wait for resume (or halt) while paused.
                            loop {
                                match ctx.control.recv().await {
                                    Some(ProcessControl::Resume) => continue 'running,
                                    Some(ProcessControl::Halt) | None => {
                                        ctx.emit(ProcessEvent::terminated(Self::location(remaining, true))).await;
                                        return Ok(());
                                    }
                                    Some(ProcessControl::Jump { point }) => {
                                        if let Ok(point) = serde_json::from_value::<TimerPoint>(point) {
                                            remaining = Duration::from_millis(point.remaining_ms);
                                        }
                                    }
                                    Some(ProcessControl::Pause) => {}
                                }
                            }
                        }
                        Some(ProcessControl::Resume) => {}
                        Some(ProcessControl::Jump { point }) => {
                            match serde_json::from_value::<TimerPoint>(point) {
                                Ok(point) => {
                                    remaining = Duration::from_millis(point.remaining_ms);
                                    continue 'running;
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "timer jump point rejected");
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

struct NoopFactory;

impl ProcessFactory for NoopFactory {
    fn create(&self, _data: &Json) -> Result<Box<dyn Process>, ExecError> {
        Ok(Box::new(NoopProcess))
    }
}

/// Completes immediately; useful for blocks that only exist to hold state.
#[derive(Debug)]
struct NoopProcess;

#[async_trait]
impl Process for NoopProcess {
    async fn run(self: Box<Self>, ctx: ProcessContext) -> Result<(), ExecError> {
        ctx.emit(ProcessEvent::terminated(Json::Null)).await;
        Ok(())
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
