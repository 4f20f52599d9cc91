// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Isolate trait definitions.
//!
//! Defines the abstract interface for slave process backends.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Errors from isolate operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IsolateError {
    /// Worker binary was not found.
    #[error("binary not found: {0}")]
    BinaryNotFound(String),

    /// Process/worker failed to start.
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// The process handle refers to a slave this isolate does not track.
    #[error("unknown slave process: {0}")]
    UnknownProcess(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type for isolate operations.
pub type Result<T> = std::result::Result<T, IsolateError>;

/// Everything an isolate needs to start one slave.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// App the slave will serve.
    pub app: String,
    /// Uuid the worker must present in its handshake.
    pub slave_id: Uuid,
    /// Worker binary (or behavior name, for mock backends).
    pub binary: String,
    /// Extra arguments for the worker binary.
    pub args: Vec<String>,
    /// Engine endpoint the worker dials back to.
    pub endpoint: String,
    /// Custom environment variables (applied after system vars, can override).
    pub env: HashMap<String, String>,
}

/// Lifecycle events reported for a spawned child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEvent {
    /// Child exited on its own with the given code.
    Exited(i32),
    /// Child was killed by the given signal.
    Crashed(i32),
}

/// Observed state of a spawned child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(i32),
    Crashed(i32),
    /// The isolate no longer tracks this process.
    Unknown,
}

/// Handle for a spawned slave process.
///
/// The engine owns the handle for the slave's whole life; the child event
/// receiver is taken once and merged into the engine's event stream.
pub struct SlaveProcess {
    /// Backend-specific identifier (PID for processes, task id for mocks).
    pub process_id: String,
    /// Uuid of the slave this process backs.
    pub slave_id: Uuid,
    /// When the process was started.
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// PID of the spawned child, captured at spawn time. None for mocks.
    pub spawned_pid: Option<u32>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChildEvent>>>,
}

impl SlaveProcess {
    pub fn new(
        process_id: String,
        slave_id: Uuid,
        spawned_pid: Option<u32>,
        events: mpsc::UnboundedReceiver<ChildEvent>,
    ) -> Self {
        Self {
            process_id,
            slave_id,
            started_at: chrono::Utc::now(),
            spawned_pid,
            events: Mutex::new(Some(events)),
        }
    }

    /// Take the child event receiver. Returns None on the second call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChildEvent>> {
        self.events.lock().expect("event slot poisoned").take()
    }
}

impl std::fmt::Debug for SlaveProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveProcess")
            .field("process_id", &self.process_id)
            .field("slave_id", &self.slave_id)
            .field("spawned_pid", &self.spawned_pid)
            .finish_non_exhaustive()
    }
}

/// Trait for slave process backends.
///
/// Isolates are PURE execution engines: they start and stop workers and
/// report child lifecycle events. Handshakes, liveness and job routing are
/// the engine's business.
#[async_trait]
pub trait Isolate: Send + Sync {
    /// Isolate type identifier (e.g. "process", "mock").
    fn isolate_type(&self) -> &'static str;

    /// Start one slave. The worker is expected to dial `spec.endpoint` and
    /// present `spec.slave_id` in its handshake.
    async fn spawn(&self, spec: &SpawnSpec) -> Result<SlaveProcess>;

    /// Stop a slave: graceful request first, force-kill after `grace`.
    async fn terminate(&self, process: &SlaveProcess, grace: Duration) -> Result<()>;

    /// Check what the child is currently doing.
    async fn status(&self, process: &SlaveProcess) -> ProcessStatus;
}
