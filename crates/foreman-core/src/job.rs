// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Jobs and their upstreams.
//!
//! A job is immutable after creation and reaches exactly one terminal
//! outcome. The upstream is the caller-facing back-edge: response chunks
//! stream through it, and it seals itself on the first terminal event so
//! late frames from a dying slave cannot resurrect a finished job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Admission class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    /// Jumps ahead of the normal class in dispatch order.
    Urgent,
    /// Default class.
    Normal,
}

/// Process-monotonic job identifier. Doubles as the logical channel id on
/// the slave connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

impl JobId {
    fn next() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker- and engine-side failure kinds attached to failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The slave died or was dropped while the job was assigned to it.
    WorkerBroken,
    /// The slave stopped emitting frames while holding the job.
    WorkerStalled,
    /// The slave violated the wire protocol.
    WorkerProtocol,
    /// The worker itself reported an error frame.
    WorkerError,
    /// The engine was stopped while the job was in the system.
    EngineStopped,
    /// Engine-side invariant violation.
    Internal,
}

impl FaultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkerBroken => "worker_broken",
            Self::WorkerStalled => "worker_stalled",
            Self::WorkerProtocol => "worker_protocol",
            Self::WorkerError => "worker_error",
            Self::EngineStopped => "engine_stopped",
            Self::Internal => "internal",
        }
    }
}

/// The terminal outcome of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed { kind: FaultKind, message: String },
    Cancelled,
    DeadlineExceeded,
}

/// Events delivered on a job's upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// One response data frame, in worker emission order.
    Chunk(Bytes),
    /// The terminal event; nothing follows it.
    Close(Outcome),
}

/// Caller-facing response path for one job.
///
/// Sealed after the first terminal event: further sends are ignored.
#[derive(Debug)]
pub struct Upstream {
    tx: mpsc::UnboundedSender<UpstreamEvent>,
    sealed: bool,
}

impl Upstream {
    /// Deliver one response chunk. No-op once sealed.
    pub fn chunk(&mut self, payload: Bytes) {
        if self.sealed {
            return;
        }
        let _ = self.tx.send(UpstreamEvent::Chunk(payload));
    }

    /// Deliver the terminal event and seal the upstream.
    pub fn close(&mut self, outcome: Outcome) {
        if self.sealed {
            return;
        }
        self.sealed = true;
        let _ = self.tx.send(UpstreamEvent::Close(outcome));
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }
}

/// One invocation request: payload, policy, upstream.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub method: String,
    pub payload: Bytes,
    pub mode: JobMode,
    pub deadline: Option<Instant>,
    pub(crate) upstream: Upstream,
    /// Set when the job has consumed its one re-queue after a slave loss.
    pub(crate) retried: bool,
}

impl Job {
    /// Create a job and the handle its caller consumes responses from.
    pub fn new(
        method: impl Into<String>,
        payload: Bytes,
        mode: JobMode,
        deadline: Option<Duration>,
    ) -> (Self, JobHandle) {
        let id = JobId::next();
        let (tx, rx) = mpsc::unbounded_channel();
        let job = Self {
            id,
            method: method.into(),
            payload,
            mode,
            deadline: deadline.map(|timeout| Instant::now() + timeout),
            upstream: Upstream { tx, sealed: false },
            retried: false,
        };
        (job, JobHandle { id, events: rx })
    }
}

/// Receiving end of a job's upstream.
#[derive(Debug)]
pub struct JobHandle {
    pub id: JobId,
    events: mpsc::UnboundedReceiver<UpstreamEvent>,
}

/// Everything a finished job produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub chunks: Vec<Bytes>,
    pub outcome: Outcome,
}

impl JobHandle {
    /// Receive the next upstream event, None after the terminal event.
    pub async fn next_event(&mut self) -> Option<UpstreamEvent> {
        self.events.recv().await
    }

    /// Drain the upstream to its terminal event.
    ///
    /// An upstream dropped without a terminal event (the engine itself was
    /// torn down) reads as an `engine_stopped` failure.
    pub async fn collect(mut self) -> JobResult {
        let mut chunks = Vec::new();
        while let Some(event) = self.events.recv().await {
            match event {
                UpstreamEvent::Chunk(payload) => chunks.push(payload),
                UpstreamEvent::Close(outcome) => return JobResult { chunks, outcome },
            }
        }
        JobResult {
            chunks,
            outcome: Outcome::Failed {
                kind: FaultKind::EngineStopped,
                message: "upstream dropped without a terminal event".into(),
            },
        }
    }
}
