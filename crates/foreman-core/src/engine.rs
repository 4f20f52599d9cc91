// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The per-app engine: slave pool supervisor and dispatch loop.
//!
//! Each engine is one event-loop task owning its queue and slave table
//! outright, so nothing inside it needs a lock. The loop multiplexes
//! control commands, slave I/O events, inbound worker connections and the
//! earliest pending timer; after every stimulus it runs one scheduler
//! pass: drop expired jobs, pair queued jobs with idle slaves, grow the
//! pool by at most one slave.
//!
//! Counters live in a shared atomic block so `info()` never crosses into
//! the event loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use foreman_isolate::{Isolate, SpawnSpec};
use foreman_protocol::{Frame, FrameKind, Listener, Transport};

use crate::error::{EnqueueError, Error, Result};
use crate::job::{FaultKind, Job, JobHandle, JobId, JobMode, Outcome};
use crate::manifest::{Manifest, Profile};
use crate::queue::{JobQueue, RejectReason};
use crate::slave::{ActiveJob, SlaveEntry, SlaveEvent, SlaveState, spawn_greeter};

/// Scheduler backstop tick; the loop normally wakes on events and timers.
const TICK_INTERVAL: Duration = Duration::from_millis(500);
/// Pause after a failed spawn before the grow step tries again.
const SPAWN_BACKOFF: Duration = Duration::from_secs(1);
/// Sleep horizon when nothing has a deadline.
const IDLE_WAKE: Duration = Duration::from_secs(3600);

const STATE_STOPPED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;

/// One invocation request as submitted by a caller.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub method: String,
    pub payload: Bytes,
    pub mode: JobMode,
    /// Relative deadline; converted to an absolute instant at creation.
    pub deadline: Option<Duration>,
}

impl JobRequest {
    pub fn new(method: impl Into<String>, payload: Bytes) -> Self {
        Self {
            method: method.into(),
            payload,
            mode: JobMode::Normal,
            deadline: None,
        }
    }

    pub fn urgent(mut self) -> Self {
        self.mode = JobMode::Urgent;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Counter snapshot returned by [`Engine::info`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub state: String,
    pub uptime_secs: Option<f64>,
    pub queue_depth: usize,
    pub queue_peak: usize,
    pub pool_size: usize,
    pub slaves_spawned: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub jobs_expired: u64,
    pub jobs_requeued: u64,
}

#[derive(Default)]
struct EngineStats {
    state: AtomicU8,
    depth: AtomicUsize,
    peak: AtomicUsize,
    pool: AtomicUsize,
    spawned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    expired: AtomicU64,
    requeued: AtomicU64,
    started_at_ms: AtomicU64,
}

impl EngineStats {
    fn snapshot(&self) -> EngineInfo {
        let state = match self.state.load(Ordering::Relaxed) {
            STATE_RUNNING => "running",
            STATE_STOPPING => "stopping",
            _ => "stopped",
        };
        let started = self.started_at_ms.load(Ordering::Relaxed);
        let uptime_secs = if state == "stopped" || started == 0 {
            None
        } else {
            let now = chrono::Utc::now().timestamp_millis() as u64;
            Some(now.saturating_sub(started) as f64 / 1000.0)
        };
        EngineInfo {
            state: state.to_string(),
            uptime_secs,
            queue_depth: self.depth.load(Ordering::Relaxed),
            queue_peak: self.peak.load(Ordering::Relaxed),
            pool_size: self.pool.load(Ordering::Relaxed),
            slaves_spawned: self.spawned.load(Ordering::Relaxed),
            jobs_completed: self.completed.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_cancelled: self.cancelled.load(Ordering::Relaxed),
            jobs_expired: self.expired.load(Ordering::Relaxed),
            jobs_requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Enqueue {
        job: Job,
        reply: oneshot::Sender<std::result::Result<(), EnqueueError>>,
    },
    Cancel {
        id: JobId,
        reply: oneshot::Sender<bool>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

enum Lifecycle {
    Stopped,
    Running {
        cmd_tx: mpsc::UnboundedSender<Command>,
        task: JoinHandle<()>,
    },
}

struct EngineInner {
    manifest: Manifest,
    profile: Profile,
    isolate: Arc<dyn Isolate>,
    transport: Arc<dyn Transport>,
    bind_endpoint: String,
    stats: Arc<EngineStats>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

/// Handle to one app's engine. Cheap to clone; the engine itself is the
/// event-loop task behind it.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        manifest: Manifest,
        profile: Profile,
        isolate: Arc<dyn Isolate>,
        transport: Arc<dyn Transport>,
        bind_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                manifest,
                profile,
                isolate,
                transport,
                bind_endpoint: bind_endpoint.into(),
                stats: Arc::new(EngineStats::default()),
                lifecycle: tokio::sync::Mutex::new(Lifecycle::Stopped),
            }),
        }
    }

    pub fn app_name(&self) -> &str {
        &self.inner.manifest.name
    }

    pub fn profile(&self) -> &Profile {
        &self.inner.profile
    }

    /// Transition from stopped to running. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Running { .. }) {
            return Ok(());
        }

        let listener = self
            .inner
            .transport
            .bind(&self.inner.bind_endpoint)
            .await
            .map_err(|e| Error::Internal(format!("cannot bind slave endpoint: {e}")))?;
        let endpoint = listener.local_endpoint();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let engine_loop = EngineLoop {
            name: self.inner.manifest.name.clone(),
            manifest: self.inner.manifest.clone(),
            profile: self.inner.profile.clone(),
            isolate: self.inner.isolate.clone(),
            listener,
            endpoint: endpoint.clone(),
            queue: JobQueue::new(self.inner.profile.queue_limit),
            slaves: HashMap::new(),
            idle: VecDeque::new(),
            events_tx,
            events_rx,
            cmd_rx,
            stats: self.inner.stats.clone(),
            draining: false,
            commands_closed: false,
            listener_dead: false,
            stop_reply: None,
            spawn_backoff_until: None,
        };

        self.inner
            .stats
            .started_at_ms
            .store(chrono::Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
        self.inner.stats.state.store(STATE_RUNNING, Ordering::Relaxed);

        let task = tokio::spawn(engine_loop.run());
        *lifecycle = Lifecycle::Running { cmd_tx, task };

        info!(app = %self.inner.manifest.name, endpoint = %endpoint, "engine started");
        Ok(())
    }

    /// Drain and stop: fail pending jobs, terminate every slave, wait for
    /// the pool to empty. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let Lifecycle::Running { cmd_tx, task } =
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        else {
            return;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if cmd_tx.send(Command::Stop { reply: reply_tx }).is_ok() {
            let _ = reply_rx.await;
        }
        if let Err(e) = task.await {
            // An internal panic tears down this engine only, never the node.
            error!(app = %self.inner.manifest.name, error = %e, "engine task terminated abnormally");
        }

        self.inner.stats.state.store(STATE_STOPPED, Ordering::Relaxed);
        info!(app = %self.inner.manifest.name, "engine stopped");
    }

    /// Submit one job. The returned handle receives response frames and
    /// exactly one terminal outcome.
    pub async fn enqueue(&self, request: JobRequest) -> std::result::Result<JobHandle, EnqueueError> {
        let cmd_tx = {
            let lifecycle = self.inner.lifecycle.lock().await;
            match &*lifecycle {
                Lifecycle::Running { cmd_tx, .. } => cmd_tx.clone(),
                Lifecycle::Stopped => return Err(EnqueueError::EngineStopped),
            }
        };

        let (job, handle) = Job::new(request.method, request.payload, request.mode, request.deadline);
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Enqueue {
                job,
                reply: reply_tx,
            })
            .map_err(|_| EnqueueError::EngineStopped)?;

        match reply_rx.await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err(EnqueueError::EngineStopped),
        }
    }

    /// Cancel a job. True if it was found queued or in flight.
    pub async fn cancel(&self, id: JobId) -> bool {
        let cmd_tx = {
            let lifecycle = self.inner.lifecycle.lock().await;
            match &*lifecycle {
                Lifecycle::Running { cmd_tx, .. } => cmd_tx.clone(),
                Lifecycle::Stopped => return false,
            }
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if cmd_tx.send(Command::Cancel { id, reply: reply_tx }).is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Counter snapshot. Safe to call from any thread; never touches the
    /// event loop.
    pub fn info(&self) -> EngineInfo {
        self.inner.stats.snapshot()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("app", &self.inner.manifest.name)
            .field("profile", &self.inner.profile.name)
            .finish_non_exhaustive()
    }
}

enum Removal {
    /// Slave failure: the assigned job is re-queued once or failed.
    Broken(FaultKind),
    /// Expected exit of a terminating slave.
    Graceful,
}

struct EngineLoop {
    name: String,
    manifest: Manifest,
    profile: Profile,
    isolate: Arc<dyn Isolate>,
    listener: Box<dyn Listener>,
    endpoint: String,
    queue: JobQueue,
    slaves: HashMap<Uuid, SlaveEntry>,
    /// Idle slaves in idle-return order, for dispatch fairness.
    idle: VecDeque<Uuid>,
    events_tx: mpsc::UnboundedSender<SlaveEvent>,
    events_rx: mpsc::UnboundedReceiver<SlaveEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    stats: Arc<EngineStats>,
    draining: bool,
    commands_closed: bool,
    listener_dead: bool,
    stop_reply: Option<oneshot::Sender<()>>,
    spawn_backoff_until: Option<Instant>,
}

impl EngineLoop {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let wake = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_WAKE);

            tokio::select! {
                biased;

                command = self.cmd_rx.recv(), if !self.commands_closed => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            // Handle dropped without stop(): drain anyway so
                            // no slave outlives its engine.
                            self.commands_closed = true;
                            self.begin_drain(None);
                        }
                    }
                }

                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                }

                accepted = self.listener.accept(), if !self.listener_dead => {
                    match accepted {
                        Ok(channel) => spawn_greeter(
                            channel,
                            self.profile.startup_timeout,
                            self.events_tx.clone(),
                        ),
                        Err(e) => {
                            error!(app = %self.name, error = %e, "slave listener failed");
                            self.listener_dead = true;
                        }
                    }
                }

                _ = tick.tick() => {}

                _ = tokio::time::sleep_until(wake) => {}
            }

            self.expire_timers();
            self.rebalance();

            if self.draining && self.slaves.is_empty() {
                if let Some(reply) = self.stop_reply.take() {
                    let _ = reply.send(());
                }
                break;
            }
        }

        debug!(app = %self.name, "engine loop exited");
    }

    /// Earliest instant anything needs attention: a slave timer or a
    /// queued job's deadline.
    fn next_deadline(&self) -> Option<Instant> {
        let slave_deadline = self
            .slaves
            .values()
            .map(|entry| entry.deadline(&self.profile))
            .min();
        match (slave_deadline, self.queue.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { job, reply } => {
                if self.draining {
                    let _ = reply.send(Err(EnqueueError::EngineStopped));
                    return;
                }
                match self.queue.push(job, Instant::now()) {
                    Ok(()) => {
                        self.stats.depth.store(self.queue.depth(), Ordering::Relaxed);
                        self.stats.peak.store(self.queue.peak(), Ordering::Relaxed);
                        let _ = reply.send(Ok(()));
                    }
                    Err((job, reason)) => {
                        let reject = match reason {
                            RejectReason::QueueFull => EnqueueError::QueueFull,
                            RejectReason::DeadlineAlreadyPast => EnqueueError::DeadlineAlreadyPast,
                        };
                        debug!(app = %self.name, job = %job.id, reason = %reject, "job rejected");
                        let _ = reply.send(Err(reject));
                    }
                }
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel_job(id));
            }
            Command::Stop { reply } => self.begin_drain(Some(reply)),
        }
    }

    fn cancel_job(&mut self, id: JobId) -> bool {
        if let Some(mut job) = self.queue.cancel(id) {
            job.upstream.close(Outcome::Cancelled);
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            self.stats.depth.store(self.queue.depth(), Ordering::Relaxed);
            return true;
        }

        // In flight: free the upstream now, then ask the slave to stop.
        // The termination path reaps it; an unresponsive slave is
        // force-killed after the grace period.
        let holder = self
            .slaves
            .iter()
            .find(|(_, entry)| {
                entry
                    .assigned
                    .as_ref()
                    .is_some_and(|active| active.job.id == id)
            })
            .map(|(uuid, _)| *uuid);
        let Some(uuid) = holder else {
            return false;
        };

        let entry = self.slaves.get_mut(&uuid).expect("holder exists");
        let mut active = entry.assigned.take().expect("job assigned");
        active.job.upstream.close(Outcome::Cancelled);
        self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
        entry.send(Frame::terminate());
        entry.set_state(SlaveState::Terminating);
        debug!(app = %self.name, job = %id, slave = %uuid, "cancelled in-flight job");
        true
    }

    fn begin_drain(&mut self, reply: Option<oneshot::Sender<()>>) {
        if let Some(reply) = reply {
            if self.stop_reply.is_none() {
                self.stop_reply = Some(reply);
            }
        }
        if self.draining {
            return;
        }
        self.draining = true;
        self.stats.state.store(STATE_STOPPING, Ordering::Relaxed);
        info!(app = %self.name, slaves = self.slaves.len(), queued = self.queue.depth(), "engine draining");

        for mut job in self.queue.drain() {
            job.upstream.close(Outcome::Failed {
                kind: FaultKind::EngineStopped,
                message: "engine stopped".into(),
            });
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.depth.store(0, Ordering::Relaxed);
        self.idle.clear();

        let ids: Vec<Uuid> = self.slaves.keys().copied().collect();
        for uuid in ids {
            let state = self.slaves.get(&uuid).map(|entry| entry.state);
            match state {
                Some(SlaveState::Spawning) => {
                    // No channel to ask nicely on.
                    self.remove_slave(uuid, Removal::Broken(FaultKind::EngineStopped));
                }
                Some(SlaveState::Terminating) | None => {}
                Some(_) => {
                    let entry = self.slaves.get_mut(&uuid).expect("slave exists");
                    entry.send(Frame::terminate());
                    entry.set_state(SlaveState::Terminating);
                }
            }
        }
    }

    fn handle_event(&mut self, event: SlaveEvent) {
        match event {
            SlaveEvent::SpawnResult { uuid, result } => match result {
                Ok(process) => {
                    if self.slaves.contains_key(&uuid) {
                        let events = self.events_tx.clone();
                        let entry = self.slaves.get_mut(&uuid).expect("slave exists");
                        entry.attach_process(process, events);
                    } else {
                        // The entry timed out before the isolate came back.
                        let isolate = self.isolate.clone();
                        tokio::spawn(async move {
                            let _ = isolate.terminate(&process, Duration::ZERO).await;
                        });
                    }
                }
                Err(e) => {
                    error!(app = %self.name, slave = %uuid, error = %e, "slave spawn failed");
                    self.spawn_backoff_until = Some(Instant::now() + SPAWN_BACKOFF);
                    self.remove_slave(uuid, Removal::Broken(FaultKind::WorkerBroken));
                }
            },
            SlaveEvent::Connected { uuid, channel } => match self.slaves.get_mut(&uuid) {
                Some(entry) if entry.state == SlaveState::Spawning => {
                    let events = self.events_tx.clone();
                    entry.attach_channel(channel, events);
                    entry.last_active = Instant::now();
                    entry.set_state(SlaveState::Idle);
                    self.idle.push_back(uuid);
                    debug!(app = %self.name, slave = %uuid, "slave handshake complete");
                }
                _ => {
                    warn!(app = %self.name, slave = %uuid, "handshake from unknown slave, dropping connection");
                }
            },
            SlaveEvent::Frame { uuid, frame } => self.handle_frame(uuid, frame),
            SlaveEvent::ChannelClosed { uuid, error } => {
                let Some(entry) = self.slaves.get(&uuid) else {
                    return;
                };
                if entry.state == SlaveState::Terminating {
                    self.remove_slave(uuid, Removal::Graceful);
                } else {
                    if let Some(e) = error {
                        warn!(app = %self.name, slave = %uuid, error = %e, "slave channel error");
                    }
                    self.remove_slave(uuid, Removal::Broken(FaultKind::WorkerBroken));
                }
            }
            SlaveEvent::Child { uuid, event } => {
                let Some(entry) = self.slaves.get(&uuid) else {
                    return;
                };
                if entry.state == SlaveState::Terminating {
                    self.remove_slave(uuid, Removal::Graceful);
                } else {
                    warn!(app = %self.name, slave = %uuid, ?event, "slave process died unexpectedly");
                    self.remove_slave(uuid, Removal::Broken(FaultKind::WorkerBroken));
                }
            }
        }
    }

    fn handle_frame(&mut self, uuid: Uuid, frame: Frame) {
        let mut broke: Option<FaultKind> = None;

        {
            let Some(entry) = self.slaves.get_mut(&uuid) else {
                return;
            };
            // Every inbound frame is a liveness signal.
            entry.last_active = Instant::now();

            match frame.kind {
                FrameKind::Heartbeat => {}
                FrameKind::Chunk | FrameKind::Choke | FrameKind::Error => {
                    let session_ok = entry
                        .assigned
                        .as_ref()
                        .is_some_and(|active| active.job.id.as_u64() == frame.channel);
                    if !session_ok {
                        if entry.state != SlaveState::Terminating {
                            // Data for a session this slave does not hold.
                            broke = Some(FaultKind::WorkerProtocol);
                        }
                        // Terminating slaves may flush frames for a
                        // cancelled session; drop those silently.
                    } else {
                        match frame.kind {
                            FrameKind::Chunk => {
                                let active = entry.assigned.as_mut().expect("session checked");
                                active.streamed = true;
                                active.job.upstream.chunk(frame.payload);
                            }
                            FrameKind::Choke => {
                                let mut active = entry.assigned.take().expect("session checked");
                                active.job.upstream.close(Outcome::Completed);
                                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                                debug!(app = %self.name, slave = %uuid, job = %active.job.id, "job completed");
                                if entry.state == SlaveState::Busy {
                                    entry.set_state(SlaveState::Idle);
                                    self.idle.push_back(uuid);
                                }
                            }
                            FrameKind::Error => {
                                let mut active = entry.assigned.take().expect("session checked");
                                let (code, message) = frame
                                    .decode_error()
                                    .unwrap_or((0, "malformed error frame".into()));
                                warn!(app = %self.name, slave = %uuid, job = %active.job.id, code, "job failed in worker");
                                active.job.upstream.close(Outcome::Failed {
                                    kind: FaultKind::WorkerError,
                                    message,
                                });
                                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                                if entry.state == SlaveState::Busy {
                                    entry.set_state(SlaveState::Idle);
                                    self.idle.push_back(uuid);
                                }
                            }
                            _ => unreachable!(),
                        }
                    }
                }
                FrameKind::Handshake | FrameKind::Invoke | FrameKind::Terminate => {
                    warn!(app = %self.name, slave = %uuid, kind = ?frame.kind, "protocol violation from worker");
                    broke = Some(FaultKind::WorkerProtocol);
                }
            }
        }

        if let Some(fault) = broke {
            self.remove_slave(uuid, Removal::Broken(fault));
        }
    }

    fn expire_timers(&mut self) {
        let now = Instant::now();

        let expired = self.queue.drop_expired(now);
        if !expired.is_empty() {
            for mut job in expired {
                debug!(app = %self.name, job = %job.id, "job deadline exceeded in queue");
                job.upstream.close(Outcome::DeadlineExceeded);
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
            }
            self.stats.depth.store(self.queue.depth(), Ordering::Relaxed);
        }

        let due: Vec<(Uuid, SlaveState)> = self
            .slaves
            .iter()
            .filter(|(_, entry)| entry.deadline(&self.profile) <= now)
            .map(|(uuid, entry)| (*uuid, entry.state))
            .collect();

        for (uuid, state) in due {
            match state {
                SlaveState::Spawning => {
                    warn!(app = %self.name, slave = %uuid, "slave missed its startup deadline");
                    self.remove_slave(uuid, Removal::Broken(FaultKind::WorkerBroken));
                }
                SlaveState::Busy => {
                    warn!(app = %self.name, slave = %uuid, "slave stalled while holding a job");
                    self.remove_slave(uuid, Removal::Broken(FaultKind::WorkerStalled));
                }
                SlaveState::Idle => {
                    debug!(app = %self.name, slave = %uuid, "pruning idle slave");
                    let entry = self.slaves.get_mut(&uuid).expect("slave exists");
                    entry.send(Frame::terminate());
                    entry.set_state(SlaveState::Terminating);
                    self.idle.retain(|id| *id != uuid);
                }
                SlaveState::Terminating => {
                    warn!(app = %self.name, slave = %uuid, "slave ignored terminate, force-killing");
                    self.remove_slave(uuid, Removal::Broken(FaultKind::WorkerBroken));
                }
            }
        }
    }

    /// One scheduler pass: pair jobs with idle slaves, then grow by at
    /// most one slave.
    fn rebalance(&mut self) {
        if self.draining {
            return;
        }

        loop {
            if self.queue.is_empty() {
                break;
            }
            let Some(uuid) = self.pop_idle() else {
                break;
            };
            let job = self.queue.pop().expect("queue is non-empty");
            self.assign(uuid, job);
        }
        self.stats.depth.store(self.queue.depth(), Ordering::Relaxed);
        self.stats.peak.store(self.queue.peak(), Ordering::Relaxed);

        let depth = self.queue.depth();
        let pool = self.slaves.len();
        let backing_off = self
            .spawn_backoff_until
            .is_some_and(|until| until > Instant::now());
        if depth > pool * self.profile.grow_threshold
            && pool < self.profile.pool_limit
            && !backing_off
        {
            self.spawn_slave();
        }
    }

    fn pop_idle(&mut self) -> Option<Uuid> {
        while let Some(uuid) = self.idle.pop_front() {
            if self
                .slaves
                .get(&uuid)
                .is_some_and(|entry| entry.state == SlaveState::Idle)
            {
                return Some(uuid);
            }
        }
        None
    }

    fn assign(&mut self, uuid: Uuid, mut job: Job) {
        let frame = match Frame::invoke(job.id.as_u64(), &job.method, &job.payload) {
            Ok(frame) => frame,
            Err(e) => {
                job.upstream.close(Outcome::Failed {
                    kind: FaultKind::Internal,
                    message: format!("cannot encode invocation: {e}"),
                });
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let entry = self.slaves.get_mut(&uuid).expect("idle slave exists");
        if entry.send(frame) {
            debug!(app = %self.name, slave = %uuid, job = %job.id, method = %job.method, "job assigned");
            entry.assigned = Some(ActiveJob {
                job,
                streamed: false,
            });
            entry.last_active = Instant::now();
            entry.set_state(SlaveState::Busy);
        } else {
            // Writer already gone; the close event will reap the slave.
            // The invocation never left, so the job just goes back.
            self.queue.requeue(job);
        }
    }

    fn spawn_slave(&mut self) {
        let uuid = Uuid::new_v4();
        self.slaves.insert(uuid, SlaveEntry::new(uuid));
        self.stats.spawned.fetch_add(1, Ordering::Relaxed);
        self.stats.pool.store(self.slaves.len(), Ordering::Relaxed);

        let spec = SpawnSpec {
            app: self.name.clone(),
            slave_id: uuid,
            binary: self.profile.slave.clone(),
            args: Vec::new(),
            endpoint: self.endpoint.clone(),
            env: HashMap::from([("FOREMAN_APP_PATH".to_string(), self.manifest.path.clone())]),
        };
        let isolate = self.isolate.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = isolate.spawn(&spec).await;
            let _ = events.send(SlaveEvent::SpawnResult { uuid, result });
        });

        debug!(app = %self.name, slave = %uuid, pool = self.slaves.len(), "spawning slave");
    }

    fn remove_slave(&mut self, uuid: Uuid, removal: Removal) {
        let Some(mut entry) = self.slaves.remove(&uuid) else {
            return;
        };
        self.idle.retain(|id| *id != uuid);

        if let Some(mut active) = entry.assigned.take() {
            if self.draining {
                active.job.upstream.close(Outcome::Failed {
                    kind: FaultKind::EngineStopped,
                    message: "engine stopped".into(),
                });
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            } else {
                let fault = match removal {
                    Removal::Broken(fault) => fault,
                    Removal::Graceful => FaultKind::WorkerBroken,
                };
                let retriable = fault == FaultKind::WorkerBroken
                    && !active.streamed
                    && !active.job.retried;
                if retriable {
                    debug!(app = %self.name, job = %active.job.id, "re-queueing job lost to a broken slave");
                    active.job.retried = true;
                    self.stats.requeued.fetch_add(1, Ordering::Relaxed);
                    self.queue.requeue(active.job);
                    self.stats.depth.store(self.queue.depth(), Ordering::Relaxed);
                } else {
                    active.job.upstream.close(Outcome::Failed {
                        kind: fault,
                        message: format!("slave {uuid} lost"),
                    });
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if let Some(process) = entry.process.take() {
            let isolate = self.isolate.clone();
            let grace = match removal {
                Removal::Broken(_) => Duration::ZERO,
                Removal::Graceful => self.profile.termination_timeout,
            };
            tokio::spawn(async move {
                let _ = isolate.terminate(&process, grace).await;
            });
        }

        self.stats.pool.store(self.slaves.len(), Ordering::Relaxed);
        debug!(app = %self.name, slave = %uuid, pool = self.slaves.len(), "slave removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_request_builder() {
        let request = JobRequest::new("echo", Bytes::from_static(b"x"))
            .urgent()
            .deadline(Duration::from_secs(1));
        assert_eq!(request.mode, JobMode::Urgent);
        assert_eq!(request.deadline, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_stats_snapshot_reports_state() {
        let stats = EngineStats::default();
        assert_eq!(stats.snapshot().state, "stopped");
        assert!(stats.snapshot().uptime_secs.is_none());

        stats.state.store(STATE_RUNNING, Ordering::Relaxed);
        stats
            .started_at_ms
            .store(chrono::Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
        let info = stats.snapshot();
        assert_eq!(info.state, "running");
        assert!(info.uptime_secs.is_some());
    }
}
