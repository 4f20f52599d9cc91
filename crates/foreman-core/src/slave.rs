// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The slave: one worker process, its channel, and its state machine.
//!
//! ```text
//!   spawning ── handshake ──▶ idle ── assign ──▶ busy
//!       │ startup timeout      │ idle timeout     │ choke/error
//!       ▼                      ▼                  ▼
//!    (broken)             terminating           idle
//!                              │ exit / timeout
//!                              ▼
//!                           (dead)
//! ```
//!
//! Broken and dead are exits from the table, not resting states: the
//! engine fails or re-queues the assigned job, reaps the process and
//! drops the entry. The entry owns its I/O tasks; dropping the entry
//! aborts them.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use foreman_isolate::{ChildEvent, IsolateError, SlaveProcess};
use foreman_protocol::{Frame, FrameChannel, FrameError, FrameKind};

use crate::job::Job;
use crate::manifest::Profile;

/// Live states of a slave. Broken/dead are removal paths, not states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveState {
    /// Process requested; waiting for the worker's handshake.
    Spawning,
    /// Handshaken and unassigned.
    Idle,
    /// Holding exactly one job.
    Busy,
    /// Told to stop; waiting for exit within the termination grace.
    Terminating,
}

impl SlaveState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Terminating => "terminating",
        }
    }
}

/// Events the per-slave tasks feed into the engine loop.
#[derive(Debug)]
pub(crate) enum SlaveEvent {
    /// The isolate finished (or failed) starting the process.
    SpawnResult {
        uuid: Uuid,
        result: Result<SlaveProcess, IsolateError>,
    },
    /// A connection presented a valid handshake for this uuid.
    Connected { uuid: Uuid, channel: FrameChannel },
    /// One inbound frame from the worker.
    Frame { uuid: Uuid, frame: Frame },
    /// The worker's channel closed or failed.
    ChannelClosed { uuid: Uuid, error: Option<FrameError> },
    /// The child process exited or crashed.
    Child { uuid: Uuid, event: ChildEvent },
}

/// A job currently assigned to a slave.
#[derive(Debug)]
pub(crate) struct ActiveJob {
    pub job: Job,
    /// Whether the upstream has observed at least one response frame.
    /// Streamed jobs are failed on slave loss, never re-queued.
    pub streamed: bool,
}

/// One slave as the engine tracks it.
pub(crate) struct SlaveEntry {
    pub id: Uuid,
    pub state: SlaveState,
    /// Present once the isolate spawn resolved.
    pub process: Option<SlaveProcess>,
    /// Outbound frame queue; present once handshaken.
    pub outbound: Option<mpsc::UnboundedSender<Frame>>,
    pub assigned: Option<ActiveJob>,
    /// When the current state was entered.
    pub state_since: Instant,
    /// Last inbound frame; every frame counts as liveness.
    pub last_active: Instant,
    /// Reader/writer/forwarder tasks, aborted when the entry is dropped.
    tasks: Vec<JoinHandle<()>>,
}

impl SlaveEntry {
    pub fn new(id: Uuid) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: SlaveState::Spawning,
            process: None,
            outbound: None,
            assigned: None,
            state_since: now,
            last_active: now,
            tasks: Vec::new(),
        }
    }

    /// The deadline the engine must act on for this slave, per state:
    /// handshake for spawning, prune for idle, liveness for busy,
    /// force-kill for terminating.
    pub fn deadline(&self, profile: &Profile) -> Instant {
        match self.state {
            SlaveState::Spawning => self.state_since + profile.startup_timeout,
            SlaveState::Idle => self.state_since + profile.idle_timeout,
            SlaveState::Busy => self.last_active + profile.heartbeat_timeout,
            SlaveState::Terminating => self.state_since + profile.termination_timeout,
        }
    }

    pub fn set_state(&mut self, state: SlaveState) {
        debug!(slave = %self.id, from = self.state.as_str(), to = state.as_str(), "slave transition");
        self.state = state;
        self.state_since = Instant::now();
    }

    /// Queue one frame for the worker. False when the writer is gone.
    pub fn send(&self, frame: Frame) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Attach the handshaken channel: split it and start the I/O tasks.
    pub fn attach_channel(
        &mut self,
        channel: FrameChannel,
        events: mpsc::UnboundedSender<SlaveEvent>,
    ) {
        let (mut reader, mut writer) = channel.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

        let uuid = self.id;
        let reader_events = events.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                match reader.read_frame().await {
                    Ok(frame) => {
                        if reader_events
                            .send(SlaveEvent::Frame { uuid, frame })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(FrameError::ConnectionClosed) => {
                        let _ = reader_events.send(SlaveEvent::ChannelClosed { uuid, error: None });
                        break;
                    }
                    Err(error) => {
                        let _ = reader_events.send(SlaveEvent::ChannelClosed {
                            uuid,
                            error: Some(error),
                        });
                        break;
                    }
                }
            }
        }));

        self.tasks.push(tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = writer.write_frame(&frame).await {
                    debug!(slave = %uuid, error = %e, "slave write failed");
                    break;
                }
            }
        }));

        self.outbound = Some(out_tx);
    }

    /// Attach the spawned process and start forwarding its child events.
    pub fn attach_process(
        &mut self,
        process: SlaveProcess,
        events: mpsc::UnboundedSender<SlaveEvent>,
    ) {
        let uuid = self.id;
        if let Some(mut child_events) = process.take_events() {
            self.tasks.push(tokio::spawn(async move {
                while let Some(event) = child_events.recv().await {
                    if events.send(SlaveEvent::Child { uuid, event }).is_err() {
                        break;
                    }
                }
            }));
        }
        self.process = Some(process);
    }
}

impl Drop for SlaveEntry {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Read the first frame off a fresh connection and report it as a
/// handshake if it is one. Anything else, and connections that stay mute
/// past `timeout`, are dropped on the floor; the spawning entry's own
/// startup timer handles the slave side.
pub(crate) fn spawn_greeter(
    mut channel: FrameChannel,
    timeout: std::time::Duration,
    events: mpsc::UnboundedSender<SlaveEvent>,
) {
    tokio::spawn(async move {
        let hello = match tokio::time::timeout(timeout, channel.read_frame()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                debug!(error = %e, "connection died before handshake");
                return;
            }
            Err(_) => {
                debug!("connection never sent a handshake");
                return;
            }
        };

        if hello.kind != FrameKind::Handshake {
            debug!(kind = ?hello.kind, "first frame was not a handshake");
            return;
        }

        let uuid = match hello.decode_handshake().ok().and_then(|raw| raw.parse().ok()) {
            Some(uuid) => uuid,
            None => {
                debug!("handshake carried an unparsable uuid");
                return;
            }
        };

        let _ = events.send(SlaveEvent::Connected { uuid, channel });
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn profile() -> Profile {
        Profile {
            name: "test".into(),
            startup_timeout: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(3),
            termination_timeout: Duration::from_secs(4),
            pool_limit: 2,
            queue_limit: 8,
            grow_threshold: 4,
            slave: "worker".into(),
        }
    }

    #[tokio::test]
    async fn test_deadline_tracks_state() {
        let profile = profile();
        let mut entry = SlaveEntry::new(Uuid::new_v4());

        assert_eq!(entry.deadline(&profile), entry.state_since + profile.startup_timeout);

        entry.set_state(SlaveState::Idle);
        assert_eq!(entry.deadline(&profile), entry.state_since + profile.idle_timeout);

        entry.set_state(SlaveState::Busy);
        entry.last_active = Instant::now();
        assert_eq!(entry.deadline(&profile), entry.last_active + profile.heartbeat_timeout);

        entry.set_state(SlaveState::Terminating);
        assert_eq!(
            entry.deadline(&profile),
            entry.state_since + profile.termination_timeout
        );
    }

    #[tokio::test]
    async fn test_send_without_channel_fails() {
        let entry = SlaveEntry::new(Uuid::new_v4());
        assert!(!entry.send(Frame::terminate()));
    }

    #[tokio::test]
    async fn test_greeter_forwards_valid_handshake() {
        let (near, far) = tokio::io::duplex(1024);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let uuid = Uuid::new_v4();

        spawn_greeter(
            FrameChannel::new(far),
            Duration::from_millis(500),
            events_tx,
        );

        let mut worker_side = FrameChannel::new(near);
        worker_side
            .write_frame(&Frame::handshake(&uuid.to_string()))
            .await
            .unwrap();

        match events_rx.recv().await.unwrap() {
            SlaveEvent::Connected { uuid: got, .. } => assert_eq!(got, uuid),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_greeter_drops_non_handshake() {
        let (near, far) = tokio::io::duplex(1024);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        spawn_greeter(
            FrameChannel::new(far),
            Duration::from_millis(100),
            events_tx,
        );

        let mut worker_side = FrameChannel::new(near);
        worker_side.write_frame(&Frame::heartbeat()).await.unwrap();

        // The greeter holds the only sender; it drops the channel and the
        // event stream closes without a Connected event.
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_greeter_times_out_mute_connection() {
        let (near, far) = tokio::io::duplex(1024);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        spawn_greeter(
            FrameChannel::new(far),
            Duration::from_millis(50),
            events_tx,
        );

        let _held_open = near;
        assert!(events_rx.recv().await.is_none());
    }
}
