// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock isolate for testing.
//!
//! Runs each "slave" as an in-process task connected back to the engine
//! through an [`InProcNet`] rendezvous. Worker behavior is pluggable, with
//! canned behaviors for the interesting failure modes: healthy echo, slow
//! echo, crash mid-job, mute worker, worker that never handshakes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use foreman_protocol::{FrameChannel, InProcNet, Transport};

use crate::traits::{
    ChildEvent, Isolate, IsolateError, ProcessStatus, Result, SlaveProcess, SpawnSpec,
};

/// Everything a scripted worker gets to work with.
pub struct WorkerContext {
    pub app: String,
    pub slave_id: Uuid,
    pub channel: FrameChannel,
    /// Notified when the isolate is asked to terminate this worker.
    pub stop: Arc<Notify>,
}

/// A scripted worker: runs to completion and returns its exit code.
pub type WorkerBehavior = Arc<dyn Fn(WorkerContext) -> BoxFuture<'static, i32> + Send + Sync>;

struct MockSlave {
    status: Arc<Mutex<ProcessStatus>>,
    stop: Arc<Notify>,
    events: mpsc::UnboundedSender<ChildEvent>,
    task: JoinHandle<()>,
}

/// Mock isolate for testing.
pub struct MockIsolate {
    net: InProcNet,
    behavior: WorkerBehavior,
    slaves: Arc<Mutex<HashMap<String, MockSlave>>>,
}

impl MockIsolate {
    /// Mock isolate whose workers echo every invocation.
    pub fn echo(net: InProcNet) -> Self {
        Self::with_behavior(net, behaviors::echo())
    }

    /// Mock isolate with a custom worker script.
    pub fn with_behavior(net: InProcNet, behavior: WorkerBehavior) -> Self {
        Self {
            net,
            behavior,
            slaves: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replace the behavior used for subsequent spawns.
    pub fn set_behavior(&mut self, behavior: WorkerBehavior) {
        self.behavior = behavior;
    }

    /// Number of workers currently tracked as running. Tests use this to
    /// assert nothing survives an engine drain.
    pub fn running_count(&self) -> usize {
        self.slaves
            .lock()
            .expect("slave table poisoned")
            .values()
            .filter(|slave| {
                matches!(
                    *slave.status.lock().expect("status poisoned"),
                    ProcessStatus::Running
                )
            })
            .count()
    }

    fn entry_status(&self, process_id: &str) -> Option<Arc<Mutex<ProcessStatus>>> {
        self.slaves
            .lock()
            .expect("slave table poisoned")
            .get(process_id)
            .map(|s| s.status.clone())
    }
}

#[async_trait]
impl Isolate for MockIsolate {
    fn isolate_type(&self) -> &'static str {
        "mock"
    }

    async fn spawn(&self, spec: &SpawnSpec) -> Result<SlaveProcess> {
        let channel = self
            .net
            .connect(&spec.endpoint)
            .await
            .map_err(|e| IsolateError::SpawnFailed(e.to_string()))?;

        let process_id = spec.slave_id.to_string();
        let stop = Arc::new(Notify::new());
        let status = Arc::new(Mutex::new(ProcessStatus::Running));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let context = WorkerContext {
            app: spec.app.clone(),
            slave_id: spec.slave_id,
            channel,
            stop: stop.clone(),
        };

        let worker = (self.behavior)(context);
        let task_status = status.clone();
        let task_events = events_tx.clone();
        let task = tokio::spawn(async move {
            let code = worker.await;
            let mut current = task_status.lock().expect("status poisoned");
            if matches!(*current, ProcessStatus::Running) {
                *current = ProcessStatus::Exited(code);
                let _ = task_events.send(ChildEvent::Exited(code));
            }
        });

        self.slaves.lock().expect("slave table poisoned").insert(
            process_id.clone(),
            MockSlave {
                status,
                stop,
                events: events_tx,
                task,
            },
        );

        debug!(slave_id = %spec.slave_id, app = %spec.app, "spawned mock worker");

        Ok(SlaveProcess::new(process_id, spec.slave_id, None, events_rx))
    }

    async fn terminate(&self, process: &SlaveProcess, grace: Duration) -> Result<()> {
        let (status, stop) = {
            let table = self.slaves.lock().expect("slave table poisoned");
            let Some(entry) = table.get(&process.process_id) else {
                return Err(IsolateError::UnknownProcess(process.process_id.clone()));
            };
            (entry.status.clone(), entry.stop.clone())
        };

        if matches!(*status.lock().expect("status poisoned"), ProcessStatus::Running) {
            stop.notify_waiters();

            let deadline = tokio::time::Instant::now() + grace;
            while tokio::time::Instant::now() < deadline {
                if !matches!(*status.lock().expect("status poisoned"), ProcessStatus::Running) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            // Escalate: abort the worker task, report it as signal-killed.
            let mut current = status.lock().expect("status poisoned");
            if matches!(*current, ProcessStatus::Running) {
                *current = ProcessStatus::Crashed(9);
                let table = self.slaves.lock().expect("slave table poisoned");
                if let Some(entry) = table.get(&process.process_id) {
                    entry.task.abort();
                    let _ = entry.events.send(ChildEvent::Crashed(9));
                }
            }
        }

        self.slaves
            .lock()
            .expect("slave table poisoned")
            .remove(&process.process_id);
        Ok(())
    }

    async fn status(&self, process: &SlaveProcess) -> ProcessStatus {
        match self.entry_status(&process.process_id) {
            Some(status) => *status.lock().expect("status poisoned"),
            None => ProcessStatus::Unknown,
        }
    }
}

/// Canned worker scripts.
pub mod behaviors {
    use super::*;
    use foreman_protocol::{Frame, FrameKind};

    const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(25);

    /// Healthy worker: handshakes, heartbeats, answers every invoke with
    /// one chunk echoing the payload followed by a choke.
    pub fn echo() -> WorkerBehavior {
        serve(Duration::ZERO, usize::MAX)
    }

    /// Echo worker that takes `delay` to produce each response.
    pub fn delayed_echo(delay: Duration) -> WorkerBehavior {
        serve(delay, usize::MAX)
    }

    /// Echo worker that dies mid-stream on its `nth` invoke (1-based): it
    /// sends the first chunk, then drops the connection without a choke.
    pub fn crash_on_invoke(nth: usize) -> WorkerBehavior {
        serve(Duration::ZERO, nth)
    }

    /// Worker that dies the moment it receives an invoke, without sending
    /// a single response frame. Exercises the lost-before-first-frame
    /// re-queue policy.
    pub fn die_on_invoke() -> WorkerBehavior {
        Arc::new(|ctx: WorkerContext| {
            Box::pin(async move {
                let (mut reader, mut writer) = ctx.channel.split();
                let hello = Frame::handshake(&ctx.slave_id.to_string());
                if writer.write_frame(&hello).await.is_err() {
                    return 1;
                }
                let mut beat = tokio::time::interval(HEARTBEAT_INTERVAL);
                beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ctx.stop.notified() => return 0,
                        _ = beat.tick() => {
                            if writer.write_frame(&Frame::heartbeat()).await.is_err() {
                                return 1;
                            }
                        }
                        frame = reader.read_frame() => {
                            match frame {
                                Ok(frame) if frame.kind == FrameKind::Invoke => return 139,
                                Ok(frame) if frame.kind == FrameKind::Terminate => return 0,
                                Ok(_) => {}
                                Err(_) => return 0,
                            }
                        }
                    }
                }
            })
        })
    }

    /// Worker that handshakes and then goes mute: no heartbeats, no
    /// replies. Trips the liveness watchdog.
    pub fn silent() -> WorkerBehavior {
        Arc::new(|ctx: WorkerContext| {
            Box::pin(async move {
                let (mut reader, mut writer) = ctx.channel.split();
                let hello = Frame::handshake(&ctx.slave_id.to_string());
                if writer.write_frame(&hello).await.is_err() {
                    return 1;
                }
                loop {
                    tokio::select! {
                        _ = ctx.stop.notified() => return 0,
                        frame = reader.read_frame() => {
                            if frame.is_err() {
                                return 0;
                            }
                            // Swallow everything, say nothing.
                        }
                    }
                }
            })
        })
    }

    /// Worker that connects but never handshakes. Trips the startup timer.
    pub fn no_handshake() -> WorkerBehavior {
        Arc::new(|ctx: WorkerContext| {
            Box::pin(async move {
                let _channel = ctx.channel;
                ctx.stop.notified().await;
                1
            })
        })
    }

    /// Worker that handshakes with a uuid the engine never issued.
    pub fn wrong_uuid() -> WorkerBehavior {
        Arc::new(|ctx: WorkerContext| {
            Box::pin(async move {
                let mut channel = ctx.channel;
                let hello = Frame::handshake(&Uuid::new_v4().to_string());
                let _ = channel.write_frame(&hello).await;
                ctx.stop.notified().await;
                1
            })
        })
    }

    fn serve(delay: Duration, crash_on: usize) -> WorkerBehavior {
        Arc::new(move |ctx: WorkerContext| {
            Box::pin(async move {
                let (mut reader, mut writer) = ctx.channel.split();
                let hello = Frame::handshake(&ctx.slave_id.to_string());
                if writer.write_frame(&hello).await.is_err() {
                    return 1;
                }

                let mut beat = tokio::time::interval(HEARTBEAT_INTERVAL);
                beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                let mut served = 0usize;

                loop {
                    tokio::select! {
                        _ = ctx.stop.notified() => return 0,
                        _ = beat.tick() => {
                            if writer.write_frame(&Frame::heartbeat()).await.is_err() {
                                return 1;
                            }
                        }
                        frame = reader.read_frame() => {
                            let frame = match frame {
                                Ok(frame) => frame,
                                Err(_) => return 0,
                            };
                            match frame.kind {
                                FrameKind::Invoke => {
                                    served += 1;
                                    if !delay.is_zero() {
                                        tokio::time::sleep(delay).await;
                                    }
                                    let (_, payload) = match frame.decode_invoke() {
                                        Ok(decoded) => decoded,
                                        Err(_) => return 1,
                                    };
                                    let chunk = match Frame::chunk(frame.channel, payload) {
                                        Ok(chunk) => chunk,
                                        Err(_) => return 1,
                                    };
                                    if writer.write_frame(&chunk).await.is_err() {
                                        return 1;
                                    }
                                    if served == crash_on {
                                        // Die without the terminal choke.
                                        return 139;
                                    }
                                    if writer.write_frame(&Frame::choke(frame.channel)).await.is_err() {
                                        return 1;
                                    }
                                }
                                FrameKind::Terminate => return 0,
                                _ => {}
                            }
                        }
                    }
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_protocol::{Frame, FrameKind, Listener, Transport};
    use std::collections::HashMap;

    fn spec(endpoint: &str) -> SpawnSpec {
        SpawnSpec {
            app: "echo-app".to_string(),
            slave_id: Uuid::new_v4(),
            binary: "mock".to_string(),
            args: Vec::new(),
            endpoint: endpoint.to_string(),
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_echo_worker_serves_one_job() {
        let net = InProcNet::new();
        let mut listener = net.bind("engine/echo-app").await.unwrap();
        let isolate = MockIsolate::echo(net);

        let spec = spec("engine/echo-app");
        let process = isolate.spawn(&spec).await.unwrap();

        let mut channel = listener.accept().await.unwrap();
        let hello = channel.read_frame().await.unwrap();
        assert_eq!(hello.decode_handshake().unwrap(), spec.slave_id.to_string());

        channel
            .write_frame(&Frame::invoke(5, "echo", &bytes::Bytes::from_static(b"hi")).unwrap())
            .await
            .unwrap();

        // Heartbeats may interleave with the reply.
        let mut chunk = None;
        let mut choke = false;
        while !choke {
            let frame = channel.read_frame().await.unwrap();
            match frame.kind {
                FrameKind::Chunk => chunk = Some(frame),
                FrameKind::Choke => choke = true,
                FrameKind::Heartbeat => {}
                other => panic!("unexpected frame {other:?}"),
            }
        }
        let chunk = chunk.expect("no chunk before choke");
        assert_eq!(chunk.channel, 5);
        assert_eq!(chunk.payload, bytes::Bytes::from_static(b"hi"));

        isolate
            .terminate(&process, Duration::from_millis(200))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_terminate_reports_exit() {
        let net = InProcNet::new();
        let mut listener = net.bind("engine/stop").await.unwrap();
        let isolate = MockIsolate::echo(net);

        let process = isolate.spawn(&spec("engine/stop")).await.unwrap();
        let _channel = listener.accept().await.unwrap();

        let mut events = process.take_events().unwrap();
        isolate
            .terminate(&process, Duration::from_millis(200))
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event, ChildEvent::Exited(0));
        assert_eq!(isolate.status(&process).await, ProcessStatus::Unknown);
    }

    #[tokio::test]
    async fn test_mute_worker_force_killed() {
        let net = InProcNet::new();
        let mut listener = net.bind("engine/mute").await.unwrap();
        // Ignores the stop notification entirely, so only abort ends it.
        let behavior: WorkerBehavior = Arc::new(|ctx: WorkerContext| {
            Box::pin(async move {
                let _channel = ctx.channel;
                std::future::pending::<()>().await;
                0
            })
        });
        let isolate = MockIsolate::with_behavior(net, behavior);

        let process = isolate.spawn(&spec("engine/mute")).await.unwrap();
        let _channel = listener.accept().await.unwrap();

        let mut events = process.take_events().unwrap();
        isolate
            .terminate(&process, Duration::from_millis(50))
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event, ChildEvent::Crashed(9));
    }

    #[tokio::test]
    async fn test_spawn_without_listener_fails() {
        let net = InProcNet::new();
        let isolate = MockIsolate::echo(net);
        let result = isolate.spawn(&spec("engine/nowhere")).await;
        assert!(matches!(result, Err(IsolateError::SpawnFailed(_))));
    }
}
