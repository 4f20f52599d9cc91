// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-backed isolate.
//!
//! Spawns worker binaries with `tokio::process`, reports their exit through
//! the child event stream, and implements terminate as SIGTERM, a grace
//! period, then SIGKILL with a /proc liveness check.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::traits::{
    ChildEvent, Isolate, IsolateError, ProcessStatus, Result, SlaveProcess, SpawnSpec,
};

const KILL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Isolate backend that runs each slave as a real child process.
///
/// The worker binary receives its identity and the engine endpoint through
/// `FOREMAN_APP`, `FOREMAN_SLAVE_UUID` and `FOREMAN_ENDPOINT`; it is
/// expected to dial back and handshake on its own.
#[derive(Default)]
pub struct ProcessIsolate {
    children: Arc<Mutex<HashMap<String, Arc<Mutex<ProcessStatus>>>>>,
}

impl ProcessIsolate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, process_id: &str) -> Option<Arc<Mutex<ProcessStatus>>> {
        self.children
            .lock()
            .expect("child table poisoned")
            .get(process_id)
            .cloned()
    }

    /// Send SIGKILL to a PID and confirm the process is gone via /proc.
    async fn kill_and_confirm(pid: u32) -> bool {
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => debug!(pid, "sent SIGKILL to slave process"),
            Err(nix::errno::Errno::ESRCH) => return true,
            Err(e) => warn!(pid, error = %e, "failed to SIGKILL slave process"),
        }

        tokio::time::sleep(Duration::from_millis(100)).await;

        let alive = std::path::Path::new(&format!("/proc/{pid}")).exists();
        if alive {
            warn!(pid, "slave process still alive after SIGKILL");
        }
        !alive
    }
}

#[async_trait]
impl Isolate for ProcessIsolate {
    fn isolate_type(&self) -> &'static str {
        "process"
    }

    async fn spawn(&self, spec: &SpawnSpec) -> Result<SlaveProcess> {
        let mut cmd = Command::new(&spec.binary);
        cmd.args(&spec.args)
            .env("FOREMAN_APP", &spec.app)
            .env("FOREMAN_SLAVE_UUID", spec.slave_id.to_string())
            .env("FOREMAN_ENDPOINT", &spec.endpoint)
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                IsolateError::BinaryNotFound(spec.binary.clone())
            } else {
                IsolateError::SpawnFailed(e.to_string())
            }
        })?;

        let pid = child.id();
        let process_id = spec.slave_id.to_string();
        let status = Arc::new(Mutex::new(ProcessStatus::Running));
        self.children
            .lock()
            .expect("child table poisoned")
            .insert(process_id.clone(), status.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let event = match child.wait().await {
                Ok(exit) => {
                    use std::os::unix::process::ExitStatusExt;
                    match exit.code() {
                        Some(code) => ChildEvent::Exited(code),
                        None => ChildEvent::Crashed(exit.signal().unwrap_or(9)),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to await slave process");
                    ChildEvent::Crashed(9)
                }
            };
            *status.lock().expect("status poisoned") = match event {
                ChildEvent::Exited(code) => ProcessStatus::Exited(code),
                ChildEvent::Crashed(sig) => ProcessStatus::Crashed(sig),
            };
            let _ = events_tx.send(event);
        });

        debug!(binary = %spec.binary, slave_id = %spec.slave_id, pid, "spawned slave process");

        Ok(SlaveProcess::new(process_id, spec.slave_id, pid, events_rx))
    }

    async fn terminate(&self, process: &SlaveProcess, grace: Duration) -> Result<()> {
        let status = self
            .lookup(&process.process_id)
            .ok_or_else(|| IsolateError::UnknownProcess(process.process_id.clone()))?;

        let reap = || {
            self.children
                .lock()
                .expect("child table poisoned")
                .remove(&process.process_id);
        };

        if !matches!(*status.lock().expect("status poisoned"), ProcessStatus::Running) {
            reap();
            return Ok(());
        }

        let Some(pid) = process.spawned_pid else {
            reap();
            return Err(IsolateError::UnknownProcess(process.process_id.clone()));
        };

        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!(pid, error = %e, "failed to SIGTERM slave process"),
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !matches!(*status.lock().expect("status poisoned"), ProcessStatus::Running) {
                reap();
                return Ok(());
            }
            tokio::time::sleep(KILL_POLL_INTERVAL).await;
        }

        Self::kill_and_confirm(pid).await;
        reap();
        Ok(())
    }

    async fn status(&self, process: &SlaveProcess) -> ProcessStatus {
        match self.lookup(&process.process_id) {
            Some(status) => *status.lock().expect("status poisoned"),
            None => ProcessStatus::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn spec(binary: &str, args: &[&str]) -> SpawnSpec {
        SpawnSpec {
            app: "test-app".to_string(),
            slave_id: Uuid::new_v4(),
            binary: binary.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            endpoint: "127.0.0.1:0".to_string(),
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let isolate = ProcessIsolate::new();
        let process = isolate.spawn(&spec("/bin/sh", &["-c", "exit 7"])).await.unwrap();

        let mut events = process.take_events().unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event, ChildEvent::Exited(7));
        assert_eq!(isolate.status(&process).await, ProcessStatus::Exited(7));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let isolate = ProcessIsolate::new();
        let result = isolate.spawn(&spec("/no/such/binary", &[])).await;
        assert!(matches!(result, Err(IsolateError::BinaryNotFound(_))));
    }

    #[tokio::test]
    async fn test_terminate_stubborn_child() {
        let isolate = ProcessIsolate::new();
        // Traps TERM so only the SIGKILL escalation can end it.
        let process = isolate
            .spawn(&spec("/bin/sh", &["-c", "trap '' TERM; sleep 30"]))
            .await
            .unwrap();

        isolate
            .terminate(&process, Duration::from_millis(200))
            .await
            .unwrap();

        let mut events = process.take_events().unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(event, ChildEvent::Crashed(_)));
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_ok() {
        let isolate = ProcessIsolate::new();
        let process = isolate.spawn(&spec("/bin/true", &[])).await.unwrap();

        let mut events = process.take_events().unwrap();
        events.recv().await.unwrap();

        isolate
            .terminate(&process, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(isolate.status(&process).await, ProcessStatus::Unknown);
    }
}
