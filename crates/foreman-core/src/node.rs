// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The node service: app registry and lifecycle operations.
//!
//! The registry is the only cross-thread shared mutable state in the
//! system; every mutation happens under its lock. `pause_app` removes the
//! app inside the critical section and drains it outside, so a slow stop
//! never blocks the registry.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use foreman_isolate::Isolate;
use foreman_protocol::Transport;

use crate::app::{App, DriverRegistry};
use crate::engine::JobRequest;
use crate::error::{EnqueueError, Error, Result};
use crate::job::JobHandle;
use crate::manifest::{load_manifest, load_profile, load_runlist};
use crate::storage::Storage;

/// The node service. Exposes exactly three lifecycle operations:
/// `start_app`, `pause_app`, `list`.
pub struct NodeService {
    storage: Arc<dyn Storage>,
    isolate: Arc<dyn Isolate>,
    transport: Arc<dyn Transport>,
    drivers: DriverRegistry,
    bind_endpoint: String,
    apps: tokio::sync::Mutex<HashMap<String, Arc<App>>>,
}

impl NodeService {
    pub fn new(
        storage: Arc<dyn Storage>,
        isolate: Arc<dyn Isolate>,
        transport: Arc<dyn Transport>,
        drivers: DriverRegistry,
        bind_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            isolate,
            transport,
            drivers,
            bind_endpoint: bind_endpoint.into(),
            apps: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Load, construct and start an app under the given profile.
    pub async fn start_app(&self, name: &str, profile_name: &str) -> Result<()> {
        let mut apps = self.apps.lock().await;
        if apps.contains_key(name) {
            return Err(Error::AlreadyRunning(name.to_string()));
        }

        info!(app = %name, profile = %profile_name, "starting app");

        let manifest = load_manifest(self.storage.as_ref(), name).await?;
        let profile = load_profile(self.storage.as_ref(), profile_name).await?;
        let app = App::assemble(
            manifest,
            profile,
            self.isolate.clone(),
            self.transport.clone(),
            &self.bind_endpoint,
            &self.drivers,
        )?;
        app.start().await?;

        apps.insert(name.to_string(), Arc::new(app));
        Ok(())
    }

    /// Remove an app from the registry and drain it.
    pub async fn pause_app(&self, name: &str) -> Result<()> {
        let app = {
            let mut apps = self.apps.lock().await;
            apps.remove(name)
                .ok_or_else(|| Error::NotRunning(name.to_string()))?
        };

        info!(app = %name, "stopping app");
        app.stop().await;
        Ok(())
    }

    /// Snapshot of the running app names.
    pub async fn list(&self) -> Vec<String> {
        let apps = self.apps.lock().await;
        let mut names: Vec<String> = apps.keys().cloned().collect();
        names.sort();
        names
    }

    /// Submit a job to a running app.
    pub async fn enqueue(
        &self,
        app_name: &str,
        request: JobRequest,
    ) -> std::result::Result<JobHandle, EnqueueError> {
        let app = {
            let apps = self.apps.lock().await;
            apps.get(app_name).cloned()
        };
        match app {
            Some(app) => app.enqueue(request).await,
            None => Err(EnqueueError::AppNotRunning),
        }
    }

    /// Info document for one running app.
    pub async fn app_info(&self, app_name: &str) -> Result<serde_json::Value> {
        let apps = self.apps.lock().await;
        apps.get(app_name)
            .map(|app| app.info())
            .ok_or_else(|| Error::NotRunning(app_name.to_string()))
    }

    /// Runlist reconciliation at boot: start every listed app, logging
    /// and skipping per-app failures. A partially started node is a valid
    /// state; there is no rollback.
    pub async fn run_runlist(&self, runlist: &str) {
        info!(runlist = %runlist, "reading runlist");

        let entries = match load_runlist(self.storage.as_ref(), runlist).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(runlist = %runlist, error = %e, "unable to read runlist");
                return;
            }
        };

        if entries.is_empty() {
            return;
        }

        info!(count = entries.len(), "starting apps from runlist");
        for (app_name, profile_name) in entries {
            if let Err(e) = self.start_app(&app_name, &profile_name).await {
                error!(app = %app_name, error = %e, "unable to initialize app");
            }
        }
    }

    /// Drain every app. Used at node shutdown.
    pub async fn stop_all(&self) {
        let drained: Vec<(String, Arc<App>)> = {
            let mut apps = self.apps.lock().await;
            apps.drain().collect()
        };

        if drained.is_empty() {
            return;
        }

        info!(count = drained.len(), "stopping apps");
        for (name, app) in drained {
            info!(app = %name, "stopping app");
            app.stop().await;
        }
    }
}

impl std::fmt::Debug for NodeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeService")
            .field("bind_endpoint", &self.bind_endpoint)
            .finish_non_exhaustive()
    }
}
