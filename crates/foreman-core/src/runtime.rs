// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for foreman-core.
//!
//! This module provides [`Runtime`], the single value that wires the
//! node's collaborators together. Process-wide state lives here and
//! nowhere else; workers never inherit any of it, they are spawned fresh
//! by the isolate.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use foreman_core::runtime::Runtime;
//! use foreman_core::storage::MemoryStorage;
//! use foreman_isolate::ProcessIsolate;
//! use foreman_protocol::TcpTransport;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Runtime::builder()
//!         .storage(Arc::new(MemoryStorage::new()))
//!         .isolate(Arc::new(ProcessIsolate::new()))
//!         .transport(Arc::new(TcpTransport))
//!         .runlist("default")
//!         .build()?
//!         .start()
//!         .await;
//!
//!     // ... serve ...
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use foreman_isolate::Isolate;
use foreman_protocol::Transport;

use crate::app::DriverRegistry;
use crate::config::Config;
use crate::node::NodeService;
use crate::storage::Storage;

/// Builder for creating a [`Runtime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    storage: Option<Arc<dyn Storage>>,
    isolate: Option<Arc<dyn Isolate>>,
    transport: Option<Arc<dyn Transport>>,
    drivers: DriverRegistry,
    config: Option<Config>,
}

impl std::fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("storage", &self.storage.as_ref().map(|_| "..."))
            .field("isolate", &self.isolate.as_ref().map(|_| "..."))
            .field("transport", &self.transport.as_ref().map(|_| "..."))
            .field("config", &self.config)
            .finish()
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage backend (required).
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the isolate backend (required).
    pub fn isolate(mut self, isolate: Arc<dyn Isolate>) -> Self {
        self.isolate = Some(isolate);
        self
    }

    /// Set the slave transport (required).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Register the driver factories apps may reference.
    pub fn drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    /// Override the runlist read at boot.
    pub fn runlist(mut self, runlist: impl Into<String>) -> Self {
        let mut config = self.config.take().unwrap_or_default();
        config.runlist = runlist.into();
        self.config = Some(config);
        self
    }

    /// Provide a full node configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required collaborators are missing.
    pub fn build(self) -> Result<RuntimeConfig> {
        let storage = self
            .storage
            .ok_or_else(|| anyhow::anyhow!("storage is required"))?;
        let isolate = self
            .isolate
            .ok_or_else(|| anyhow::anyhow!("isolate is required"))?;
        let transport = self
            .transport
            .ok_or_else(|| anyhow::anyhow!("transport is required"))?;

        Ok(RuntimeConfig {
            storage,
            isolate,
            transport,
            drivers: self.drivers,
            config: self.config.unwrap_or_default(),
        })
    }
}

/// Configuration for a [`Runtime`].
pub struct RuntimeConfig {
    storage: Arc<dyn Storage>,
    isolate: Arc<dyn Isolate>,
    transport: Arc<dyn Transport>,
    drivers: DriverRegistry,
    config: Config,
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RuntimeConfig {
    /// Start the node and reconcile the runlist.
    pub async fn start(self) -> Runtime {
        let node = Arc::new(NodeService::new(
            self.storage,
            self.isolate,
            self.transport,
            self.drivers,
            self.config.endpoint.clone(),
        ));

        node.run_runlist(&self.config.runlist).await;
        info!(runlist = %self.config.runlist, "runtime started");

        Runtime { node }
    }
}

/// A running node that can be embedded in an application.
pub struct Runtime {
    node: Arc<NodeService>,
}

impl Runtime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// The node service handle.
    pub fn node(&self) -> &Arc<NodeService> {
        &self.node
    }

    /// Gracefully drain every app and stop.
    pub async fn shutdown(self) {
        info!("runtime shutting down");
        self.node.stop_all().await;
        info!("runtime shutdown complete");
    }
}
