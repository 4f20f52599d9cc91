// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Apps: one engine plus its driver set.
//!
//! Drivers are event sources declared in the manifest (timers, file
//! watchers, inbound listeners) that feed jobs into the engine. The app
//! resolves each entry through a pluggable factory registry, starts the
//! engine before the drivers, and stops the drivers before the engine so
//! their outstanding callbacks can still find it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use foreman_isolate::Isolate;
use foreman_protocol::Transport;

use crate::engine::{Engine, JobRequest};
use crate::error::{EnqueueError, Error, Result};
use crate::job::JobHandle;
use crate::manifest::{Manifest, Profile};

/// One driver attached to an app.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver type tag, as named in the manifest.
    fn driver_type(&self) -> &'static str;

    /// Begin producing events. Called after the engine is running.
    async fn start(&self) -> Result<()>;

    /// Stop producing events. Called before the engine stops.
    async fn stop(&self);

    /// Driver-specific counters for `info()`.
    fn info(&self) -> serde_json::Value {
        serde_json::json!({ "type": self.driver_type() })
    }
}

/// Builds a driver from its manifest entry and the engine it feeds.
pub type DriverFactory = Arc<
    dyn Fn(&str, &serde_json::Map<String, serde_json::Value>, Engine) -> Result<Box<dyn Driver>>
        + Send
        + Sync,
>;

/// Maps driver type tags to factories.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver_type: impl Into<String>, factory: DriverFactory) {
        self.factories.insert(driver_type.into(), factory);
    }

    fn construct(
        &self,
        driver_type: &str,
        name: &str,
        args: &serde_json::Map<String, serde_json::Value>,
        engine: Engine,
    ) -> Result<Box<dyn Driver>> {
        let factory = self.factories.get(driver_type).ok_or_else(|| {
            Error::Configuration(format!("unknown driver type '{driver_type}' for '{name}'"))
        })?;
        factory(name, args, engine)
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A named user program under management: engine + drivers.
pub struct App {
    name: String,
    engine: Engine,
    drivers: Vec<(String, Box<dyn Driver>)>,
}

impl App {
    /// Assemble an app from its loaded manifest and profile. Fails on
    /// unknown driver types; nothing is started yet.
    pub fn assemble(
        manifest: Manifest,
        profile: Profile,
        isolate: Arc<dyn Isolate>,
        transport: Arc<dyn Transport>,
        bind_endpoint: &str,
        registry: &DriverRegistry,
    ) -> Result<Self> {
        let name = manifest.name.clone();
        let driver_table = manifest.drivers.clone();
        let engine = Engine::new(manifest, profile, isolate, transport, bind_endpoint);

        let mut drivers = Vec::with_capacity(driver_table.len());
        for (driver_name, config) in &driver_table {
            let driver = registry.construct(
                &config.driver_type,
                driver_name,
                &config.args,
                engine.clone(),
            )?;
            drivers.push((driver_name.clone(), driver));
        }

        if !drivers.is_empty() {
            let names: Vec<&str> = drivers.iter().map(|(n, _)| n.as_str()).collect();
            info!(app = %name, count = drivers.len(), drivers = ?names, "initialized drivers");
        }

        Ok(Self {
            name,
            engine,
            drivers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Start the engine, then the drivers. A driver that fails to start
    /// rolls the whole app back down.
    pub async fn start(&self) -> Result<()> {
        self.engine.start().await?;
        for (index, (driver_name, driver)) in self.drivers.iter().enumerate() {
            if let Err(e) = driver.start().await {
                for (_, started) in self.drivers.iter().take(index) {
                    started.stop().await;
                }
                self.engine.stop().await;
                return Err(Error::Configuration(format!(
                    "driver '{driver_name}' failed to start: {e}"
                )));
            }
        }
        Ok(())
    }

    /// Stop drivers first, then drain the engine.
    pub async fn stop(&self) {
        for (_, driver) in &self.drivers {
            driver.stop().await;
        }
        self.engine.stop().await;
    }

    /// Submit a job to this app's engine.
    pub async fn enqueue(&self, request: JobRequest) -> std::result::Result<JobHandle, EnqueueError> {
        self.engine.enqueue(request).await
    }

    /// Engine info merged with per-driver info.
    pub fn info(&self) -> serde_json::Value {
        let mut info = serde_json::to_value(self.engine.info())
            .unwrap_or_else(|_| serde_json::json!({}));
        if !self.drivers.is_empty() {
            let drivers: serde_json::Map<String, serde_json::Value> = self
                .drivers
                .iter()
                .map(|(driver_name, driver)| (driver_name.clone(), driver.info()))
                .collect();
            info["drivers"] = serde_json::Value::Object(drivers);
        }
        info
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("drivers", &self.drivers.len())
            .finish_non_exhaustive()
    }
}
