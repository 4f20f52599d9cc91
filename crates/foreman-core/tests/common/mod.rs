// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for foreman-core integration tests.
//!
//! Everything runs in-process: `InProcNet` for the wire, `MockIsolate`
//! for workers, `MemoryStorage` for documents.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use foreman_core::app::DriverRegistry;
use foreman_core::engine::Engine;
use foreman_core::manifest::{Manifest, Profile};
use foreman_core::node::NodeService;
use foreman_core::storage::MemoryStorage;
use foreman_isolate::{MockIsolate, WorkerBehavior};
use foreman_protocol::InProcNet;

/// A profile tuned for tests: short timers, explicit limits.
pub fn test_profile(pool_limit: usize, queue_limit: usize) -> Profile {
    Profile {
        name: "test".to_string(),
        startup_timeout: Duration::from_secs(2),
        heartbeat_timeout: Duration::from_secs(2),
        idle_timeout: Duration::from_secs(60),
        termination_timeout: Duration::from_millis(300),
        pool_limit,
        queue_limit,
        grow_threshold: if pool_limit > 0 && queue_limit > 0 {
            (queue_limit / pool_limit).max(1)
        } else {
            1
        },
        slave: "mock".to_string(),
    }
}

pub fn test_manifest(name: &str) -> Manifest {
    Manifest {
        name: name.to_string(),
        path: format!("/spool/{name}"),
        app_type: "binary".to_string(),
        drivers: BTreeMap::new(),
    }
}

/// An engine wired to a mock isolate, started and ready.
pub struct EngineHarness {
    pub engine: Engine,
    pub isolate: Arc<MockIsolate>,
    pub net: InProcNet,
}

impl EngineHarness {
    pub async fn start(name: &str, profile: Profile, behavior: WorkerBehavior) -> Self {
        let net = InProcNet::new();
        let isolate = Arc::new(MockIsolate::with_behavior(net.clone(), behavior));
        let engine = Engine::new(
            test_manifest(name),
            profile,
            isolate.clone(),
            Arc::new(net.clone()),
            "",
        );
        engine.start().await.expect("engine start");
        Self {
            engine,
            isolate,
            net,
        }
    }
}

/// A node service over memory storage and a mock isolate.
pub struct NodeHarness {
    pub node: NodeService,
    pub storage: Arc<MemoryStorage>,
    pub isolate: Arc<MockIsolate>,
    pub net: InProcNet,
}

impl NodeHarness {
    pub fn new(behavior: WorkerBehavior) -> Self {
        Self::with_drivers(behavior, DriverRegistry::new())
    }

    pub fn with_drivers(behavior: WorkerBehavior, drivers: DriverRegistry) -> Self {
        let net = InProcNet::new();
        let storage = Arc::new(MemoryStorage::new());
        let isolate = Arc::new(MockIsolate::with_behavior(net.clone(), behavior));
        let node = NodeService::new(
            storage.clone(),
            isolate.clone(),
            Arc::new(net.clone()),
            drivers,
            "",
        );
        Self {
            node,
            storage,
            isolate,
            net,
        }
    }

    /// Seed a manifest for `name` and a profile document under `profile`.
    pub fn seed_app(&self, name: &str, profile: &str, profile_doc: serde_json::Value) {
        self.storage.put_json(
            "manifests",
            name,
            &serde_json::json!({ "path": format!("/spool/{name}"), "type": "binary" }),
        );
        self.storage.put_json("profiles", profile, &profile_doc);
    }

    /// A small, fast profile document.
    pub fn small_profile() -> serde_json::Value {
        serde_json::json!({
            "startup-timeout": 2.0,
            "heartbeat-timeout": 2.0,
            "idle-timeout": 60.0,
            "termination-timeout": 0.3,
            "pool-limit": 1,
            "queue-limit": 8,
        })
    }
}
