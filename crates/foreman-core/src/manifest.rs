// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! App manifests and engine profiles.
//!
//! Both are immutable JSON documents loaded from storage at app start:
//! the manifest names the code and its drivers, the profile carries the
//! engine policy knobs. Validation happens here, at load time, so an app
//! with a nonsense profile never reaches the engine.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::config::defaults;
use crate::error::{Error, Result};
use crate::storage::{COLLECTION_MANIFESTS, COLLECTION_PROFILES, COLLECTION_RUNLISTS, Storage};

/// Immutable per-app record: code location, app type, driver table.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub name: String,
    /// Where the isolate finds the deployed code.
    pub path: String,
    /// App type tag, used to pick the worker runtime.
    pub app_type: String,
    /// Driver table: driver name to its configuration.
    pub drivers: BTreeMap<String, DriverConfig>,
}

/// One driver entry from the manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Driver type tag, resolved through the driver registry.
    #[serde(rename = "type")]
    pub driver_type: String,
    /// Remaining fields, passed to the driver factory untouched.
    #[serde(flatten)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ManifestDoc {
    #[serde(default)]
    path: String,
    #[serde(rename = "type", default)]
    app_type: String,
    #[serde(default)]
    drivers: BTreeMap<String, DriverConfig>,
}

/// Immutable engine policy snapshot.
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    /// Max duration a spawned slave has to complete its handshake.
    pub startup_timeout: Duration,
    /// Max interval between liveness signals before a slave is killed.
    pub heartbeat_timeout: Duration,
    /// Idle duration after which a slave is pruned.
    pub idle_timeout: Duration,
    /// Grace period before a terminating slave is force-killed.
    pub termination_timeout: Duration,
    /// Hard cap on concurrent slaves.
    pub pool_limit: usize,
    /// Hard cap on pending jobs. 0 means unbounded.
    pub queue_limit: usize,
    /// Queue depth per live slave that triggers one more spawn.
    pub grow_threshold: usize,
    /// Worker binary to spawn.
    pub slave: String,
}

fn d_startup() -> f64 {
    defaults::STARTUP_TIMEOUT
}
fn d_heartbeat() -> f64 {
    defaults::HEARTBEAT_TIMEOUT
}
fn d_idle() -> f64 {
    defaults::IDLE_TIMEOUT
}
fn d_termination() -> f64 {
    defaults::TERMINATION_TIMEOUT
}
fn d_pool() -> usize {
    defaults::POOL_LIMIT
}
fn d_queue() -> usize {
    defaults::QUEUE_LIMIT
}
fn d_slave() -> String {
    defaults::SLAVE.to_string()
}

#[derive(Debug, Deserialize)]
struct ProfileDoc {
    #[serde(rename = "startup-timeout", default = "d_startup")]
    startup_timeout: f64,
    #[serde(rename = "heartbeat-timeout", default = "d_heartbeat")]
    heartbeat_timeout: f64,
    #[serde(rename = "idle-timeout", default = "d_idle")]
    idle_timeout: f64,
    #[serde(rename = "termination-timeout", default = "d_termination")]
    termination_timeout: f64,
    #[serde(rename = "pool-limit", default = "d_pool")]
    pool_limit: usize,
    #[serde(rename = "queue-limit", default = "d_queue")]
    queue_limit: usize,
    #[serde(rename = "grow-threshold")]
    grow_threshold: Option<usize>,
    #[serde(default = "d_slave")]
    slave: String,
}

impl Profile {
    fn from_doc(name: &str, doc: ProfileDoc) -> Result<Self> {
        if doc.startup_timeout <= 0.0 {
            return Err(Error::Configuration(
                "slave startup timeout must be positive".into(),
            ));
        }
        if doc.heartbeat_timeout <= 0.0 {
            return Err(Error::Configuration(
                "slave heartbeat timeout must be positive".into(),
            ));
        }
        if doc.idle_timeout <= 0.0 {
            return Err(Error::Configuration(
                "slave idle timeout must be positive".into(),
            ));
        }
        if doc.termination_timeout <= 0.0 {
            return Err(Error::Configuration(
                "slave termination timeout must be positive".into(),
            ));
        }
        if doc.pool_limit == 0 {
            return Err(Error::Configuration(
                "engine pool limit must be positive".into(),
            ));
        }

        let grow_threshold = match doc.grow_threshold {
            Some(0) => {
                return Err(Error::Configuration(
                    "engine grow threshold must be positive".into(),
                ));
            }
            Some(threshold) => threshold,
            // queue-limit 0 (unbounded) would compute to 0; clamp so the
            // pool still grows under load.
            None => (doc.queue_limit / doc.pool_limit).max(1),
        };

        Ok(Self {
            name: name.to_string(),
            startup_timeout: Duration::from_secs_f64(doc.startup_timeout),
            heartbeat_timeout: Duration::from_secs_f64(doc.heartbeat_timeout),
            idle_timeout: Duration::from_secs_f64(doc.idle_timeout),
            termination_timeout: Duration::from_secs_f64(doc.termination_timeout),
            pool_limit: doc.pool_limit,
            queue_limit: doc.queue_limit,
            grow_threshold,
            slave: doc.slave,
        })
    }
}

/// Load and validate an app manifest from storage.
pub async fn load_manifest(storage: &dyn Storage, name: &str) -> Result<Manifest> {
    let blob = storage.get(COLLECTION_MANIFESTS, name).await?;
    let doc: ManifestDoc = serde_json::from_slice(&blob)
        .map_err(|e| Error::Configuration(format!("manifest '{name}': {e}")))?;

    if doc.path.is_empty() {
        return Err(Error::Configuration(format!(
            "manifest '{name}': missing code path"
        )));
    }

    Ok(Manifest {
        name: name.to_string(),
        path: doc.path,
        app_type: doc.app_type,
        drivers: doc.drivers,
    })
}

/// Load and validate an engine profile from storage.
pub async fn load_profile(storage: &dyn Storage, name: &str) -> Result<Profile> {
    let blob = storage.get(COLLECTION_PROFILES, name).await?;
    let doc: ProfileDoc = serde_json::from_slice(&blob)
        .map_err(|e| Error::Configuration(format!("profile '{name}': {e}")))?;
    Profile::from_doc(name, doc)
}

/// Load a runlist: the app-to-profile map applied at node boot.
pub async fn load_runlist(
    storage: &dyn Storage,
    runlist: &str,
) -> Result<BTreeMap<String, String>> {
    let blob = storage.get(COLLECTION_RUNLISTS, runlist).await?;
    serde_json::from_slice(&blob)
        .map_err(|e| Error::Configuration(format!("runlist '{runlist}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_profile_defaults_applied() {
        let storage = MemoryStorage::new();
        storage.put_json("profiles", "bare", &serde_json::json!({}));

        let profile = load_profile(&storage, "bare").await.unwrap();
        assert_eq!(profile.pool_limit, defaults::POOL_LIMIT);
        assert_eq!(profile.queue_limit, defaults::QUEUE_LIMIT);
        assert_eq!(
            profile.grow_threshold,
            defaults::QUEUE_LIMIT / defaults::POOL_LIMIT
        );
        assert_eq!(profile.slave, defaults::SLAVE);
        assert_eq!(
            profile.startup_timeout,
            Duration::from_secs_f64(defaults::STARTUP_TIMEOUT)
        );
    }

    #[tokio::test]
    async fn test_profile_rejects_nonpositive_timeout() {
        let storage = MemoryStorage::new();
        storage.put_json(
            "profiles",
            "broken",
            &serde_json::json!({"heartbeat-timeout": 0.0}),
        );

        let err = load_profile(&storage, "broken").await.unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION");
        assert!(err.to_string().contains("heartbeat"));
    }

    #[tokio::test]
    async fn test_profile_rejects_zero_pool() {
        let storage = MemoryStorage::new();
        storage.put_json("profiles", "broken", &serde_json::json!({"pool-limit": 0}));

        let err = load_profile(&storage, "broken").await.unwrap_err();
        assert!(err.to_string().contains("pool limit"));
    }

    #[tokio::test]
    async fn test_profile_rejects_explicit_zero_grow_threshold() {
        let storage = MemoryStorage::new();
        storage.put_json(
            "profiles",
            "broken",
            &serde_json::json!({"grow-threshold": 0}),
        );

        let err = load_profile(&storage, "broken").await.unwrap_err();
        assert!(err.to_string().contains("grow threshold"));
    }

    #[tokio::test]
    async fn test_unbounded_queue_clamps_grow_threshold() {
        let storage = MemoryStorage::new();
        storage.put_json("profiles", "wide", &serde_json::json!({"queue-limit": 0}));

        let profile = load_profile(&storage, "wide").await.unwrap();
        assert_eq!(profile.queue_limit, 0);
        assert_eq!(profile.grow_threshold, 1);
    }

    #[tokio::test]
    async fn test_manifest_requires_path() {
        let storage = MemoryStorage::new();
        storage.put_json("manifests", "echo", &serde_json::json!({"type": "binary"}));

        let err = load_manifest(&storage, "echo").await.unwrap_err();
        assert!(err.to_string().contains("code path"));
    }

    #[tokio::test]
    async fn test_manifest_with_drivers() {
        let storage = MemoryStorage::new();
        storage.put_json(
            "manifests",
            "echo",
            &serde_json::json!({
                "path": "/spool/echo",
                "type": "binary",
                "drivers": {
                    "pump": {"type": "recurring", "interval": 5.0}
                }
            }),
        );

        let manifest = load_manifest(&storage, "echo").await.unwrap();
        assert_eq!(manifest.path, "/spool/echo");
        let pump = &manifest.drivers["pump"];
        assert_eq!(pump.driver_type, "recurring");
        assert_eq!(pump.args["interval"], 5.0);
    }

    #[tokio::test]
    async fn test_missing_manifest_is_not_found() {
        let storage = MemoryStorage::new();
        let err = load_manifest(&storage, "ghost").await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_runlist_round_trip() {
        let storage = MemoryStorage::new();
        storage.put_json(
            "runlists",
            "default",
            &serde_json::json!({"echo": "small", "resize": "large"}),
        );

        let runlist = load_runlist(&storage, "default").await.unwrap();
        assert_eq!(runlist.len(), 2);
        assert_eq!(runlist["echo"], "small");
        assert_eq!(runlist["resize"], "large");
    }
}
