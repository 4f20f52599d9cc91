// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Foreman node daemon.
//!
//! Brings up the node service with the process isolate and TCP slave
//! transport, reconciles the configured runlist, then serves until
//! interrupted. Storage is the in-memory backend seeded from
//! `FOREMAN_SEED` (a JSON file of collections), which suits development
//! and single-node deployments; production deployments embed the runtime
//! with their own storage backend.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use foreman_core::config::Config;
use foreman_core::runtime::Runtime;
use foreman_core::storage::{MemoryStorage, Storage};
use foreman_isolate::ProcessIsolate;
use foreman_protocol::TcpTransport;

/// Seed the memory storage from a JSON document of the shape
/// `{ "<collection>": { "<key>": <document> } }`.
async fn seed_storage(storage: &MemoryStorage, path: &str) -> Result<()> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("cannot read seed file '{path}'"))?;
    let doc: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(&raw).with_context(|| format!("malformed seed file '{path}'"))?;

    let mut count = 0usize;
    for (collection, entries) in &doc {
        let entries = entries
            .as_object()
            .with_context(|| format!("seed collection '{collection}' is not an object"))?;
        for (key, document) in entries {
            let blob = serde_json::to_vec(document)?;
            storage
                .put(collection, key, blob.into())
                .await
                .with_context(|| format!("cannot seed '{collection}/{key}'"))?;
            count += 1;
        }
    }
    info!(path = %path, objects = count, "storage seeded");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "foreman=info,foreman_core=info".into()),
        )
        .init();

    info!("Starting Foreman node");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        anyhow::anyhow!(e)
    })?;

    info!(
        runlist = %config.runlist,
        endpoint = %config.endpoint,
        "Configuration loaded"
    );

    let storage = Arc::new(MemoryStorage::new());
    if let Ok(seed_path) = std::env::var("FOREMAN_SEED") {
        seed_storage(&storage, &seed_path).await?;
    }

    let runtime = Runtime::builder()
        .storage(storage)
        .isolate(Arc::new(ProcessIsolate::new()))
        .transport(Arc::new(TcpTransport))
        .config(config)
        .build()?
        .start()
        .await;

    info!(
        apps = runtime.node().list().await.len(),
        "Foreman node initialized"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}
