// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generic worker binary: answers every invocation by echoing its payload.
//!
//! Profiles that name no worker binary get this one. It reads its identity
//! from the environment the process isolate sets and dials the engine over
//! TCP.

use async_trait::async_trait;
use bytes::Bytes;

use foreman_protocol::TcpTransport;
use foreman_worker::{Handler, ResponseSink, Worker, WorkerConfig, WorkerError};

struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn invoke(
        &mut self,
        _method: &str,
        payload: Bytes,
        sink: &mut ResponseSink,
    ) -> Result<(), WorkerError> {
        sink.chunk(payload)?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = WorkerConfig::from_env()?;
    Worker::new(config, Echo).run(&TcpTransport).await?;
    Ok(())
}
