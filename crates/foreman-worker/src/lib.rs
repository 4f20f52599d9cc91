// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Foreman Worker - the slave side of the engine/slave protocol.
//!
//! A worker dials the engine endpoint it was spawned with, presents its
//! uuid in a handshake, keeps a background heartbeat running, and serves
//! invocations one at a time through a [`Handler`]:
//!
//! ```ignore
//! use foreman_worker::{Handler, ResponseSink, Worker, WorkerConfig, WorkerError};
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Handler for Echo {
//!     async fn invoke(
//!         &mut self,
//!         _method: &str,
//!         payload: bytes::Bytes,
//!         sink: &mut ResponseSink,
//!     ) -> Result<(), WorkerError> {
//!         sink.chunk(payload)?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), WorkerError> {
//!     let config = WorkerConfig::from_env()?;
//!     Worker::new(config, Echo)
//!         .run(&foreman_protocol::TcpTransport)
//!         .await
//! }
//! ```
//!
//! The serve loop handles one invocation at a time; the heartbeat task
//! keeps liveness flowing even while a handler is busy.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use foreman_protocol::{Frame, FrameChannel, FrameError, FrameKind, Transport};

/// Default interval between worker heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Errors from the worker side of the protocol.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// A required environment variable is missing or malformed.
    #[error("invalid worker environment: {0}")]
    Config(&'static str),

    /// Frame encoding/decoding failed.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Dialing the engine endpoint failed.
    #[error("connect error: {0}")]
    Connect(#[from] std::io::Error),

    /// The engine side went away mid-conversation.
    #[error("channel closed")]
    ChannelClosed,

    /// Handler-reported failure; forwarded to the engine as an error frame.
    #[error("{0}")]
    Handler(String),
}

/// Identity and rendezvous info for one worker, as handed down by the
/// isolate at spawn time.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// App this worker serves.
    pub app: String,
    /// Uuid the engine expects in the handshake.
    pub uuid: Uuid,
    /// Engine endpoint to dial.
    pub endpoint: String,
}

impl WorkerConfig {
    /// Load the identity from `FOREMAN_APP`, `FOREMAN_SLAVE_UUID` and
    /// `FOREMAN_ENDPOINT`, the variables the process isolate sets.
    pub fn from_env() -> Result<Self, WorkerError> {
        let app = std::env::var("FOREMAN_APP").map_err(|_| WorkerError::Config("FOREMAN_APP"))?;
        let uuid = std::env::var("FOREMAN_SLAVE_UUID")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .ok_or(WorkerError::Config("FOREMAN_SLAVE_UUID"))?;
        let endpoint = std::env::var("FOREMAN_ENDPOINT")
            .map_err(|_| WorkerError::Config("FOREMAN_ENDPOINT"))?;
        Ok(Self {
            app,
            uuid,
            endpoint,
        })
    }
}

/// Response path for one invocation. Chunks stream immediately; the
/// terminal choke is appended automatically when the handler returns Ok
/// without having reported an error.
pub struct ResponseSink {
    out: mpsc::UnboundedSender<Frame>,
    session: u64,
    closed: bool,
}

impl ResponseSink {
    /// Stream one response chunk.
    pub fn chunk(&mut self, payload: Bytes) -> Result<(), WorkerError> {
        if self.closed {
            return Ok(());
        }
        let frame = Frame::chunk(self.session, payload)?;
        self.out
            .send(frame)
            .map_err(|_| WorkerError::ChannelClosed)
    }

    /// Report a terminal error for this invocation.
    pub fn error(&mut self, code: u32, message: &str) -> Result<(), WorkerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let frame = Frame::error(self.session, code, message)?;
        self.out
            .send(frame)
            .map_err(|_| WorkerError::ChannelClosed)
    }

    fn choke(&mut self) -> Result<(), WorkerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.out
            .send(Frame::choke(self.session))
            .map_err(|_| WorkerError::ChannelClosed)
    }
}

/// Application logic for one worker: called once per invocation, in order.
#[async_trait]
pub trait Handler: Send {
    async fn invoke(
        &mut self,
        method: &str,
        payload: Bytes,
        sink: &mut ResponseSink,
    ) -> Result<(), WorkerError>;
}

/// The worker runtime: handshake, heartbeats, serve loop.
pub struct Worker<H> {
    config: WorkerConfig,
    handler: H,
    heartbeat_interval: Duration,
}

impl<H: Handler> Worker<H> {
    pub fn new(config: WorkerConfig, handler: H) -> Self {
        Self {
            config,
            handler,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Override the heartbeat interval. Must stay well below the engine's
    /// heartbeat timeout for this app's profile.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Dial the configured endpoint and serve until terminated.
    pub async fn run(self, transport: &dyn Transport) -> Result<(), WorkerError> {
        let channel = transport.connect(&self.config.endpoint).await?;
        self.serve(channel).await
    }

    /// Serve on an already-connected channel until terminated.
    pub async fn serve(mut self, channel: FrameChannel) -> Result<(), WorkerError> {
        let (mut reader, mut writer) = channel.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

        out_tx
            .send(Frame::handshake(&self.config.uuid.to_string()))
            .map_err(|_| WorkerError::ChannelClosed)?;

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = writer.write_frame(&frame).await {
                    debug!(error = %e, "worker write failed");
                    break;
                }
            }
        });

        let beat_tx = out_tx.clone();
        let interval = self.heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            let mut beat = tokio::time::interval(interval);
            beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                beat.tick().await;
                if beat_tx.send(Frame::heartbeat()).is_err() {
                    break;
                }
            }
        });

        debug!(app = %self.config.app, uuid = %self.config.uuid, "worker serving");

        let result = loop {
            let frame = match reader.read_frame().await {
                Ok(frame) => frame,
                Err(FrameError::ConnectionClosed) => break Ok(()),
                Err(e) => break Err(WorkerError::Frame(e)),
            };

            match frame.kind {
                FrameKind::Invoke => {
                    let (method, payload) = match frame.decode_invoke() {
                        Ok(decoded) => decoded,
                        Err(e) => break Err(WorkerError::Frame(e)),
                    };
                    let mut sink = ResponseSink {
                        out: out_tx.clone(),
                        session: frame.channel,
                        closed: false,
                    };
                    let sent = match self.handler.invoke(&method, payload, &mut sink).await {
                        Ok(()) => sink.choke(),
                        Err(e) => {
                            warn!(method = %method, error = %e, "invocation failed");
                            sink.error(1, &e.to_string())
                        }
                    };
                    if sent.is_err() {
                        break Err(WorkerError::ChannelClosed);
                    }
                }
                FrameKind::Terminate => break Ok(()),
                FrameKind::Heartbeat => {}
                other => {
                    warn!(kind = ?other, "unexpected frame from engine");
                }
            }
        };

        heartbeat_task.abort();
        drop(out_tx);
        let _ = writer_task.await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_protocol::InProcNet;

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

    struct Failing;

    #[async_trait]
    impl Handler for Failing {
        async fn invoke(
            &mut self,
            _method: &str,
            _payload: Bytes,
            _sink: &mut ResponseSink,
        ) -> Result<(), WorkerError> {
            Err(WorkerError::Handler("no can do".to_string()))
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            app: "echo".to_string(),
            uuid: Uuid::new_v4(),
            endpoint: "engine/echo".to_string(),
        }
    }

    async fn read_skipping_heartbeats(
        channel: &mut FrameChannel,
    ) -> Result<Frame, FrameError> {
        loop {
            let frame = channel.read_frame().await?;
            if frame.kind != FrameKind::Heartbeat {
                return Ok(frame);
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_then_echo() {
        let net = InProcNet::new();
        let mut listener = net.bind("engine/echo").await.unwrap();

        let config = config();
        let uuid = config.uuid;
        let worker = tokio::spawn(Worker::new(config, Echo).run_with(net.clone()));

        let mut engine_side = listener.accept().await.unwrap();
        let hello = read_skipping_heartbeats(&mut engine_side).await.unwrap();
        assert_eq!(hello.kind, FrameKind::Handshake);
        assert_eq!(hello.decode_handshake().unwrap(), uuid.to_string());

        engine_side
            .write_frame(&Frame::invoke(11, "echo", &Bytes::from_static(b"ping")).unwrap())
            .await
            .unwrap();

        let chunk = read_skipping_heartbeats(&mut engine_side).await.unwrap();
        assert_eq!(chunk.kind, FrameKind::Chunk);
        assert_eq!(chunk.channel, 11);
        assert_eq!(chunk.payload, Bytes::from_static(b"ping"));

        let choke = read_skipping_heartbeats(&mut engine_side).await.unwrap();
        assert_eq!(choke.kind, FrameKind::Choke);

        engine_side.write_frame(&Frame::terminate()).await.unwrap();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_frame() {
        let net = InProcNet::new();
        let mut listener = net.bind("engine/echo").await.unwrap();

        let worker = tokio::spawn(Worker::new(config(), Failing).run_with(net.clone()));

        let mut engine_side = listener.accept().await.unwrap();
        let _hello = read_skipping_heartbeats(&mut engine_side).await.unwrap();

        engine_side
            .write_frame(&Frame::invoke(3, "work", &Bytes::new()).unwrap())
            .await
            .unwrap();

        let error = read_skipping_heartbeats(&mut engine_side).await.unwrap();
        assert_eq!(error.kind, FrameKind::Error);
        assert_eq!(error.channel, 3);
        let (code, message) = error.decode_error().unwrap();
        assert_eq!(code, 1);
        assert!(message.contains("no can do"));

        engine_side.write_frame(&Frame::terminate()).await.unwrap();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_engine_disconnect_ends_serve() {
        let net = InProcNet::new();
        let mut listener = net.bind("engine/echo").await.unwrap();

        let worker = tokio::spawn(Worker::new(config(), Echo).run_with(net.clone()));

        let engine_side = listener.accept().await.unwrap();
        drop(engine_side);

        worker.await.unwrap().unwrap();
    }

    impl<H: Handler + 'static> Worker<H> {
        /// Test helper: `run` with an owned transport.
        async fn run_with(self, net: InProcNet) -> Result<(), WorkerError> {
            self.run(&net).await
        }
    }
}
