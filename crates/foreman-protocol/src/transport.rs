// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport seams for engine/slave channels.
//!
//! A [`Transport`] binds listeners and dials endpoints; both sides speak
//! [`Frame`]s over a [`FrameChannel`]. The engine only ever sees these
//! traits, so tests swap TCP for an in-process rendezvous without touching
//! engine code.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::frame::{Frame, FrameError, read_frame, write_frame};

/// Object-safe alias for the byte streams a channel runs over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// A bidirectional framed channel over an arbitrary byte stream.
pub struct FrameChannel {
    io: Box<dyn Io>,
}

impl FrameChannel {
    /// Wrap a byte stream in a framed channel.
    pub fn new(io: impl Io + 'static) -> Self {
        Self { io: Box::new(io) }
    }

    /// Read the next frame.
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.io).await
    }

    /// Write one frame.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.io, frame).await
    }

    /// Split into independently owned read and write halves.
    pub fn split(self) -> (FrameReader, FrameWriter) {
        let (read, write) = tokio::io::split(self.io);
        (FrameReader { io: read }, FrameWriter { io: write })
    }
}

impl std::fmt::Debug for FrameChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameChannel").finish_non_exhaustive()
    }
}

/// Read half of a [`FrameChannel`].
pub struct FrameReader {
    io: ReadHalf<Box<dyn Io>>,
}

impl FrameReader {
    /// Read the next frame.
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.io).await
    }
}

/// Write half of a [`FrameChannel`].
pub struct FrameWriter {
    io: WriteHalf<Box<dyn Io>>,
}

impl FrameWriter {
    /// Write one frame.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.io, frame).await
    }
}

/// Capability set for binding and dialing framed channels.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport type identifier (e.g. "tcp", "inproc").
    fn transport_type(&self) -> &'static str;

    /// Bind a listener on the given endpoint.
    ///
    /// The returned listener reports the concrete endpoint it is reachable
    /// at, which may differ from the requested one (port 0 binds).
    async fn bind(&self, endpoint: &str) -> io::Result<Box<dyn Listener>>;

    /// Dial an endpoint and return the connected channel.
    async fn connect(&self, endpoint: &str) -> io::Result<FrameChannel>;
}

/// Accept side of a bound endpoint.
#[async_trait]
pub trait Listener: Send + std::fmt::Debug {
    /// Accept the next inbound channel.
    async fn accept(&mut self) -> io::Result<FrameChannel>;

    /// The concrete endpoint this listener is reachable at.
    fn local_endpoint(&self) -> String;
}

/// Plain TCP transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    fn transport_type(&self) -> &'static str {
        "tcp"
    }

    async fn bind(&self, endpoint: &str) -> io::Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(endpoint).await?;
        let local = listener.local_addr()?.to_string();
        Ok(Box::new(TcpChannelListener { listener, local }))
    }

    async fn connect(&self, endpoint: &str) -> io::Result<FrameChannel> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        Ok(FrameChannel::new(stream))
    }
}

struct TcpChannelListener {
    listener: TcpListener,
    local: String,
}

impl std::fmt::Debug for TcpChannelListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannelListener")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Listener for TcpChannelListener {
    async fn accept(&mut self) -> io::Result<FrameChannel> {
        let (stream, _) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(FrameChannel::new(stream))
    }

    fn local_endpoint(&self) -> String {
        self.local.clone()
    }
}
