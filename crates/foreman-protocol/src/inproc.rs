// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process transport.
//!
//! A shared rendezvous table mapping endpoint names to accept queues.
//! Dialing creates a `tokio::io::duplex` pair, hands one end to the
//! listener and returns the other. Used by the mock isolate and tests;
//! embedded deployments can use it to avoid sockets entirely.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::transport::{FrameChannel, Listener, Transport};

const PIPE_CAPACITY: usize = 64 * 1024;

/// An in-process network: one rendezvous namespace shared by every clone.
#[derive(Clone, Default)]
pub struct InProcNet {
    inner: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<FrameChannel>>>>,
    next_anon: Arc<AtomicU64>,
}

impl InProcNet {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for InProcNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcNet").finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for InProcNet {
    fn transport_type(&self) -> &'static str {
        "inproc"
    }

    async fn bind(&self, endpoint: &str) -> io::Result<Box<dyn Listener>> {
        let name = if endpoint.is_empty() {
            format!("inproc-{}", self.next_anon.fetch_add(1, Ordering::Relaxed))
        } else {
            endpoint.to_string()
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.inner.lock().expect("inproc table poisoned");
        if table.contains_key(&name) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("endpoint '{name}' is already bound"),
            ));
        }
        table.insert(name.clone(), tx);
        drop(table);

        Ok(Box::new(InProcListener {
            net: self.clone(),
            name,
            rx,
        }))
    }

    async fn connect(&self, endpoint: &str) -> io::Result<FrameChannel> {
        let tx = {
            let table = self.inner.lock().expect("inproc table poisoned");
            table.get(endpoint).cloned()
        };
        let Some(tx) = tx else {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no listener on endpoint '{endpoint}'"),
            ));
        };

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        tx.send(FrameChannel::new(far)).map_err(|_| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("listener on '{endpoint}' is gone"),
            )
        })?;
        Ok(FrameChannel::new(near))
    }
}

struct InProcListener {
    net: InProcNet,
    name: String,
    rx: mpsc::UnboundedReceiver<FrameChannel>,
}

impl std::fmt::Debug for InProcListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcListener")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Listener for InProcListener {
    async fn accept(&mut self) -> io::Result<FrameChannel> {
        self.rx.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "inproc listener closed")
        })
    }

    fn local_endpoint(&self) -> String {
        self.name.clone()
    }
}

impl Drop for InProcListener {
    fn drop(&mut self) {
        if let Ok(mut table) = self.net.inner.lock() {
            table.remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, FrameKind};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_rendezvous_round_trip() {
        let net = InProcNet::new();
        let mut listener = net.bind("engine/echo").await.unwrap();

        let dialer_net = net.clone();
        let dialer = tokio::spawn(async move {
            let mut channel = dialer_net.connect("engine/echo").await.unwrap();
            channel.write_frame(&Frame::handshake("w-1")).await.unwrap();
            channel.read_frame().await.unwrap()
        });

        let mut accepted = listener.accept().await.unwrap();
        let hello = accepted.read_frame().await.unwrap();
        assert_eq!(hello.kind, FrameKind::Handshake);
        accepted
            .write_frame(&Frame::chunk(1, Bytes::from_static(b"hi")).unwrap())
            .await
            .unwrap();

        let reply = dialer.await.unwrap();
        assert_eq!(reply.channel, 1);
    }

    #[tokio::test]
    async fn test_connect_refused_without_listener() {
        let net = InProcNet::new();
        let err = net.connect("nowhere").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_anonymous_bind_gets_unique_names() {
        let net = InProcNet::new();
        let a = net.bind("").await.unwrap();
        let b = net.bind("").await.unwrap();
        assert_ne!(a.local_endpoint(), b.local_endpoint());
    }

    #[tokio::test]
    async fn test_double_bind_rejected() {
        let net = InProcNet::new();
        let _first = net.bind("dup").await.unwrap();
        let err = net.bind("dup").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn test_endpoint_released_on_listener_drop() {
        let net = InProcNet::new();
        let listener = net.bind("ephemeral").await.unwrap();
        drop(listener);
        assert!(net.bind("ephemeral").await.is_ok());
    }
}
