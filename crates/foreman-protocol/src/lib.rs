// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Foreman Protocol - framing and transport for engine/slave channels
//!
//! This crate provides the wire protocol spoken between an app engine and
//! its slave workers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    foreman-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Frames: handshake / heartbeat / terminate /                │
//! │          invoke / chunk / choke / error                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: 4B length | 2B kind | 8B channel id | payload     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: TCP (tokio::net) or in-process rendezvous       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The channel id multiplexes job sessions over one connection: control
//! frames travel on channel 0, data frames carry the job id they answer.
//! Engines consume the [`Transport`]/[`Listener`] seams only, so the wire
//! is swappable per deployment.

pub mod frame;
pub mod inproc;
pub mod transport;

pub use frame::{CONTROL_CHANNEL, Frame, FrameError, FrameKind, MAX_FRAME_SIZE};
pub use inproc::InProcNet;
pub use transport::{FrameChannel, FrameReader, FrameWriter, Listener, TcpTransport, Transport};
