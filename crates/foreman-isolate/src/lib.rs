// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Foreman Isolate - slave process backends.
//!
//! An [`Isolate`] starts and stops the worker processes an engine
//! supervises. Two backends are provided:
//!
//! - [`ProcessIsolate`]: real fork/exec children (unix only).
//! - [`MockIsolate`]: scripted in-process workers over an
//!   in-process transport, for tests and embedded use.
//!
//! Isolates never touch the engine's state: they deliver child lifecycle
//! events through the [`SlaveProcess`] handle and leave handshakes,
//! liveness and job routing to the engine.

pub mod mock;
#[cfg(unix)]
pub mod process;
mod traits;

pub use mock::{MockIsolate, WorkerBehavior, WorkerContext, behaviors};
#[cfg(unix)]
pub use process::ProcessIsolate;
pub use traits::*;
