// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for foreman-core.
//!
//! Control-plane errors cross the node's service boundary and map to RPC
//! error codes; admission errors stay between caller and engine.

use thiserror::Error;

use crate::storage::StorageError;

/// Result type using the node-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Control-plane errors surfaced by the node service and app lifecycle.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed manifest, profile or runlist.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A storage object required for the operation does not exist.
    #[error("'{collection}/{key}' not found")]
    NotFound {
        collection: String,
        key: String,
    },

    /// Transient storage backend failure.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// `start_app` on an app that is already in the registry.
    #[error("app '{0}' is already running")]
    AlreadyRunning(String),

    /// `pause_app` on an app that is not in the registry.
    #[error("app '{0}' is not running")]
    NotRunning(String),

    /// Invariant violation; tears down the offending engine, never the node.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the error code string for the RPC boundary.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { collection, key } => Error::NotFound { collection, key },
            StorageError::Unavailable(details) => Error::StorageUnavailable(details),
        }
    }
}

/// Why a job was refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum EnqueueError {
    /// The app's queue is at its configured limit.
    #[error("queue is full")]
    QueueFull,

    /// The job's deadline had already passed at admission time.
    #[error("deadline has already passed")]
    DeadlineAlreadyPast,

    /// The engine is stopped or draining.
    #[error("engine is stopped")]
    EngineStopped,

    /// No app with that name is in the registry.
    #[error("app is not running")]
    AppNotRunning,
}

impl EnqueueError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::QueueFull => "QUEUE_FULL",
            Self::DeadlineAlreadyPast => "DEADLINE_ALREADY_PAST",
            Self::EngineStopped => "ENGINE_STOPPED",
            Self::AppNotRunning => "APP_NOT_RUNNING",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases: Vec<(Error, &str)> = vec![
            (Error::Configuration("bad".into()), "CONFIGURATION"),
            (
                Error::NotFound {
                    collection: "manifests".into(),
                    key: "echo".into(),
                },
                "NOT_FOUND",
            ),
            (Error::StorageUnavailable("down".into()), "STORAGE_UNAVAILABLE"),
            (Error::AlreadyRunning("echo".into()), "ALREADY_RUNNING"),
            (Error::NotRunning("echo".into()), "NOT_RUNNING"),
            (Error::Internal("whoops".into()), "INTERNAL"),
        ];
        for (error, code) in cases {
            assert_eq!(error.error_code(), code);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: Error = StorageError::NotFound {
            collection: "profiles".into(),
            key: "default".into(),
        }
        .into();
        assert_eq!(err.error_code(), "NOT_FOUND");

        let err: Error = StorageError::Unavailable("backend offline".into()).into();
        assert_eq!(err.error_code(), "STORAGE_UNAVAILABLE");
    }

    #[test]
    fn test_enqueue_error_codes() {
        assert_eq!(EnqueueError::QueueFull.error_code(), "QUEUE_FULL");
        assert_eq!(
            EnqueueError::DeadlineAlreadyPast.error_code(),
            "DEADLINE_ALREADY_PAST"
        );
        assert_eq!(EnqueueError::EngineStopped.error_code(), "ENGINE_STOPPED");
        assert_eq!(EnqueueError::AppNotRunning.error_code(), "APP_NOT_RUNNING");
    }
}
