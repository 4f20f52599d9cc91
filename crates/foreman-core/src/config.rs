// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

/// Profile defaults, applied when a profile document omits a field.
pub mod defaults {
    /// Max seconds a spawned slave has to complete its handshake.
    pub const STARTUP_TIMEOUT: f64 = 10.0;
    /// Max idle seconds between slave heartbeats before it is killed.
    pub const HEARTBEAT_TIMEOUT: f64 = 30.0;
    /// Idle seconds after which a slave is told to terminate.
    pub const IDLE_TIMEOUT: f64 = 600.0;
    /// Grace seconds before a terminating slave is force-killed.
    pub const TERMINATION_TIMEOUT: f64 = 5.0;
    /// Hard cap on concurrent slaves per app.
    pub const POOL_LIMIT: usize = 10;
    /// Hard cap on pending jobs per app (0 = unbounded).
    pub const QUEUE_LIMIT: usize = 100;
    /// Worker binary used when the profile names none.
    pub const SLAVE: &str = "foreman-worker-generic";
    /// Runlist read at node boot.
    pub const RUNLIST: &str = "default";
}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Runlist document read at boot.
    pub runlist: String,
    /// Endpoint each engine binds its slave listener on.
    pub endpoint: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runlist: defaults::RUNLIST.to_string(),
            endpoint: "127.0.0.1:0".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `FOREMAN_RUNLIST`: runlist read at boot (default: "default")
    /// - `FOREMAN_ENDPOINT`: engine bind endpoint (default: "127.0.0.1:0",
    ///   an OS-assigned port per engine)
    pub fn from_env() -> Result<Self, ConfigError> {
        let runlist =
            std::env::var("FOREMAN_RUNLIST").unwrap_or_else(|_| defaults::RUNLIST.to_string());
        if runlist.is_empty() {
            return Err(ConfigError::Invalid("FOREMAN_RUNLIST", "must not be empty"));
        }

        let endpoint =
            std::env::var("FOREMAN_ENDPOINT").unwrap_or_else(|_| "127.0.0.1:0".to_string());

        Ok(Self { runlist, endpoint })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
