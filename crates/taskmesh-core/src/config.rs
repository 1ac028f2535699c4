// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

/// Taskmesh Hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// SQLite connection URL; `None` keeps state in memory only
    pub database_url: Option<String>,
    /// Minutes after which a held lock is considered stale
    pub lock_expiry_minutes: i64,
    /// Maximum id-tree levels walked when routing a failure to an error task
    pub error_routing_cap: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            lock_expiry_minutes: 5,
            error_routing_cap: 10,
        }
    }
}

impl HubConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `TASKMESH_DATABASE_URL`: SQLite connection string (default: in-memory state)
    /// - `TASKMESH_LOCK_EXPIRY_MINUTES`: stale lock threshold (default: 5)
    /// - `TASKMESH_ERROR_ROUTING_CAP`: error routing walk bound (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TASKMESH_DATABASE_URL").ok();

        let lock_expiry_minutes: i64 = std::env::var("TASKMESH_LOCK_EXPIRY_MINUTES")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("TASKMESH_LOCK_EXPIRY_MINUTES", "must be a positive integer")
            })?;
        if lock_expiry_minutes <= 0 {
            return Err(ConfigError::Invalid(
                "TASKMESH_LOCK_EXPIRY_MINUTES",
                "must be a positive integer",
            ));
        }

        let error_routing_cap: usize = std::env::var("TASKMESH_ERROR_ROUTING_CAP")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("TASKMESH_ERROR_ROUTING_CAP", "must be a positive integer")
            })?;

        Ok(Self {
            database_url,
            lock_expiry_minutes,
            error_routing_cap,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
