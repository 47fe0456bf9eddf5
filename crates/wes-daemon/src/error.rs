// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for wes-daemon.

use thiserror::Error;

/// Daemon errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Run store operation failed.
    #[error("Store error: {0}")]
    Core(#[from] wes_core::CoreError),

    /// Executor backend call failed.
    #[error("Executor error: {0}")]
    Executor(#[from] crate::executor::ExecutorError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the daemon Error.
pub type Result<T> = std::result::Result<T, Error>;
