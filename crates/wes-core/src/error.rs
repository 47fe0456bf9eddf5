// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for wes-core.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the run store.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Run was not found in the database.
    #[error("Run '{run_id}' not found")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// A stored row could not be turned into a run.
    #[error("Corrupt record for run '{run_id}': {details}")]
    CorruptRecord {
        /// The affected run.
        run_id: String,
        /// What was wrong with the row.
        details: String,
    },

    /// The run kept changing underneath a compare-and-set update.
    #[error("Run '{run_id}' was modified concurrently {attempts} times; giving up")]
    Conflict {
        /// The contended run.
        run_id: String,
        /// How many times the update was retried.
        attempts: u32,
    },

    /// Database operation failed.
    #[error("Database error during {operation}: {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::Conflict { .. } => "CONFLICT",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether the error comes from the database connection rather than a
    /// particular run.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::DatabaseError { .. })
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
