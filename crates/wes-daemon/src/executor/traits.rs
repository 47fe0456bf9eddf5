// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor trait definitions.
//!
//! Defines the abstract interface for workflow execution backends.

use async_trait::async_trait;
use thiserror::Error;
use wes_core::{NewTaskLog, Outputs, RunState, WorkflowRun};

/// Errors from executor operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// The backend could not be reached or answered with a retryable failure.
    #[error("Backend unavailable: {0}")]
    Transient(String),

    /// The backend refused the request.
    #[error("Backend rejected request ({status}): {message}")]
    Rejected {
        /// HTTP status returned by the backend.
        status: u16,
        /// Response body or message.
        message: String,
    },

    /// The run cannot be expressed as a backend request.
    #[error("Invalid run: {0}")]
    InvalidRequest(String),

    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Executor is misconfigured.
    #[error("Executor configuration error: {0}")]
    Config(String),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

impl ExecutorError {
    /// Build the error for a non-success HTTP response.
    pub(crate) fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ExecutorError::Transient(format!("{}: {}", status, body))
        } else {
            ExecutorError::Rejected {
                status: status.as_u16(),
                message: body,
            }
        }
    }
}

/// Result type for executor operations.
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Outcome of submitting a run to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    /// Backend identifier used for later polls and cancellation.
    pub handle: String,
    /// State the run is in right after submission.
    pub state: RunState,
    /// Lines to append to the run's system logs.
    pub logs: Vec<String>,
}

/// A point-in-time view of a run as seen by its backend.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    /// Mapped WES state.
    pub state: RunState,
    /// Native status string, kept for log lines.
    pub backend_status: String,
    /// Outputs, only meaningful when `state` is COMPLETE.
    pub outputs: Option<Outputs>,
    /// Current task list, replacing the stored one when present.
    pub task_logs: Option<Vec<NewTaskLog>>,
    /// Lines to append to the run's system logs.
    pub logs: Vec<String>,
    /// Exit code reported by the backend for terminal states.
    pub exit_code: Option<i32>,
    pub stdout_url: Option<String>,
    pub stderr_url: Option<String>,
}

impl StatusReport {
    /// A bare report carrying only the mapped state.
    pub fn new(state: RunState, backend_status: impl Into<String>) -> Self {
        Self {
            state,
            backend_status: backend_status.into(),
            outputs: None,
            task_logs: None,
            logs: Vec::new(),
            exit_code: None,
            stdout_url: None,
            stderr_url: None,
        }
    }
}

/// Result of asking a backend to stop a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The backend acknowledged the cancellation.
    Confirmed,
    /// The backend could not confirm; the reason is recorded on the run.
    Unconfirmed(String),
}

/// Trait for workflow execution backends.
///
/// Executors are PURE backend adapters - they do NOT access the run store.
/// The monitor owns every state change and persists what executors report.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executor type identifier (e.g., "local", "omics")
    fn executor_type(&self) -> &'static str;

    /// Hand a QUEUED run to the backend.
    async fn submit(&self, run: &WorkflowRun) -> Result<Submission>;

    /// Query the backend for the current status of a submitted run.
    ///
    /// Native statuses with no WES equivalent are reported as SYSTEM_ERROR
    /// with a diagnostic log line rather than as an error.
    async fn poll_status(&self, run: &WorkflowRun, handle: &str) -> Result<StatusReport>;

    /// Ask the backend to stop a run.
    async fn cancel(&self, run: &WorkflowRun, handle: &str) -> Result<CancelOutcome>;
}
