// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend state-change callbacks.
//!
//! Backends (for example a HealthOmics EventBridge rule) push state changes
//! instead of waiting for the monitor to poll. Each event carries an event
//! id; replaying the most recent event is a no-op. Runs that already reached
//! a terminal state are never moved again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, info, warn};
use wes_core::{
    ApplyOutcome, CoreError, Outputs, Rejection, RunState, RunStore, RunUpdate, is_valid_transition,
};

/// Maps native backend statuses carried by callbacks to WES states.
pub trait StatusMapper: Send + Sync {
    /// Backend name used in log lines (e.g. "Omics").
    fn backend_name(&self) -> &'static str;

    /// Mapped state, or `None` for statuses the backend does not define.
    fn map_status(&self, status: &str) -> Option<RunState>;
}

/// A state-change event pushed by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendEvent {
    /// Backend run identifier.
    pub backend_run_id: String,
    /// WES run the event belongs to.
    pub wes_run_id: String,
    /// Native backend status.
    pub status: String,
    /// Unique event id used for idempotency.
    pub event_id: String,
    pub event_time: DateTime<Utc>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Output name to location mapping, sent with completion events.
    #[serde(default)]
    pub output_mapping: Option<Map<String, Value>>,
    #[serde(default)]
    pub log_urls: Option<Map<String, Value>>,
}

/// Result of a processed callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackResponse {
    pub success: bool,
    pub wes_run_id: String,
    pub previous_state: RunState,
    pub new_state: RunState,
    pub message: String,
    /// True if this event id was already recorded on the run.
    pub already_processed: bool,
}

/// Callback failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CallbackError {
    /// The run does not exist.
    #[error("Workflow run {run_id} not found")]
    NotFound { run_id: String },

    /// The backend status has no WES equivalent.
    #[error("Unknown {backend} status: {status}")]
    UnknownStatus { backend: &'static str, status: String },

    /// The transition table forbids the change.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    /// The update was refused for another reason.
    #[error("Callback rejected: {0}")]
    Rejected(Rejection),

    /// The run store failed.
    #[error("Store error: {0}")]
    Store(#[from] CoreError),
}

impl CallbackError {
    /// HTTP status code a request layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            CallbackError::NotFound { .. } => 404,
            CallbackError::UnknownStatus { .. }
            | CallbackError::InvalidTransition { .. }
            | CallbackError::Rejected(_) => 400,
            CallbackError::Store(_) => 500,
        }
    }
}

/// Applies backend events to runs.
pub struct CallbackHandler {
    store: Arc<dyn RunStore>,
    mapper: Arc<dyn StatusMapper>,
}

impl CallbackHandler {
    pub fn new(store: Arc<dyn RunStore>, mapper: Arc<dyn StatusMapper>) -> Self {
        Self { store, mapper }
    }

    /// Process one event.
    pub async fn handle(&self, event: BackendEvent) -> Result<CallbackResponse, CallbackError> {
        let backend = self.mapper.backend_name();
        info!(
            run_id = %event.wes_run_id,
            backend_run_id = %event.backend_run_id,
            status = %event.status,
            event_id = %event.event_id,
            "Processing state change callback"
        );

        let run = self
            .store
            .get_run(&event.wes_run_id)
            .await?
            .ok_or_else(|| CallbackError::NotFound {
                run_id: event.wes_run_id.clone(),
            })?;

        if run.last_event_id.as_deref() == Some(event.event_id.as_str()) {
            info!(run_id = %run.id, event_id = %event.event_id, "Duplicate callback event");
            return Ok(already_processed(&run.id, run.state, &event.event_id));
        }

        let new_state = self.mapper.map_status(&event.status).ok_or_else(|| {
            error!(run_id = %run.id, status = %event.status, "Unknown backend status");
            CallbackError::UnknownStatus {
                backend,
                status: event.status.clone(),
            }
        })?;

        let previous = run.state;
        let update = if previous.is_terminal() {
            late_update(backend, &event, previous, new_state)
        } else if new_state == previous {
            confirming_update(backend, &event, previous)
        } else {
            if !is_valid_transition(previous, new_state) {
                error!(
                    run_id = %run.id,
                    from = %previous,
                    to = %new_state,
                    "Invalid callback transition"
                );
                return Err(CallbackError::InvalidTransition {
                    from: previous,
                    to: new_state,
                });
            }
            transition_update(backend, &event, previous, new_state)
        };

        match self.store.apply_update(&run.id, update).await {
            Ok(ApplyOutcome::Applied(applied)) => {
                let (from, to) = (applied.previous, applied.run.state);
                if from.is_terminal() {
                    info!(
                        run_id = %run.id,
                        state = %from,
                        "Late callback recorded on terminal run"
                    );
                    return Ok(terminal_unchanged(&run.id, from));
                }
                info!(run_id = %run.id, from = %from, to = %to, "Run updated via callback");
                Ok(CallbackResponse {
                    success: true,
                    wes_run_id: run.id,
                    previous_state: from,
                    new_state: to,
                    message: if from == to {
                        format!("State {} confirmed", to)
                    } else {
                        format!("Successfully updated state from {} to {}", from, to)
                    },
                    already_processed: false,
                })
            }
            Ok(ApplyOutcome::Duplicate) => {
                Ok(already_processed(&run.id, previous, &event.event_id))
            }
            Ok(ApplyOutcome::Frozen(state)) => {
                warn!(
                    run_id = %run.id,
                    state = %state,
                    ignored = %new_state,
                    "Run already in terminal state, ignoring callback"
                );
                Ok(terminal_unchanged(&run.id, state))
            }
            Ok(ApplyOutcome::Rejected(Rejection::IllegalTransition { from, to })) => {
                Err(CallbackError::InvalidTransition { from, to })
            }
            Ok(ApplyOutcome::Rejected(rejection)) => Err(CallbackError::Rejected(rejection)),
            Err(CoreError::RunNotFound { run_id }) => Err(CallbackError::NotFound { run_id }),
            Err(e) => Err(e.into()),
        }
    }
}

fn already_processed(run_id: &str, state: RunState, event_id: &str) -> CallbackResponse {
    CallbackResponse {
        success: true,
        wes_run_id: run_id.to_string(),
        previous_state: state,
        new_state: state,
        message: format!("Event {} already processed", event_id),
        already_processed: true,
    }
}

fn terminal_unchanged(run_id: &str, state: RunState) -> CallbackResponse {
    CallbackResponse {
        success: true,
        wes_run_id: run_id.to_string(),
        previous_state: state,
        new_state: state,
        message: format!("Run already in terminal state {}", state),
        already_processed: false,
    }
}

fn detail_lines(event: &BackendEvent) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(message) = event.status_message.as_deref().filter(|m| !m.is_empty()) {
        lines.push(format!("Status: {}", message));
    }
    if let Some(reason) = event.failure_reason.as_deref().filter(|r| !r.is_empty()) {
        lines.push(format!("Failure reason: {}", reason));
    }
    lines
}

fn run_log_url(event: &BackendEvent) -> Option<String> {
    event
        .log_urls
        .as_ref()?
        .get("run_log")?
        .as_str()
        .map(str::to_string)
}

fn completion_outputs(event: &BackendEvent) -> Outputs {
    let mut outputs = Outputs::new();
    outputs.insert(
        "backend_run_id".to_string(),
        Value::String(event.backend_run_id.clone()),
    );
    if let Some(mapping) = &event.output_mapping {
        outputs.insert("output_mapping".to_string(), Value::Object(mapping.clone()));
    }
    if let Some(log_urls) = &event.log_urls {
        outputs.insert("log_urls".to_string(), Value::Object(log_urls.clone()));
    }
    outputs
}

fn transition_update(
    backend: &str,
    event: &BackendEvent,
    previous: RunState,
    new_state: RunState,
) -> RunUpdate {
    let mut update = RunUpdate::transition(new_state)
        .with_log(format!(
            "State updated via callback: {} -> {} ({}: {})",
            previous, new_state, backend, event.status
        ))
        .with_logs(detail_lines(event))
        .with_backend_run_id(event.backend_run_id.clone())
        .with_event_id(event.event_id.clone());

    if let Some(url) = run_log_url(event) {
        update = update.with_stdout_url(url);
    }

    if new_state == RunState::Complete {
        update = update.with_outputs(completion_outputs(event));
    } else if new_state.is_terminal() {
        if let Some(log_urls) = &event.log_urls {
            update = update.with_log(format!("Log URLs: {}", Value::Object(log_urls.clone())));
        }
    }
    update
}

fn confirming_update(backend: &str, event: &BackendEvent, state: RunState) -> RunUpdate {
    RunUpdate::log_only(format!(
        "State confirmed via callback: {} ({}: {})",
        state, backend, event.status
    ))
    .with_logs(detail_lines(event))
    .with_event_id(event.event_id.clone())
}

/// Update for an event arriving after the run finished. It records the
/// event as a log line only; the store accepts at most one such backfill per
/// run and absorbs the rest.
fn late_update(
    backend: &str,
    event: &BackendEvent,
    current: RunState,
    reported: RunState,
) -> RunUpdate {
    RunUpdate::log_only(format!(
        "Late callback after {}: {}: {} ({})",
        current, backend, event.status, reported
    ))
    .with_event_id(event.event_id.clone())
}
