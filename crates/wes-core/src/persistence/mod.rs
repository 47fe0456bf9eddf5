// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run store interface and backend implementations.
//!
//! The store is the only shared mutable resource between the monitor and the
//! callback handler. Every write is a short, single-run transaction guarded by
//! a compare-and-set on the run's `revision`: [`RunStore::apply_update`]
//! re-reads the run, applies the update with [`crate::update::apply`], and
//! retries if another writer got there first.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresRunStore;
pub use self::sqlite::SqliteRunStore;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::model::{Outputs, RunState, TaskLog, WorkflowRun};
use crate::update::{self, ApplyOutcome, CancelRequest, RunUpdate};

/// How many times a contended update is re-read and retried.
const MAX_UPDATE_ATTEMPTS: u32 = 5;

/// Columns selected for a [`RunRow`].
pub(crate) const RUN_COLUMNS: &str = "id, state, workflow_type, workflow_type_version, \
     workflow_url, workflow_params, workflow_engine, workflow_engine_version, \
     workflow_engine_parameters, tags, start_time, end_time, exit_code, system_logs, outputs, \
     stdout_url, stderr_url, backend_run_id, last_event_id, last_callback_time, backfilled, \
     revision, user_id, created_at, updated_at";

/// Columns selected for a [`TaskLogRow`].
pub(crate) const TASK_LOG_COLUMNS: &str = "id, run_id, name, cmd, start_time, end_time, \
     stdout_url, stderr_url, exit_code, system_logs, tes_uri";

/// States that do not occupy a concurrency slot.
pub(crate) const IDLE_STATES: [RunState; 5] = [
    RunState::Queued,
    RunState::Complete,
    RunState::ExecutorError,
    RunState::SystemError,
    RunState::Canceled,
];

/// Filter for the paginated run listing.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Only runs owned by this user.
    pub user_id: Option<String>,
    /// Only runs carrying all of these tags.
    pub tags: BTreeMap<String, String>,
}

/// Persistence operations needed by the monitor, the callback handler and the
/// request layer.
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run.
    async fn create_run(&self, run: &WorkflowRun) -> Result<()>;

    /// Fetch a run by id.
    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>>;

    /// Runs in any of `states`, oldest first. [`RunState::Unknown`] also
    /// matches runs whose state was never written.
    async fn list_runs_by_state(
        &self,
        states: &[RunState],
        limit: Option<i64>,
    ) -> Result<Vec<WorkflowRun>>;

    /// Number of runs holding a concurrency slot (non-terminal, not QUEUED).
    async fn count_active_runs(&self) -> Result<i64>;

    /// Newest-first page of runs matching `filter`.
    async fn list_runs(&self, filter: &RunFilter, offset: i64, limit: i64)
    -> Result<Vec<WorkflowRun>>;

    /// Number of runs per state. Every state is present in the result.
    async fn count_by_state(&self) -> Result<BTreeMap<RunState, i64>>;

    /// Task logs of a run, in reported order.
    async fn get_task_logs(&self, run_id: &str) -> Result<Vec<TaskLog>>;

    /// Write `run` if its stored revision is still `expected_revision`.
    ///
    /// Replaces the run's task logs when `task_logs` is given. Returns
    /// `false` without writing anything when the revision moved on.
    async fn write_run(
        &self,
        run: &WorkflowRun,
        expected_revision: i64,
        task_logs: Option<&[TaskLog]>,
    ) -> Result<bool>;

    /// Re-read the run, apply `update` and persist the result atomically.
    async fn apply_update(&self, run_id: &str, update: RunUpdate) -> Result<ApplyOutcome> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let run = self
                .get_run(run_id)
                .await?
                .ok_or_else(|| CoreError::RunNotFound {
                    run_id: run_id.to_string(),
                })?;
            let task_logs = self.get_task_logs(run_id).await?;

            let applied = match update::apply(&run, &task_logs, update.clone(), Utc::now()) {
                ApplyOutcome::Applied(applied) => applied,
                other => return Ok(other),
            };

            if self
                .write_run(&applied.run, run.revision, applied.task_logs.as_deref())
                .await?
            {
                return Ok(ApplyOutcome::Applied(applied));
            }

            debug!(run_id = %run_id, attempt, "Run changed concurrently, retrying update");
        }

        Err(CoreError::Conflict {
            run_id: run_id.to_string(),
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }

    /// Flip a non-terminal run to CANCELING.
    async fn request_cancel(&self, run_id: &str) -> Result<CancelRequest> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let run = self
                .get_run(run_id)
                .await?
                .ok_or_else(|| CoreError::RunNotFound {
                    run_id: run_id.to_string(),
                })?;

            let next = match update::request_cancel(&run, Utc::now()) {
                CancelRequest::Requested(next) => next,
                other => return Ok(other),
            };

            if self.write_run(&next, run.revision, None).await? {
                return Ok(CancelRequest::Requested(next));
            }

            debug!(run_id = %run_id, attempt, "Run changed concurrently, retrying cancel");
        }

        Err(CoreError::Conflict {
            run_id: run_id.to_string(),
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }
}

/// Connect to the database named by `database_url` and run migrations.
///
/// `postgres://` and `postgresql://` URLs select [`PostgresRunStore`];
/// anything else is handed to SQLite.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<Arc<dyn RunStore>> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let store = PostgresRunStore::connect(database_url, max_connections).await?;
        Ok(Arc::new(store))
    } else {
        let store = SqliteRunStore::connect(database_url, max_connections).await?;
        Ok(Arc::new(store))
    }
}

/// Database names of `states`, with `''` added when UNKNOWN is requested.
pub(crate) fn state_names(states: &[RunState]) -> Vec<String> {
    let mut names: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
    if states.contains(&RunState::Unknown) {
        names.push(String::new());
    }
    names
}

/// Zero-filled per-state counter, filled from `(state, count)` rows.
pub(crate) fn tally_states(rows: Vec<(String, i64)>) -> BTreeMap<RunState, i64> {
    let mut counts: BTreeMap<RunState, i64> = RunState::ALL.iter().map(|s| (*s, 0)).collect();
    for (state, count) in rows {
        match state.parse::<RunState>() {
            Ok(state) => *counts.entry(state).or_default() += count,
            Err(e) => debug!(error = %e, "Skipping unrecognised state in counts"),
        }
    }
    counts
}

/// A `workflow_runs` row.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RunRow {
    id: String,
    state: String,
    workflow_type: String,
    workflow_type_version: String,
    workflow_url: String,
    workflow_params: Json<Value>,
    workflow_engine: Option<String>,
    workflow_engine_version: Option<String>,
    workflow_engine_parameters: Json<BTreeMap<String, String>>,
    tags: Json<BTreeMap<String, String>>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    system_logs: Json<Vec<String>>,
    outputs: Option<Json<Outputs>>,
    stdout_url: Option<String>,
    stderr_url: Option<String>,
    backend_run_id: Option<String>,
    last_event_id: Option<String>,
    last_callback_time: Option<DateTime<Utc>>,
    backfilled: bool,
    revision: i64,
    user_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for WorkflowRun {
    type Error = CoreError;

    fn try_from(row: RunRow) -> Result<Self> {
        let state = row
            .state
            .parse::<RunState>()
            .map_err(|e| CoreError::CorruptRecord {
                run_id: row.id.clone(),
                details: e.to_string(),
            })?;

        Ok(WorkflowRun {
            id: row.id,
            state,
            workflow_type: row.workflow_type,
            workflow_type_version: row.workflow_type_version,
            workflow_url: row.workflow_url,
            workflow_params: row.workflow_params.0,
            workflow_engine: row.workflow_engine,
            workflow_engine_version: row.workflow_engine_version,
            workflow_engine_parameters: row.workflow_engine_parameters.0,
            tags: row.tags.0,
            start_time: row.start_time,
            end_time: row.end_time,
            exit_code: row.exit_code,
            system_logs: row.system_logs.0,
            outputs: row.outputs.map(|o| o.0),
            stdout_url: row.stdout_url,
            stderr_url: row.stderr_url,
            backend_run_id: row.backend_run_id,
            last_event_id: row.last_event_id,
            last_callback_time: row.last_callback_time,
            backfilled: row.backfilled,
            revision: row.revision,
            user_id: row.user_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Convert fetched rows, failing on the first corrupt one.
pub(crate) fn runs_from_rows(rows: Vec<RunRow>) -> Result<Vec<WorkflowRun>> {
    rows.into_iter().map(WorkflowRun::try_from).collect()
}

/// A `task_logs` row.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskLogRow {
    id: String,
    run_id: String,
    name: String,
    cmd: Json<Vec<String>>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    stdout_url: Option<String>,
    stderr_url: Option<String>,
    exit_code: Option<i32>,
    system_logs: Json<Vec<String>>,
    tes_uri: Option<String>,
}

impl From<TaskLogRow> for TaskLog {
    fn from(row: TaskLogRow) -> Self {
        TaskLog {
            id: row.id,
            run_id: row.run_id,
            name: row.name,
            cmd: row.cmd.0,
            start_time: row.start_time,
            end_time: row.end_time,
            stdout_url: row.stdout_url,
            stderr_url: row.stderr_url,
            exit_code: row.exit_code,
            system_logs: row.system_logs.0,
            tes_uri: row.tes_uri,
        }
    }
}
