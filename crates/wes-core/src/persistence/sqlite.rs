// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed run store.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::{CoreError, Result};
use crate::migrations;
use crate::model::{RunState, TaskLog, WorkflowRun};

use super::{
    IDLE_STATES, RUN_COLUMNS, RunFilter, RunRow, RunStore, TASK_LOG_COLUMNS, TaskLogRow,
    runs_from_rows, state_names, tally_states,
};

/// SQLite-backed run store.
#[derive(Clone)]
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Create a new store from an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a `sqlite:` URL, creating the file if needed, and apply
    /// pending migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Invalid SQLite URL {}: {}", database_url, e),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", database_url, e),
            })?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// Create and initialize a store backed by the file at `path`.
    ///
    /// Parent directories are created when missing.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        Self::connect(&format!("sqlite:{}", path.to_string_lossy()), 5).await
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn push_state_list(query: &mut QueryBuilder<'_, Sqlite>, states: &[RunState]) {
    query.push("(");
    let mut separated = query.separated(", ");
    for name in state_names(states) {
        separated.push_bind(name);
    }
    separated.push_unseparated(")");
}

#[async_trait::async_trait]
impl RunStore for SqliteRunStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (
                id, state, workflow_type, workflow_type_version, workflow_url, workflow_params,
                workflow_engine, workflow_engine_version, workflow_engine_parameters, tags,
                system_logs, revision, user_id, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(run.state.as_str())
        .bind(&run.workflow_type)
        .bind(&run.workflow_type_version)
        .bind(&run.workflow_url)
        .bind(Json(&run.workflow_params))
        .bind(&run.workflow_engine)
        .bind(&run.workflow_engine_version)
        .bind(Json(&run.workflow_engine_parameters))
        .bind(Json(&run.tags))
        .bind(Json(&run.system_logs))
        .bind(run.revision)
        .bind(&run.user_id)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = ?"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowRun::try_from).transpose()
    }

    async fn list_runs_by_state(
        &self,
        states: &[RunState],
        limit: Option<i64>,
    ) -> Result<Vec<WorkflowRun>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE state IN "
        ));
        push_state_list(&mut query, states);
        // SQLite treats a negative LIMIT as no limit.
        query
            .push(" ORDER BY created_at ASC LIMIT ")
            .push_bind(limit.unwrap_or(-1));

        let rows = query
            .build_query_as::<RunRow>()
            .fetch_all(&self.pool)
            .await?;

        runs_from_rows(rows)
    }

    async fn count_active_runs(&self) -> Result<i64> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM workflow_runs WHERE state NOT IN ");
        push_state_list(&mut query, &IDLE_STATES);

        let count: i64 = query
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    async fn list_runs(
        &self,
        filter: &RunFilter,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<WorkflowRun>> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE 1 = 1"));

        if let Some(user_id) = &filter.user_id {
            query.push(" AND user_id = ").push_bind(user_id.clone());
        }
        for (key, value) in &filter.tags {
            let path = format!("$.\"{}\"", key.replace('"', "\\\""));
            query
                .push(" AND json_extract(tags, ")
                .push_bind(path)
                .push(") = ")
                .push_bind(value.clone());
        }

        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = query
            .build_query_as::<RunRow>()
            .fetch_all(&self.pool)
            .await?;

        runs_from_rows(rows)
    }

    async fn count_by_state(&self) -> Result<BTreeMap<RunState, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM workflow_runs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        Ok(tally_states(rows))
    }

    async fn get_task_logs(&self, run_id: &str) -> Result<Vec<TaskLog>> {
        let rows = sqlx::query_as::<_, TaskLogRow>(&format!(
            "SELECT {TASK_LOG_COLUMNS} FROM task_logs WHERE run_id = ? ORDER BY position ASC"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(TaskLog::from).collect())
    }

    async fn write_run(
        &self,
        run: &WorkflowRun,
        expected_revision: i64,
        task_logs: Option<&[TaskLog]>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET state = ?, start_time = ?, end_time = ?, exit_code = ?, system_logs = ?,
                outputs = ?, stdout_url = ?, stderr_url = ?, backend_run_id = ?,
                last_event_id = ?, last_callback_time = ?, backfilled = ?,
                revision = ?, updated_at = ?
            WHERE id = ? AND revision = ?
            "#,
        )
        .bind(run.state.as_str())
        .bind(run.start_time)
        .bind(run.end_time)
        .bind(run.exit_code)
        .bind(Json(&run.system_logs))
        .bind(run.outputs.as_ref().map(Json))
        .bind(&run.stdout_url)
        .bind(&run.stderr_url)
        .bind(&run.backend_run_id)
        .bind(&run.last_event_id)
        .bind(run.last_callback_time)
        .bind(run.backfilled)
        .bind(run.revision)
        .bind(run.updated_at)
        .bind(&run.id)
        .bind(expected_revision)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(task_logs) = task_logs {
            sqlx::query("DELETE FROM task_logs WHERE run_id = ?")
                .bind(&run.id)
                .execute(&mut *tx)
                .await?;

            for (position, task) in task_logs.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO task_logs (
                        id, run_id, position, name, cmd, start_time, end_time,
                        stdout_url, stderr_url, exit_code, system_logs, tes_uri
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&task.id)
                .bind(&run.id)
                .bind(position as i32)
                .bind(&task.name)
                .bind(Json(&task.cmd))
                .bind(task.start_time)
                .bind(task.end_time)
                .bind(&task.stdout_url)
                .bind(&task.stderr_url)
                .bind(task.exit_code)
                .bind(Json(&task.system_logs))
                .bind(&task.tes_uri)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }
}
