// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed run store.

use std::collections::BTreeMap;

use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::error::{CoreError, Result};
use crate::migrations;
use crate::model::{RunState, TaskLog, WorkflowRun};

use super::{
    IDLE_STATES, RUN_COLUMNS, RunFilter, RunRow, RunStore, TASK_LOG_COLUMNS, TaskLogRow,
    runs_from_rows, state_names, tally_states,
};

/// PostgreSQL-backed run store.
#[derive(Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    /// Create a new store from an existing pool. Migrations are not run.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and apply pending migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to PostgreSQL: {}", e),
            })?;

        migrations::run_postgres(&pool).await?;

        Ok(Self { pool })
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl RunStore for PostgresRunStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (
                id, state, workflow_type, workflow_type_version, workflow_url, workflow_params,
                workflow_engine, workflow_engine_version, workflow_engine_parameters, tags,
                system_logs, revision, user_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
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
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = $1"
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

        let rows = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM workflow_runs
            WHERE state = ANY($1)
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(state_names(states))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        runs_from_rows(rows)
    }

    async fn count_active_runs(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM workflow_runs WHERE state <> ALL($1)")
                .bind(state_names(&IDLE_STATES))
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
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE TRUE"));

        if let Some(user_id) = &filter.user_id {
            query.push(" AND user_id = ").push_bind(user_id.clone());
        }
        if !filter.tags.is_empty() {
            query
                .push(" AND tags @> ")
                .push_bind(Json(filter.tags.clone()));
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
            "SELECT {TASK_LOG_COLUMNS} FROM task_logs WHERE run_id = $1 ORDER BY position ASC"
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
            SET state = $1, start_time = $2, end_time = $3, exit_code = $4, system_logs = $5,
                outputs = $6, stdout_url = $7, stderr_url = $8, backend_run_id = $9,
                last_event_id = $10, last_callback_time = $11, backfilled = $12,
                revision = $13, updated_at = $14
            WHERE id = $15 AND revision = $16
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
            sqlx::query("DELETE FROM task_logs WHERE run_id = $1")
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
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
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
