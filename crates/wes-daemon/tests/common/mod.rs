// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for wes-daemon integration tests.
//!
//! Provides an in-memory run store, run fixtures and a scripted executor.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use wes_core::persistence::SqliteRunStore;
use wes_core::{NewRun, RunState, RunStore, WorkflowRun};
use wes_daemon::executor::{
    CancelOutcome, Executor, ExecutorError, StatusReport, Submission,
};

/// Fresh in-memory store with migrations applied.
pub async fn test_store() -> Arc<dyn RunStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");

    wes_core::migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");

    Arc::new(SqliteRunStore::new(pool))
}

/// A CWL run request.
pub fn new_run() -> NewRun {
    NewRun {
        workflow_type: "CWL".to_string(),
        workflow_type_version: "v1.2".to_string(),
        workflow_url: "https://example.org/wf.cwl".to_string(),
        workflow_params: json!({"reads": {"class": "File", "path": "s3://bucket/r.fq"}}),
        ..Default::default()
    }
}

/// Insert a QUEUED run.
pub async fn queued_run(store: &Arc<dyn RunStore>) -> WorkflowRun {
    let run = WorkflowRun::queued(new_run(), Utc::now());
    store.create_run(&run).await.expect("Failed to create run");
    run
}

/// Insert a run and force it into `state` with an optional backend handle.
pub async fn run_in_state(
    store: &Arc<dyn RunStore>,
    state: RunState,
    handle: Option<&str>,
) -> WorkflowRun {
    let run = queued_run(store).await;
    let now = Utc::now();

    let mut next = run.clone();
    next.state = state;
    next.backend_run_id = handle.map(str::to_string);
    if state != RunState::Queued {
        next.start_time = Some(now);
    }
    if state.is_terminal() {
        next.end_time = Some(now);
        next.exit_code = Some(if state == RunState::Complete { 0 } else { 1 });
    }
    if state == RunState::Complete {
        next.outputs = Some(serde_json::Map::new());
    }
    next.revision += 1;

    let written = store
        .write_run(&next, run.revision, None)
        .await
        .expect("Failed to write run");
    assert!(written, "fixture write lost a revision race");
    next
}

/// Reload a run that must exist.
pub async fn reload(store: &Arc<dyn RunStore>, run_id: &str) -> WorkflowRun {
    store
        .get_run(run_id)
        .await
        .expect("Failed to read run")
        .expect("Run disappeared")
}

/// Assert that `end_time` is set exactly for terminal runs.
pub fn assert_end_time_invariant(run: &WorkflowRun) {
    assert_eq!(
        run.end_time.is_some(),
        run.state.is_terminal(),
        "run {} in {} has end_time {:?}",
        run.id,
        run.state,
        run.end_time
    );
}

/// Executor whose poll results are scripted per handle.
///
/// Handles are `scripted-{run_id}`. A poll with an empty script keeps
/// reporting RUNNING. Errors are scripted as `Err(message)` and returned as
/// transient executor errors.
#[derive(Default)]
pub struct ScriptedExecutor {
    pub scripts: Mutex<HashMap<String, VecDeque<Result<StatusReport, String>>>>,
    pub submitted: Mutex<Vec<String>>,
    pub canceled: Mutex<Vec<String>>,
    pub confirm_cancel: bool,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            confirm_cancel: true,
            ..Default::default()
        }
    }

    pub fn handle_for(run_id: &str) -> String {
        format!("scripted-{}", run_id)
    }

    /// Queue a poll result for `handle`.
    pub fn script(&self, handle: &str, result: Result<StatusReport, String>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(handle.to_string())
            .or_default()
            .push_back(result);
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn executor_type(&self) -> &'static str {
        "scripted"
    }

    async fn submit(&self, run: &WorkflowRun) -> wes_daemon::executor::Result<Submission> {
        self.submitted.lock().unwrap().push(run.id.clone());
        Ok(Submission {
            handle: Self::handle_for(&run.id),
            state: RunState::Initializing,
            logs: vec!["Submitted to scripted backend".to_string()],
        })
    }

    async fn poll_status(
        &self,
        _run: &WorkflowRun,
        handle: &str,
    ) -> wes_daemon::executor::Result<StatusReport> {
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(handle)
            .and_then(VecDeque::pop_front);
        match next {
            Some(Ok(report)) => Ok(report),
            Some(Err(message)) => Err(ExecutorError::Transient(message)),
            None => Ok(StatusReport::new(RunState::Running, "RUNNING")),
        }
    }

    async fn cancel(
        &self,
        _run: &WorkflowRun,
        handle: &str,
    ) -> wes_daemon::executor::Result<CancelOutcome> {
        self.canceled.lock().unwrap().push(handle.to_string());
        if self.confirm_cancel {
            Ok(CancelOutcome::Confirmed)
        } else {
            Ok(CancelOutcome::Unconfirmed("backend unreachable".to_string()))
        }
    }
}
