// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that drives runs through their lifecycle.
//!
//! Every iteration runs three phases against the run store:
//!
//! 1. **Reconcile** runs in RUNNING, INITIALIZING, PAUSED or UNKNOWN by
//!    polling the executor and writing back state changes, task logs and
//!    outputs.
//! 2. **Dispatch** QUEUED runs to the executor while fewer than
//!    `max_concurrent_runs` runs hold a backend slot.
//! 3. **Cancel** runs in CANCELING and move them to CANCELED.
//!
//! Each per-run step is its own task and its own store write, so one failing
//! run never blocks the others. Only a failed store listing aborts a phase;
//! it is retried on the next iteration.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use wes_core::{
    ApplyOutcome, NewTaskLog, RunState, RunStore, RunUpdate, TaskLog, WorkflowRun,
    is_valid_transition, update::unique_task_ids,
};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::{CancelOutcome, Executor, StatusReport};

/// States the reconcile phase polls.
pub const RECONCILE_STATES: [RunState; 4] = [
    RunState::Running,
    RunState::Initializing,
    RunState::Paused,
    RunState::Unknown,
];

/// Configuration for the workflow monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sleep between iterations.
    pub poll_interval: Duration,
    /// Maximum runs holding a backend slot. Also bounds how many executor
    /// calls are in flight at once.
    pub max_concurrent_runs: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_concurrent_runs: 10,
        }
    }
}

impl From<&Config> for MonitorConfig {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            max_concurrent_runs: config.max_concurrent_runs,
        }
    }
}

/// Counters for one monitor iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationReport {
    /// Runs polled in the reconcile phase.
    pub polled: usize,
    /// State transitions written by any phase.
    pub transitions: usize,
    /// Runs handed to the executor.
    pub dispatched: usize,
    /// Submissions that failed and moved the run to SYSTEM_ERROR.
    pub submit_failures: usize,
    /// Runs moved from CANCELING to CANCELED.
    pub canceled: usize,
    /// Per-run steps that failed and were skipped.
    pub errors: usize,
}

/// What happened to a single run in a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Nothing was written.
    Unchanged,
    /// Logs or task logs were written without a state change.
    Recorded,
    /// The run moved to a new state.
    Transitioned(RunState),
}

/// Background worker polling the run store and the executor.
pub struct Monitor {
    store: Arc<dyn RunStore>,
    executor: Arc<dyn Executor>,
    config: MonitorConfig,
    limiter: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl Monitor {
    /// Create a new monitor.
    pub fn new(
        store: Arc<dyn RunStore>,
        executor: Arc<dyn Executor>,
        config: MonitorConfig,
    ) -> Self {
        let permits = config.max_concurrent_runs.max(1);
        Self {
            store,
            executor,
            config,
            limiter: Arc::new(Semaphore::new(permits)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the monitor loop until the shutdown signal is received.
    ///
    /// The first iteration starts immediately. A batch of per-run tasks is
    /// always joined before the loop sleeps or checks for shutdown.
    pub async fn run(&self) {
        info!(
            executor = self.executor.executor_type(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_concurrent_runs = self.config.max_concurrent_runs,
            "Workflow monitor started"
        );

        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Workflow monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(delay) => {
                    let report = self.run_once().await;
                    debug!(
                        polled = report.polled,
                        transitions = report.transitions,
                        dispatched = report.dispatched,
                        submit_failures = report.submit_failures,
                        canceled = report.canceled,
                        errors = report.errors,
                        "Monitor iteration finished"
                    );
                    delay = self.config.poll_interval;
                }
            }
        }

        info!("Workflow monitor stopped");
    }

    /// Run one iteration: reconcile, dispatch, then cancel.
    pub async fn run_once(&self) -> IterationReport {
        let mut report = IterationReport::default();

        if let Err(e) = self.reconcile(&mut report).await {
            error!(error = %e, "Failed to reconcile active runs");
        }
        if let Err(e) = self.dispatch(&mut report).await {
            error!(error = %e, "Failed to dispatch queued runs");
        }
        if let Err(e) = self.cancel(&mut report).await {
            error!(error = %e, "Failed to process cancellation requests");
        }

        report
    }

    async fn reconcile(&self, report: &mut IterationReport) -> Result<()> {
        let runs = self.store.list_runs_by_state(&RECONCILE_STATES, None).await?;
        if runs.is_empty() {
            return Ok(());
        }
        debug!(count = runs.len(), "Reconciling active runs");
        report.polled += runs.len();

        for (run_id, result) in self.run_batch(runs, reconcile_run).await {
            match result {
                Ok(Step::Transitioned(_)) => report.transitions += 1,
                Ok(_) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(run_id = %run_id, error = %e, "Failed to reconcile run");
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, report: &mut IterationReport) -> Result<()> {
        let active = self.store.count_active_runs().await?;
        let ceiling = i64::try_from(self.config.max_concurrent_runs).unwrap_or(i64::MAX);
        let slots = ceiling.saturating_sub(active);
        if slots <= 0 {
            debug!(active, ceiling, "No free execution slots");
            return Ok(());
        }

        let runs = self
            .store
            .list_runs_by_state(&[RunState::Queued], Some(slots))
            .await?;
        if runs.is_empty() {
            return Ok(());
        }
        info!(count = runs.len(), free_slots = slots, "Dispatching queued runs");

        for (run_id, result) in self.run_batch(runs, dispatch_run).await {
            match result {
                Ok(Step::Transitioned(RunState::SystemError)) => {
                    report.submit_failures += 1;
                    report.transitions += 1;
                }
                Ok(Step::Transitioned(_)) => {
                    report.dispatched += 1;
                    report.transitions += 1;
                }
                Ok(Step::Recorded) => report.dispatched += 1,
                Ok(Step::Unchanged) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(run_id = %run_id, error = %e, "Failed to dispatch run");
                }
            }
        }
        Ok(())
    }

    async fn cancel(&self, report: &mut IterationReport) -> Result<()> {
        let runs = self
            .store
            .list_runs_by_state(&[RunState::Canceling], None)
            .await?;
        if runs.is_empty() {
            return Ok(());
        }
        info!(count = runs.len(), "Canceling runs");

        for (run_id, result) in self.run_batch(runs, cancel_run).await {
            match result {
                Ok(Step::Transitioned(RunState::Canceled)) => {
                    report.canceled += 1;
                    report.transitions += 1;
                }
                Ok(Step::Transitioned(_)) => report.transitions += 1,
                Ok(_) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(run_id = %run_id, error = %e, "Failed to cancel run");
                }
            }
        }
        Ok(())
    }

    /// Run `step` for every run on its own task and wait for all of them.
    async fn run_batch<F, Fut>(
        &self,
        runs: Vec<WorkflowRun>,
        step: F,
    ) -> Vec<(String, Result<Step>)>
    where
        F: Fn(Arc<dyn RunStore>, Arc<dyn Executor>, WorkflowRun) -> Fut,
        Fut: Future<Output = Result<Step>> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for run in runs {
            let run_id = run.id.clone();
            let limiter = self.limiter.clone();
            let fut = step(self.store.clone(), self.executor.clone(), run);
            tasks.spawn(async move {
                let result = match limiter.acquire_owned().await {
                    Ok(_permit) => fut.await,
                    Err(e) => Err(Error::Other(format!("Concurrency limiter closed: {}", e))),
                };
                (run_id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!(error = %e, "Run task panicked or was aborted"),
            }
        }
        results
    }
}

/// Write `update` and classify the outcome.
async fn write(store: &dyn RunStore, run_id: &str, update: RunUpdate) -> Result<Step> {
    match store.apply_update(run_id, update).await? {
        ApplyOutcome::Applied(applied) => {
            if applied.transitioned() {
                info!(
                    run_id = %run_id,
                    from = %applied.previous,
                    to = %applied.run.state,
                    "Run state updated"
                );
                Ok(Step::Transitioned(applied.run.state))
            } else {
                Ok(Step::Recorded)
            }
        }
        ApplyOutcome::Duplicate => Ok(Step::Unchanged),
        ApplyOutcome::Frozen(state) => {
            debug!(run_id = %run_id, state = %state, "Run already terminal, update absorbed");
            Ok(Step::Unchanged)
        }
        ApplyOutcome::Rejected(rejection) => {
            warn!(run_id = %run_id, reason = %rejection, "Run update rejected");
            Ok(Step::Unchanged)
        }
    }
}

fn transition_line(from: RunState, to: RunState) -> String {
    format!("Run state update: {} -> {}", from, to)
}

/// Build the update carrying a state change reported by the executor.
fn report_update(from: RunState, report: StatusReport) -> RunUpdate {
    let mut update = RunUpdate::transition(report.state)
        .with_log(transition_line(from, report.state))
        .with_logs(report.logs);
    if report.state == RunState::Complete {
        if let Some(outputs) = report.outputs {
            update = update.with_outputs(outputs);
        }
    }
    if let Some(code) = report.exit_code {
        update = update.with_exit_code(code);
    }
    if let Some(tasks) = report.task_logs {
        update = update.with_task_logs(tasks);
    }
    if let Some(url) = report.stdout_url {
        update = update.with_stdout_url(url);
    }
    if let Some(url) = report.stderr_url {
        update = update.with_stderr_url(url);
    }
    update
}

/// Whether reported tasks differ from what is stored.
fn tasks_changed(stored: &[TaskLog], reported: &[NewTaskLog]) -> bool {
    if stored.len() != reported.len() {
        return true;
    }
    stored.iter().zip(reported).any(|(old, new)| {
        new.id.as_deref().is_some_and(|id| id != old.id)
            || old.name != new.name
            || old.cmd != new.cmd
            || old.start_time != new.start_time
            || old.end_time != new.end_time
            || old.exit_code != new.exit_code
            || old.stdout_url != new.stdout_url
            || old.stderr_url != new.stderr_url
            || old.system_logs != new.system_logs
            || old.tes_uri != new.tes_uri
    })
}

async fn reconcile_run(
    store: Arc<dyn RunStore>,
    executor: Arc<dyn Executor>,
    run: WorkflowRun,
) -> Result<Step> {
    let Some(handle) = run.backend_run_id.clone() else {
        warn!(run_id = %run.id, state = %run.state, "Active run has no backend run id");
        let update = RunUpdate::transition(RunState::SystemError)
            .with_log(transition_line(run.state, RunState::SystemError))
            .with_log("No backend run id recorded; cannot track run");
        return write(store.as_ref(), &run.id, update).await;
    };

    let mut report = executor.poll_status(&run, &handle).await?;
    if let Some(tasks) = report.task_logs.as_mut() {
        unique_task_ids(tasks);
    }
    debug!(
        run_id = %run.id,
        backend_status = %report.backend_status,
        state = %report.state,
        "Polled run status"
    );

    if report.state == run.state {
        let has_logs = !report.logs.is_empty();
        let new_tasks = match &report.task_logs {
            Some(reported) => tasks_changed(&store.get_task_logs(&run.id).await?, reported),
            None => false,
        };
        if !has_logs && !new_tasks {
            return Ok(Step::Unchanged);
        }

        let mut update = RunUpdate::default().with_logs(report.logs);
        if new_tasks {
            if let Some(tasks) = report.task_logs {
                update = update.with_task_logs(tasks);
            }
        }
        return write(store.as_ref(), &run.id, update).await;
    }

    // Backends can finish between two polls; pass through RUNNING when the
    // reported state is not directly reachable.
    let mut from = run.state;
    if !is_valid_transition(from, report.state)
        && is_valid_transition(from, RunState::Running)
        && is_valid_transition(RunState::Running, report.state)
    {
        let step = RunUpdate::transition(RunState::Running)
            .with_log(transition_line(from, RunState::Running));
        write(store.as_ref(), &run.id, step).await?;
        from = RunState::Running;
    }

    write(store.as_ref(), &run.id, report_update(from, report)).await
}

async fn dispatch_run(
    store: Arc<dyn RunStore>,
    executor: Arc<dyn Executor>,
    run: WorkflowRun,
) -> Result<Step> {
    info!(run_id = %run.id, workflow_type = %run.workflow_type, "Submitting run");

    let submission = match executor.submit(&run).await {
        Ok(submission) => submission,
        Err(e) => {
            error!(run_id = %run.id, error = %e, "Failed to submit workflow");
            let update = RunUpdate::transition(RunState::SystemError)
                .with_log(transition_line(run.state, RunState::SystemError))
                .with_log(format!("Failed to submit workflow: {}", e));
            return write(store.as_ref(), &run.id, update).await;
        }
    };

    info!(
        run_id = %run.id,
        backend_run_id = %submission.handle,
        state = %submission.state,
        "Run submitted"
    );

    let update = RunUpdate::transition(submission.state)
        .with_backend_run_id(submission.handle.clone())
        .with_logs(submission.logs.clone())
        .with_log(transition_line(run.state, submission.state));

    match store.apply_update(&run.id, update).await? {
        ApplyOutcome::Applied(applied) => Ok(if applied.transitioned() {
            Step::Transitioned(applied.run.state)
        } else {
            Step::Recorded
        }),
        ApplyOutcome::Rejected(rejection) => {
            // Typically a cancel request landed while submitting. Keep the
            // handle so the cancel phase can stop the backend run.
            warn!(run_id = %run.id, reason = %rejection, "Submitted run changed state meanwhile");
            let record = RunUpdate::default()
                .with_backend_run_id(submission.handle)
                .with_logs(submission.logs)
                .with_log(format!("Run submitted but not started: {}", rejection));
            write(store.as_ref(), &run.id, record).await
        }
        ApplyOutcome::Frozen(state) => {
            warn!(
                run_id = %run.id,
                state = %state,
                "Run finished while submitting, canceling backend run"
            );
            if let Err(e) = executor.cancel(&run, &submission.handle).await {
                warn!(run_id = %run.id, error = %e, "Failed to cancel orphaned backend run");
            }
            Ok(Step::Unchanged)
        }
        ApplyOutcome::Duplicate => Ok(Step::Unchanged),
    }
}

async fn cancel_run(
    store: Arc<dyn RunStore>,
    executor: Arc<dyn Executor>,
    run: WorkflowRun,
) -> Result<Step> {
    let outcome_line = match run.backend_run_id.as_deref() {
        None => "No backend run to cancel".to_string(),
        Some(handle) => match executor.cancel(&run, handle).await {
            Ok(CancelOutcome::Confirmed) => "Cancellation confirmed by backend".to_string(),
            Ok(CancelOutcome::Unconfirmed(reason)) => {
                warn!(run_id = %run.id, reason = %reason, "Backend did not confirm cancellation");
                format!("Cancellation not confirmed by backend: {}", reason)
            }
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Cancel request to backend failed");
                format!("Cancellation not confirmed by backend: {}", e)
            }
        },
    };

    let update = RunUpdate::transition(RunState::Canceled)
        .with_log(transition_line(run.state, RunState::Canceled))
        .with_log(outcome_line);
    write(store.as_ref(), &run.id, update).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn task(name: &str) -> NewTaskLog {
        NewTaskLog {
            id: Some(format!("t-{}", name)),
            name: name.to_string(),
            cmd: vec!["echo".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_tasks_changed() {
        let reported = vec![task("a"), task("b")];
        let stored: Vec<TaskLog> = reported
            .iter()
            .cloned()
            .map(|t| TaskLog::from_report("run-1", t))
            .collect();
        assert!(!tasks_changed(&stored, &reported));
        assert!(tasks_changed(&stored[..1], &reported));

        let mut finished = reported.clone();
        finished[1].end_time = Some(Utc::now());
        assert!(tasks_changed(&stored, &finished));
    }

    #[test]
    fn test_report_update_drops_outputs_unless_complete() {
        let mut report = StatusReport::new(RunState::ExecutorError, "FAILED");
        report.outputs = Some(json!({"x": 1}).as_object().cloned().unwrap_or_default());
        report.exit_code = Some(2);
        report.logs.push("boom".to_string());

        let update = report_update(RunState::Running, report);
        assert_eq!(update.state, Some(RunState::ExecutorError));
        assert!(update.outputs.is_none());
        assert_eq!(update.exit_code, Some(2));
        assert_eq!(
            update.logs,
            vec!["Run state update: RUNNING -> EXECUTOR_ERROR".to_string(), "boom".to_string()]
        );
    }

    #[test]
    fn test_config_from_daemon_config() {
        let config = Config::from_lookup(|key| match key {
            "WES_DATABASE_URL" => Some("sqlite::memory:".to_string()),
            "WES_DAEMON_POLL_INTERVAL" => Some("2".to_string()),
            "WES_DAEMON_MAX_CONCURRENT_RUNS" => Some("3".to_string()),
            _ => None,
        })
        .unwrap();
        let monitor_config = MonitorConfig::from(&config);
        assert_eq!(monitor_config.poll_interval, Duration::from_secs(2));
        assert_eq!(monitor_config.max_concurrent_runs, 3);
    }
}
