// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Applying updates to runs.
//!
//! Every mutation of a stored run goes through [`apply`] (or
//! [`request_cancel`]), which is where the run invariants live:
//!
//! - the state only moves along edges of the transition table;
//! - `start_time` is stamped once, when the run leaves QUEUED;
//! - `end_time` and `exit_code` are stamped when the run becomes terminal;
//! - `outputs` may only be written for COMPLETE runs;
//! - `system_logs` only grows;
//! - a terminal run is frozen, apart from one logs/outputs backfill;
//! - an update carrying an already-recorded event id is a no-op.
//!
//! The backfill also moves the bookkeeping columns (`last_event_id`,
//! `last_callback_time`, `revision`, `updated_at`) so a replayed late event
//! stays a no-op and concurrent writers still see the change. State, times,
//! exit code and task logs of a terminal run never change.
//!
//! The functions are pure. Stores re-read the run, call [`apply`], and write
//! the result back with a compare-and-set on [`WorkflowRun::revision`].

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Map;

use crate::model::{NewTaskLog, Outputs, RunState, TaskLog, WorkflowRun};
use crate::state_machine::is_valid_transition;

/// A change requested by the monitor or the callback handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    /// Target state. `None` keeps the current state.
    pub state: Option<RunState>,
    /// Lines appended to `system_logs`.
    pub logs: Vec<String>,
    /// Merged into `outputs`; only legal when the target state is COMPLETE.
    pub outputs: Option<Outputs>,
    /// Exit code for a failed terminal transition. COMPLETE always uses 0.
    pub exit_code: Option<i32>,
    pub backend_run_id: Option<String>,
    pub stdout_url: Option<String>,
    pub stderr_url: Option<String>,
    /// Replaces the run's task logs wholesale.
    pub task_logs: Option<Vec<NewTaskLog>>,
    /// Callback event id, recorded for duplicate detection.
    pub event_id: Option<String>,
}

impl RunUpdate {
    /// An update that moves the run to `state`.
    pub fn transition(state: RunState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// An update that only appends a log line.
    pub fn log_only(line: impl Into<String>) -> Self {
        Self::default().with_log(line)
    }

    pub fn with_log(mut self, line: impl Into<String>) -> Self {
        self.logs.push(line.into());
        self
    }

    pub fn with_logs(mut self, lines: impl IntoIterator<Item = String>) -> Self {
        self.logs.extend(lines);
        self
    }

    pub fn with_outputs(mut self, outputs: Outputs) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_backend_run_id(mut self, handle: impl Into<String>) -> Self {
        self.backend_run_id = Some(handle.into());
        self
    }

    pub fn with_stdout_url(mut self, url: impl Into<String>) -> Self {
        self.stdout_url = Some(url.into());
        self
    }

    pub fn with_stderr_url(mut self, url: impl Into<String>) -> Self {
        self.stderr_url = Some(url.into());
        self
    }

    pub fn with_task_logs(mut self, task_logs: Vec<NewTaskLog>) -> Self {
        self.task_logs = Some(task_logs);
        self
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }
}

/// Why an update was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// The transition table has no such edge.
    #[error("Invalid state transition: {from} -> {to}")]
    IllegalTransition { from: RunState, to: RunState },
    /// Outputs were supplied for a run that is not COMPLETE.
    #[error("Outputs can only be recorded for COMPLETE runs (state {state})")]
    OutputsWithoutCompletion { state: RunState },
}

/// A successfully applied update, ready to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedUpdate {
    /// State before the update.
    pub previous: RunState,
    /// The run after the update, with `revision` already incremented.
    pub run: WorkflowRun,
    /// Replacement task logs, when they changed.
    pub task_logs: Option<Vec<TaskLog>>,
}

impl AppliedUpdate {
    /// Whether the state changed.
    pub fn transitioned(&self) -> bool {
        self.previous != self.run.state
    }
}

/// Result of applying an update to a run.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(Box<AppliedUpdate>),
    /// The update's event id was already recorded. Nothing changed.
    Duplicate,
    /// The run is terminal and the update was absorbed. Nothing changed.
    Frozen(RunState),
    Rejected(Rejection),
}

/// Result of a cancellation request.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelRequest {
    /// The run now waits in CANCELING for the monitor.
    Requested(Box<WorkflowRun>),
    /// Cancellation was already requested.
    AlreadyCanceling,
    /// The run is finished and cannot be canceled.
    AlreadyTerminal(RunState),
}

/// Apply `update` to `run`, whose current task logs are `task_logs`.
pub fn apply(
    run: &WorkflowRun,
    task_logs: &[TaskLog],
    update: RunUpdate,
    now: DateTime<Utc>,
) -> ApplyOutcome {
    if let Some(event_id) = update.event_id.as_deref()
        && run.last_event_id.as_deref() == Some(event_id)
    {
        return ApplyOutcome::Duplicate;
    }

    let previous = run.state;
    if previous.is_terminal() {
        return apply_backfill(run, update, now);
    }

    let target = update.state.unwrap_or(previous);
    if target != previous && !is_valid_transition(previous, target) {
        return ApplyOutcome::Rejected(Rejection::IllegalTransition {
            from: previous,
            to: target,
        });
    }
    if update.outputs.is_some() && target != RunState::Complete {
        return ApplyOutcome::Rejected(Rejection::OutputsWithoutCompletion { state: target });
    }

    let mut next = run.clone();
    next.state = target;
    stamp_start_time(&mut next, previous, target, now);

    if target.is_terminal() {
        next.end_time = Some(now);
        next.exit_code = Some(terminal_exit_code(target, update.exit_code));
        if target == RunState::Complete {
            let mut outputs = next.outputs.take().unwrap_or_default();
            if let Some(reported) = update.outputs {
                outputs.extend(reported);
            }
            next.outputs = Some(outputs);
        }
    }

    next.system_logs.extend(update.logs);
    if let Some(handle) = update.backend_run_id {
        next.backend_run_id = Some(handle);
    }
    if let Some(url) = update.stdout_url {
        next.stdout_url = Some(url);
    }
    if let Some(url) = update.stderr_url {
        next.stderr_url = Some(url);
    }
    if let Some(event_id) = update.event_id {
        next.last_event_id = Some(event_id);
        next.last_callback_time = Some(now);
    }

    let replaced = update.task_logs.is_some();
    let mut tasks: Vec<TaskLog> = match update.task_logs {
        Some(mut reported) => {
            unique_task_ids(&mut reported);
            reported
                .into_iter()
                .map(|task| TaskLog::from_report(&run.id, task))
                .collect()
        }
        None => task_logs.to_vec(),
    };
    let mut tasks_changed = replaced;
    if target.is_terminal() {
        tasks_changed |= close_open_tasks(&mut tasks, now);
    }

    next.revision += 1;
    next.updated_at = now;

    ApplyOutcome::Applied(Box::new(AppliedUpdate {
        previous,
        run: next,
        task_logs: tasks_changed.then_some(tasks),
    }))
}

/// Suffix repeated backend task ids with their position so each reported
/// task keeps its own row. The first occurrence keeps its id.
pub fn unique_task_ids(tasks: &mut [NewTaskLog]) {
    let mut seen = HashSet::new();
    for (position, task) in tasks.iter_mut().enumerate() {
        let Some(id) = task.id.as_mut() else {
            continue;
        };
        if seen.contains(id.as_str()) {
            let base = id.clone();
            let mut n = position;
            while seen.contains(id.as_str()) {
                *id = format!("{}-{}", base, n);
                n += 1;
            }
        }
        seen.insert(id.clone());
    }
}

/// Move a non-terminal run to CANCELING.
pub fn request_cancel(run: &WorkflowRun, now: DateTime<Utc>) -> CancelRequest {
    if run.state.is_terminal() {
        return CancelRequest::AlreadyTerminal(run.state);
    }
    if run.state == RunState::Canceling {
        return CancelRequest::AlreadyCanceling;
    }

    let mut next = run.clone();
    next.state = RunState::Canceling;
    stamp_start_time(&mut next, run.state, RunState::Canceling, now);
    next.system_logs
        .push(format!("Cancellation requested (state was {})", run.state));
    next.revision += 1;
    next.updated_at = now;

    CancelRequest::Requested(Box::new(next))
}

/// The one post-terminal write: extra log lines and new output keys.
fn apply_backfill(run: &WorkflowRun, update: RunUpdate, now: DateTime<Utc>) -> ApplyOutcome {
    let changes_state = update.state.is_some_and(|state| state != run.state);
    let has_payload = !update.logs.is_empty() || update.outputs.is_some();
    if changes_state || run.backfilled || !has_payload {
        return ApplyOutcome::Frozen(run.state);
    }
    if update.outputs.is_some() && run.state != RunState::Complete {
        return ApplyOutcome::Rejected(Rejection::OutputsWithoutCompletion { state: run.state });
    }

    let mut next = run.clone();
    next.system_logs.extend(update.logs);
    if let Some(extra) = update.outputs {
        let outputs = next.outputs.get_or_insert_with(Map::new);
        for (key, value) in extra {
            outputs.entry(key).or_insert(value);
        }
    }
    if let Some(event_id) = update.event_id {
        next.last_event_id = Some(event_id);
        next.last_callback_time = Some(now);
    }
    next.backfilled = true;
    next.revision += 1;
    next.updated_at = now;

    ApplyOutcome::Applied(Box::new(AppliedUpdate {
        previous: run.state,
        run: next,
        task_logs: None,
    }))
}

fn stamp_start_time(
    run: &mut WorkflowRun,
    previous: RunState,
    target: RunState,
    now: DateTime<Utc>,
) {
    let leaving_start = matches!(previous, RunState::Queued | RunState::Unknown);
    if run.start_time.is_none() && leaving_start && target != previous && target != RunState::Queued
    {
        run.start_time = Some(now);
    }
}

fn terminal_exit_code(state: RunState, reported: Option<i32>) -> i32 {
    match state {
        RunState::Complete => 0,
        _ => reported.filter(|code| *code != 0).unwrap_or(1),
    }
}

/// Close tasks still open when the run finishes. Returns whether any changed.
fn close_open_tasks(tasks: &mut [TaskLog], now: DateTime<Utc>) -> bool {
    let mut changed = false;
    for task in tasks.iter_mut().filter(|task| task.end_time.is_none()) {
        task.end_time = Some(now);
        changed = true;
    }
    changed
}
