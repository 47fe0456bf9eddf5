// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run and task log records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key/value payload stored in a run's `outputs`.
pub type Outputs = Map<String, Value>;

/// Lifecycle state of a workflow run.
///
/// Serialized in SCREAMING_SNAKE_CASE (`EXECUTOR_ERROR`, `SYSTEM_ERROR`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// State was never set or could not be determined.
    Unknown,
    /// Accepted and waiting for a dispatch slot.
    Queued,
    /// Submitted; the backend is preparing the run.
    Initializing,
    /// Executing on the backend.
    Running,
    /// Suspended on the backend.
    Paused,
    /// Finished successfully.
    Complete,
    /// The workflow itself failed.
    ExecutorError,
    /// The orchestrator or backend infrastructure failed.
    SystemError,
    /// Cancellation finished.
    Canceled,
    /// Cancellation requested, waiting for the monitor.
    Canceling,
    /// Preempted by the backend.
    Preempted,
}

impl RunState {
    /// Every state, in declaration order.
    pub const ALL: [RunState; 11] = [
        RunState::Unknown,
        RunState::Queued,
        RunState::Initializing,
        RunState::Running,
        RunState::Paused,
        RunState::Complete,
        RunState::ExecutorError,
        RunState::SystemError,
        RunState::Canceled,
        RunState::Canceling,
        RunState::Preempted,
    ];

    /// States with no outgoing transitions.
    pub const TERMINAL: [RunState; 4] = [
        RunState::Complete,
        RunState::ExecutorError,
        RunState::SystemError,
        RunState::Canceled,
    ];

    /// Wire/database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Unknown => "UNKNOWN",
            RunState::Queued => "QUEUED",
            RunState::Initializing => "INITIALIZING",
            RunState::Running => "RUNNING",
            RunState::Paused => "PAUSED",
            RunState::Complete => "COMPLETE",
            RunState::ExecutorError => "EXECUTOR_ERROR",
            RunState::SystemError => "SYSTEM_ERROR",
            RunState::Canceled => "CANCELED",
            RunState::Canceling => "CANCELING",
            RunState::Preempted => "PREEMPTED",
        }
    }

    /// Whether the run is finished and frozen.
    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not a known run state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown run state: {0}")]
pub struct ParseRunStateError(pub String);

impl FromStr for RunState {
    type Err = ParseRunStateError;

    /// Parses the SCREAMING_SNAKE_CASE name. An empty string is a run whose
    /// state was never written and parses as [`RunState::Unknown`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(RunState::Unknown);
        }
        RunState::ALL
            .iter()
            .find(|state| state.as_str() == trimmed)
            .copied()
            .ok_or_else(|| ParseRunStateError(s.to_string()))
    }
}

/// Workflow languages the orchestrator accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowType {
    /// Common Workflow Language.
    Cwl,
    /// Workflow Description Language.
    Wdl,
}

impl WorkflowType {
    /// Canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Cwl => "CWL",
            WorkflowType::Wdl => "WDL",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CWL" => Ok(WorkflowType::Cwl),
            "WDL" => Ok(WorkflowType::Wdl),
            _ => Err(s.to_string()),
        }
    }
}

/// Request to create a run, as handed over by the request layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRun {
    pub workflow_type: String,
    pub workflow_type_version: String,
    pub workflow_url: String,
    #[serde(default)]
    pub workflow_params: Value,
    #[serde(default)]
    pub workflow_engine: Option<String>,
    #[serde(default)]
    pub workflow_engine_version: Option<String>,
    #[serde(default)]
    pub workflow_engine_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// A persisted workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Immutable UUID assigned at creation.
    pub id: String,
    pub state: RunState,
    pub workflow_type: String,
    pub workflow_type_version: String,
    pub workflow_url: String,
    /// Opaque parameter payload passed through to the executor.
    pub workflow_params: Value,
    pub workflow_engine: Option<String>,
    pub workflow_engine_version: Option<String>,
    pub workflow_engine_parameters: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    /// Set once, when the run leaves QUEUED.
    pub start_time: Option<DateTime<Utc>>,
    /// Set once, when the run enters a terminal state.
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Append-only.
    pub system_logs: Vec<String>,
    /// Present only for COMPLETE runs.
    pub outputs: Option<Outputs>,
    pub stdout_url: Option<String>,
    pub stderr_url: Option<String>,
    /// Handle returned by the executor on submission.
    pub backend_run_id: Option<String>,
    /// Id of the last callback event applied to this run.
    pub last_event_id: Option<String>,
    pub last_callback_time: Option<DateTime<Utc>>,
    /// Whether the single post-terminal backfill has been spent.
    pub backfilled: bool,
    /// Incremented on every write; used for compare-and-set updates.
    pub revision: i64,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Build a fresh QUEUED run with a new id.
    pub fn queued(request: NewRun, now: DateTime<Utc>) -> Self {
        let workflow_params = if request.workflow_params.is_null() {
            Value::Object(Map::new())
        } else {
            request.workflow_params
        };

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: RunState::Queued,
            workflow_type: request.workflow_type,
            workflow_type_version: request.workflow_type_version,
            workflow_url: request.workflow_url,
            workflow_params,
            workflow_engine: request.workflow_engine,
            workflow_engine_version: request.workflow_engine_version,
            workflow_engine_parameters: request.workflow_engine_parameters,
            tags: request.tags,
            start_time: None,
            end_time: None,
            exit_code: None,
            system_logs: Vec::new(),
            outputs: None,
            stdout_url: None,
            stderr_url: None,
            backend_run_id: None,
            last_event_id: None,
            last_callback_time: None,
            backfilled: false,
            revision: 0,
            user_id: request.user_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Parsed workflow language, if it is one we know.
    pub fn workflow_kind(&self) -> Option<WorkflowType> {
        self.workflow_type.parse().ok()
    }
}

/// A task as reported by a backend while polling.
///
/// Executors produce these; the store turns them into [`TaskLog`] rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTaskLog {
    /// Backend-assigned id, when the backend has a stable one.
    pub id: Option<String>,
    pub name: String,
    pub cmd: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub stdout_url: Option<String>,
    pub stderr_url: Option<String>,
    pub exit_code: Option<i32>,
    pub system_logs: Vec<String>,
    pub tes_uri: Option<String>,
}

/// A persisted task log owned by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: String,
    pub run_id: String,
    pub name: String,
    pub cmd: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub stdout_url: Option<String>,
    pub stderr_url: Option<String>,
    pub exit_code: Option<i32>,
    pub system_logs: Vec<String>,
    pub tes_uri: Option<String>,
}

impl TaskLog {
    /// Attach a reported task to its run.
    pub fn from_report(run_id: &str, report: NewTaskLog) -> Self {
        Self {
            id: report
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            run_id: run_id.to_string(),
            name: report.name,
            cmd: report.cmd,
            start_time: report.start_time,
            end_time: report.end_time,
            stdout_url: report.stdout_url,
            stderr_url: report.stderr_url,
            exit_code: report.exit_code,
            system_logs: report.system_logs,
            tes_uri: report.tes_uri,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_str() {
        for state in RunState::ALL {
            assert_eq!(state.as_str().parse::<RunState>().unwrap(), state);
        }
    }

    #[test]
    fn test_empty_state_parses_as_unknown() {
        assert_eq!("".parse::<RunState>().unwrap(), RunState::Unknown);
        assert_eq!("  ".parse::<RunState>().unwrap(), RunState::Unknown);
    }

    #[test]
    fn test_unknown_state_string_is_error() {
        let err = "DONE".parse::<RunState>().unwrap_err();
        assert_eq!(err.0, "DONE");
    }

    #[test]
    fn test_state_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&RunState::ExecutorError).unwrap();
        assert_eq!(json, "\"EXECUTOR_ERROR\"");
    }

    #[test]
    fn test_terminal_set() {
        let terminal: Vec<_> = RunState::ALL
            .into_iter()
            .filter(RunState::is_terminal)
            .collect();
        assert_eq!(terminal, RunState::TERMINAL.to_vec());
        assert!(!RunState::Canceling.is_terminal());
        assert!(!RunState::Preempted.is_terminal());
    }

    #[test]
    fn test_workflow_type_parse_is_case_insensitive() {
        assert_eq!("cwl".parse::<WorkflowType>().unwrap(), WorkflowType::Cwl);
        assert_eq!("WDL".parse::<WorkflowType>().unwrap(), WorkflowType::Wdl);
        assert!("nextflow".parse::<WorkflowType>().is_err());
    }

    #[test]
    fn test_queued_run_defaults() {
        let run = WorkflowRun::queued(
            NewRun {
                workflow_type: "CWL".into(),
                workflow_type_version: "v1.2".into(),
                workflow_url: "https://example.org/wf.cwl".into(),
                ..Default::default()
            },
            Utc::now(),
        );
        assert_eq!(run.state, RunState::Queued);
        assert!(run.workflow_params.is_object());
        assert!(run.start_time.is_none());
        assert!(run.end_time.is_none());
        assert!(run.outputs.is_none());
        assert_eq!(run.workflow_kind(), Some(WorkflowType::Cwl));
    }
}
