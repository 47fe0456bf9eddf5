// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run operations for the request layer.
//!
//! [`RunService`] validates and records new runs, pages through existing
//! ones and turns cancel requests into CANCELING. It never talks to an
//! executor; the monitor picks up whatever this service writes.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use wes_core::{
    CancelRequest, CoreError, NewRun, RunFilter, RunState, RunStore, TaskLog, WorkflowRun,
    WorkflowType,
};

/// Page size used when a listing request does not give one.
pub const DEFAULT_PAGE_SIZE: i64 = 10;
/// Largest page a listing request may ask for.
pub const MAX_PAGE_SIZE: i64 = 100;

/// Engine parameter and tag holding a human-readable run name.
const NAME_PARAM: &str = "name";
const NAME_TAG: &str = "Name";

/// Errors returned by [`RunService`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunServiceError {
    #[error("Unsupported workflow type: {0}")]
    UnsupportedWorkflowType(String),

    #[error("Unsupported {workflow_type} version {version} (supported: {supported})")]
    UnsupportedWorkflowVersion {
        workflow_type: WorkflowType,
        version: String,
        supported: String,
    },

    #[error("Invalid page token: {0}")]
    InvalidPageToken(String),

    #[error("Workflow run not found: {run_id}")]
    NotFound { run_id: String },

    #[error("Not authorized to access this workflow run")]
    Forbidden { run_id: String },

    #[error("Cannot cancel run in state {state}")]
    CannotCancel { state: RunState },

    #[error("Store error: {0}")]
    Store(#[from] CoreError),
}

impl RunServiceError {
    /// HTTP status code a request layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::UnsupportedWorkflowType(_)
            | Self::UnsupportedWorkflowVersion { .. }
            | Self::InvalidPageToken(_)
            | Self::CannotCancel { .. } => 400,
            Self::Forbidden { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::Store(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, RunServiceError>;

/// Paging and filter options for [`RunService::list_runs`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListRunsRequest {
    pub page_size: Option<i64>,
    /// Opaque token from a previous page.
    pub page_token: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Short description of a run used in listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub state: RunState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub tags: BTreeMap<String, String>,
    pub name: Option<String>,
}

impl From<&WorkflowRun> for RunSummary {
    fn from(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.id.clone(),
            state: run.state,
            start_time: run.start_time,
            end_time: run.end_time,
            tags: run.tags.clone(),
            name: run.workflow_engine_parameters.get(NAME_PARAM).cloned(),
        }
    }
}

/// One page of runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunPage {
    pub runs: Vec<RunSummary>,
    /// Token for the next page. `None` on the last page.
    pub next_page_token: Option<String>,
}

/// Full run record with its task logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunDetails {
    pub run: WorkflowRun,
    pub task_logs: Vec<TaskLog>,
}

/// Run operations backed by a [`RunStore`].
pub struct RunService {
    store: Arc<dyn RunStore>,
    workflow_type_versions: BTreeMap<WorkflowType, Vec<String>>,
}

impl RunService {
    /// `workflow_type_versions` lists the accepted versions per language. A
    /// language missing from the map is rejected; an empty list accepts any
    /// version.
    pub fn new(
        store: Arc<dyn RunStore>,
        workflow_type_versions: BTreeMap<WorkflowType, Vec<String>>,
    ) -> Self {
        Self {
            store,
            workflow_type_versions,
        }
    }

    /// Validate and record a new QUEUED run. Returns the run id.
    pub async fn create_run(&self, mut request: NewRun) -> Result<String> {
        let workflow_type: WorkflowType = request
            .workflow_type
            .parse()
            .map_err(RunServiceError::UnsupportedWorkflowType)?;
        let supported = self
            .workflow_type_versions
            .get(&workflow_type)
            .ok_or_else(|| {
                RunServiceError::UnsupportedWorkflowType(request.workflow_type.clone())
            })?;
        if !supported.is_empty() && !supported.contains(&request.workflow_type_version) {
            return Err(RunServiceError::UnsupportedWorkflowVersion {
                workflow_type,
                version: request.workflow_type_version,
                supported: supported.join(", "),
            });
        }

        request.workflow_type = workflow_type.as_str().to_string();
        if let Some(name) = request.workflow_engine_parameters.get(NAME_PARAM) {
            request
                .tags
                .entry(NAME_TAG.to_string())
                .or_insert_with(|| name.clone());
        }

        let run = WorkflowRun::queued(request, Utc::now());
        self.store.create_run(&run).await?;
        info!(
            run_id = %run.id,
            workflow_type = %run.workflow_type,
            workflow_url = %run.workflow_url,
            "Workflow run created"
        );
        Ok(run.id)
    }

    /// Newest-first page of runs.
    pub async fn list_runs(&self, request: ListRunsRequest) -> Result<RunPage> {
        let page_size = request
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = match request.page_token.as_deref() {
            None | Some("") => 0,
            Some(token) => token
                .parse::<i64>()
                .ok()
                .filter(|offset| *offset >= 0)
                .ok_or_else(|| RunServiceError::InvalidPageToken(token.to_string()))?,
        };

        let filter = RunFilter {
            user_id: request.user_id,
            tags: request.tags,
        };
        let mut runs = self.store.list_runs(&filter, offset, page_size + 1).await?;

        let has_more = runs.len() as i64 > page_size;
        runs.truncate(page_size as usize);

        Ok(RunPage {
            runs: runs.iter().map(RunSummary::from).collect(),
            next_page_token: has_more.then(|| (offset + page_size).to_string()),
        })
    }

    /// A run with its task logs. `user_id`, when given, must own the run.
    pub async fn get_run(&self, run_id: &str, user_id: Option<&str>) -> Result<RunDetails> {
        let run = self.authorized_run(run_id, user_id).await?;
        let task_logs = self.store.get_task_logs(run_id).await?;
        Ok(RunDetails { run, task_logs })
    }

    /// Current state of a run.
    pub async fn get_status(&self, run_id: &str, user_id: Option<&str>) -> Result<RunState> {
        Ok(self.authorized_run(run_id, user_id).await?.state)
    }

    /// Request cancellation. The monitor stops the backend run and moves it
    /// to CANCELED. Repeating the request is accepted.
    pub async fn cancel_run(&self, run_id: &str, user_id: Option<&str>) -> Result<String> {
        self.authorized_run(run_id, user_id).await?;

        match self.store.request_cancel(run_id).await {
            Ok(CancelRequest::Requested(run)) => {
                info!(run_id = %run_id, "Cancellation requested");
                Ok(run.id)
            }
            Ok(CancelRequest::AlreadyCanceling) => Ok(run_id.to_string()),
            Ok(CancelRequest::AlreadyTerminal(state)) => {
                Err(RunServiceError::CannotCancel { state })
            }
            Err(CoreError::RunNotFound { run_id }) => Err(RunServiceError::NotFound { run_id }),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of runs in every state.
    pub async fn system_state_counts(&self) -> Result<BTreeMap<RunState, i64>> {
        Ok(self.store.count_by_state().await?)
    }

    async fn authorized_run(&self, run_id: &str, user_id: Option<&str>) -> Result<WorkflowRun> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| RunServiceError::NotFound {
                run_id: run_id.to_string(),
            })?;

        match user_id {
            Some(user) if run.user_id.as_deref() != Some(user) => Err(RunServiceError::Forbidden {
                run_id: run_id.to_string(),
            }),
            _ => Ok(run),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with_name(name: Option<&str>) -> WorkflowRun {
        let mut request = NewRun {
            workflow_type: "CWL".to_string(),
            workflow_type_version: "v1.2".to_string(),
            workflow_url: "https://example.org/wf.cwl".to_string(),
            ..Default::default()
        };
        if let Some(name) = name {
            request
                .workflow_engine_parameters
                .insert("name".to_string(), name.to_string());
        }
        WorkflowRun::queued(request, Utc::now())
    }

    #[test]
    fn test_summary_takes_name_from_engine_parameters() {
        let run = run_with_name(Some("nightly"));
        let summary = RunSummary::from(&run);
        assert_eq!(summary.run_id, run.id);
        assert_eq!(summary.state, RunState::Queued);
        assert_eq!(summary.name.as_deref(), Some("nightly"));

        assert_eq!(RunSummary::from(&run_with_name(None)).name, None);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            RunServiceError::UnsupportedWorkflowType("NEXTFLOW".to_string()).status_code(),
            400
        );
        assert_eq!(
            RunServiceError::CannotCancel {
                state: RunState::Complete
            }
            .status_code(),
            400
        );
        assert_eq!(
            RunServiceError::Forbidden {
                run_id: "r".to_string()
            }
            .status_code(),
            403
        );
        assert_eq!(
            RunServiceError::NotFound {
                run_id: "r".to_string()
            }
            .status_code(),
            404
        );
    }
}
