// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Seven Bridges (Velsera) executor.
//!
//! Runs become platform tasks created and started in one call
//! (`POST /tasks?action=run`). The workflow URL is the app id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use url::Url;
use wes_core::{NewTaskLog, RunState, WorkflowRun};

use super::traits::*;
use crate::config::SevenBridgesConfig;

const AUTH_HEADER: &str = "X-SBG-Auth-Token";

#[derive(Debug, Clone, Deserialize)]
struct Task {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    outputs: Option<Map<String, Value>>,
    #[serde(default)]
    errors: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct ExecutionDetails {
    #[serde(default)]
    jobs: Vec<Job>,
}

#[derive(Debug, Clone, Deserialize)]
struct Job {
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    command_line: Option<String>,
}

/// Map a Seven Bridges task status to a WES state.
pub fn map_status(status: &str) -> Option<RunState> {
    match status {
        "DRAFT" | "CREATING" | "QUEUED" => Some(RunState::Initializing),
        "RUNNING" => Some(RunState::Running),
        "COMPLETED" => Some(RunState::Complete),
        "FAILED" => Some(RunState::ExecutorError),
        "ABORTED" => Some(RunState::Canceled),
        _ => None,
    }
}

/// Seven Bridges executor.
pub struct SevenBridgesExecutor {
    http: reqwest::Client,
    endpoint: Url,
    api_token: String,
    project: String,
}

impl SevenBridgesExecutor {
    /// Create an executor from configuration.
    pub fn new(config: &SevenBridgesConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            ExecutorError::Config(format!(
                "Invalid SEVENBRIDGES_API_ENDPOINT {}: {}",
                config.endpoint, e
            ))
        })?;
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
            api_token: config.api_token.clone(),
            project: config.project.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ExecutorError::Config("Seven Bridges endpoint cannot carry a path".to_string())
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<T> {
        debug!(method = %method, url = %url, "Sending Seven Bridges request");
        let mut request = self
            .http
            .request(method, url)
            .header(AUTH_HEADER, &self.api_token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                ExecutorError::Transient(e.to_string())
            } else {
                ExecutorError::Http(e)
            }
        })?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ExecutorError::from_status(status, text));
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn task_logs(&self, task_id: &str) -> Result<Vec<NewTaskLog>> {
        let url = self.url(&["tasks", task_id, "execution_details"])?;
        let details: ExecutionDetails = self.call(Method::GET, url, None).await?;
        Ok(details
            .jobs
            .into_iter()
            .map(|job| {
                let status = job.status.unwrap_or_else(|| "UNKNOWN".to_string());
                NewTaskLog {
                    id: Some(format!("{}-{}", task_id, job.name)),
                    exit_code: match status.as_str() {
                        "COMPLETED" => Some(0),
                        "FAILED" => Some(1),
                        _ => None,
                    },
                    name: job.name,
                    cmd: job.command_line.into_iter().collect(),
                    start_time: job.start_time,
                    end_time: job.end_time,
                    system_logs: vec![format!("Seven Bridges job status: {}", status)],
                    ..Default::default()
                }
            })
            .collect())
    }
}

#[async_trait]
impl Executor for SevenBridgesExecutor {
    fn executor_type(&self) -> &'static str {
        "sevenbridges"
    }

    async fn submit(&self, run: &WorkflowRun) -> Result<Submission> {
        if run.workflow_url.trim().is_empty() {
            return Err(ExecutorError::InvalidRequest(
                "Seven Bridges runs need an app id in workflow_url".to_string(),
            ));
        }

        let inputs = match &run.workflow_params {
            Value::Object(params) => Value::Object(params.clone()),
            _ => json!({}),
        };
        let body = json!({
            "name": format!("WES-{}", run.id),
            "description": format!("Workflow run {}", run.id),
            "project": self.project,
            "app": run.workflow_url,
            "inputs": inputs,
        });

        let mut url = self.url(&["tasks"])?;
        url.query_pairs_mut().append_pair("action", "run");
        let task: Task = self.call(Method::POST, url, Some(body)).await?;
        info!(
            run_id = %run.id,
            task_id = %task.id,
            status = %task.status,
            "Submitted Seven Bridges task"
        );

        let state = match map_status(&task.status) {
            Some(RunState::Running) => RunState::Running,
            _ => RunState::Initializing,
        };
        Ok(Submission {
            logs: vec![format!("Submitted Seven Bridges task: {}", task.id)],
            handle: task.id,
            state,
        })
    }

    async fn poll_status(&self, run: &WorkflowRun, handle: &str) -> Result<StatusReport> {
        let url = self.url(&["tasks", handle])?;
        let task: Task = self.call(Method::GET, url, None).await?;

        let Some(state) = map_status(&task.status) else {
            let mut report = StatusReport::new(RunState::SystemError, task.status.clone());
            report
                .logs
                .push(format!("Unknown Seven Bridges task status: {}", task.status));
            return Ok(report);
        };

        let mut report = StatusReport::new(state, task.status.clone());
        match self.task_logs(handle).await {
            Ok(tasks) if !tasks.is_empty() => report.task_logs = Some(tasks),
            Ok(_) => {}
            Err(e) => {
                warn!(
                    run_id = %run.id,
                    task_id = %handle,
                    error = %e,
                    "Could not get execution details"
                );
            }
        }

        match state {
            RunState::Complete => {
                report.exit_code = Some(0);
                report.outputs = Some(task.outputs.unwrap_or_default());
            }
            RunState::ExecutorError => {
                report.exit_code = Some(1);
                for error in &task.errors {
                    let message = error
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| error.to_string());
                    report.logs.push(format!("Seven Bridges error: {}", message));
                }
            }
            _ => {}
        }

        Ok(report)
    }

    async fn cancel(&self, run: &WorkflowRun, handle: &str) -> Result<CancelOutcome> {
        let url = self.url(&["tasks", handle, "actions", "abort"])?;
        match self.call::<Value>(Method::POST, url, None).await {
            Ok(_) => {
                info!(run_id = %run.id, task_id = %handle, "Seven Bridges task aborted");
                Ok(CancelOutcome::Confirmed)
            }
            Err(ExecutorError::Rejected { status, message }) => Ok(CancelOutcome::Unconfirmed(
                format!("Seven Bridges refused abort ({}): {}", status, message),
            )),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wes_core::NewRun;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn executor(server: &MockServer) -> SevenBridgesExecutor {
        SevenBridgesExecutor::new(&SevenBridgesConfig {
            api_token: "sbg-token".to_string(),
            endpoint: format!("{}/v2", server.uri()),
            project: "lab/rnaseq".to_string(),
        })
        .unwrap()
    }

    fn run() -> WorkflowRun {
        WorkflowRun::queued(
            NewRun {
                workflow_type: "CWL".to_string(),
                workflow_type_version: "v1.0".to_string(),
                workflow_url: "admin/sbg-public-data/rna-seq-alignment".to_string(),
                workflow_params: json!({"reads": "s3://in/r.fq"}),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status("QUEUED"), Some(RunState::Initializing));
        assert_eq!(map_status("RUNNING"), Some(RunState::Running));
        assert_eq!(map_status("COMPLETED"), Some(RunState::Complete));
        assert_eq!(map_status("FAILED"), Some(RunState::ExecutorError));
        assert_eq!(map_status("ABORTED"), Some(RunState::Canceled));
        assert_eq!(map_status("HIBERNATING"), None);
    }

    #[tokio::test]
    async fn test_submit_creates_and_runs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/tasks"))
            .and(query_param("action", "run"))
            .and(header("X-SBG-Auth-Token", "sbg-token"))
            .and(body_partial_json(json!({
                "project": "lab/rnaseq",
                "app": "admin/sbg-public-data/rna-seq-alignment",
                "inputs": {"reads": "s3://in/r.fq"},
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "task-1",
                "status": "QUEUED",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let submission = executor(&server).submit(&run()).await.unwrap();
        assert_eq!(submission.handle, "task-1");
        assert_eq!(submission.state, RunState::Initializing);
    }

    #[tokio::test]
    async fn test_poll_completed_with_jobs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/tasks/task-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "task-1",
                "status": "COMPLETED",
                "outputs": {"bam": {"class": "File", "path": "file-1", "name": "out.bam"}},
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/tasks/task-1/execution_details"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobs": [{
                    "name": "align",
                    "status": "COMPLETED",
                    "command_line": "bwa mem ref.fa r.fq",
                    "start_time": "2025-03-01T10:00:00Z",
                    "end_time": "2025-03-01T10:05:00Z",
                }]
            })))
            .mount(&server)
            .await;

        let report = executor(&server).poll_status(&run(), "task-1").await.unwrap();
        assert_eq!(report.state, RunState::Complete);
        assert_eq!(report.outputs.unwrap()["bam"]["name"], json!("out.bam"));
        let tasks = report.task_logs.unwrap();
        assert_eq!(tasks[0].name, "align");
        assert_eq!(tasks[0].cmd, ["bwa mem ref.fa r.fq"]);
        assert_eq!(tasks[0].exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_poll_failed_without_details() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/tasks/task-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "task-2",
                "status": "FAILED",
                "errors": [{"message": "Insufficient funds"}],
            })))
            .mount(&server)
            .await;

        let report = executor(&server).poll_status(&run(), "task-2").await.unwrap();
        assert_eq!(report.state, RunState::ExecutorError);
        assert_eq!(report.logs, vec!["Seven Bridges error: Insufficient funds"]);
        assert!(report.task_logs.is_none());
    }

    #[tokio::test]
    async fn test_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/tasks/task-1/actions/abort"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "task-1"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/tasks/task-9/actions/abort"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Task is not running"))
            .mount(&server)
            .await;

        let executor = executor(&server);
        assert_eq!(
            executor.cancel(&run(), "task-1").await.unwrap(),
            CancelOutcome::Confirmed
        );
        assert!(matches!(
            executor.cancel(&run(), "task-9").await.unwrap(),
            CancelOutcome::Unconfirmed(_)
        ));
    }
}
