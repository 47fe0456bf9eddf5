// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Arvados executor.
//!
//! Each run becomes one committed container request. CWL runs go through
//! `arvados-cwl-runner`; WDL runs through Cromwell. Cancellation lowers the
//! request priority to 0.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use url::Url;
use wes_core::{NewTaskLog, Outputs, RunState, WorkflowRun, WorkflowType};

use super::traits::*;
use crate::config::ArvadosConfig;

const GIB: u64 = 1024 * 1024 * 1024;
const DEFAULT_PRIORITY: u32 = 500;

#[derive(Debug, Clone, Deserialize)]
struct ContainerRequest {
    uuid: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    container_uuid: Option<String>,
    #[serde(default)]
    output_uuid: Option<String>,
    #[serde(default)]
    log_uuid: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
struct Container {
    uuid: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    exit_code: Option<i32>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,
}

/// Map a container request and its container to a WES state and exit code.
///
/// Returns `None` for request states Arvados does not define.
fn map_state(
    request: &ContainerRequest,
    container: Option<&Container>,
) -> Option<(RunState, Option<i32>)> {
    match request.state.as_str() {
        "Final" => Some(match container {
            Some(c) if c.state == "Complete" && c.exit_code == Some(0) => {
                (RunState::Complete, Some(0))
            }
            Some(c) if c.state == "Cancelled" => (RunState::Canceled, c.exit_code),
            Some(c) => {
                let code = c.exit_code.filter(|code| *code != 0).unwrap_or(1);
                (RunState::ExecutorError, Some(code))
            }
            None => (RunState::SystemError, None),
        }),
        "Committed" => Some(match container.map(|c| c.state.as_str()) {
            Some("Running") | Some("Complete") | Some("Cancelled") => (RunState::Running, None),
            _ => (RunState::Initializing, None),
        }),
        "Uncommitted" => Some((RunState::Initializing, None)),
        _ => None,
    }
}

/// Arvados executor.
pub struct ArvadosExecutor {
    http: reqwest::Client,
    base_url: Url,
    api_host: String,
    api_token: String,
    project_uuid: String,
}

impl ArvadosExecutor {
    /// Create an executor from configuration.
    pub fn new(config: &ArvadosConfig) -> Result<Self> {
        let has_scheme =
            config.api_host.starts_with("http://") || config.api_host.starts_with("https://");
        let base = if has_scheme {
            config.api_host.clone()
        } else {
            format!("https://{}", config.api_host)
        };
        let base_url = Url::parse(&base).map_err(|e| {
            ExecutorError::Config(format!("Invalid ARVADOS_API_HOST {}: {}", base, e))
        })?;
        let api_host = base_url.host_str().unwrap_or_default().to_string();

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            api_host,
            api_token: config.api_token.clone(),
            project_uuid: config.project_uuid.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ExecutorError::Config("ARVADOS_API_HOST cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(["arvados", "v1"])
            .extend(segments);
        Ok(url)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<T> {
        debug!(method = %method, url = %url, "Sending Arvados request");
        let mut request = self.http.request(method, url).bearer_auth(&self.api_token);
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

    /// Build the container request body for `run`.
    fn container_request(&self, run: &WorkflowRun) -> Result<Value> {
        let kind = run.workflow_kind().ok_or_else(|| {
            ExecutorError::InvalidRequest(format!(
                "Unsupported workflow type for Arvados: {}",
                run.workflow_type
            ))
        })?;

        let mut properties = serde_json::Map::new();
        properties.insert("wes_run_id".to_string(), json!(run.id));
        for (key, value) in &run.tags {
            properties.insert(key.clone(), json!(value));
        }
        let inputs = serde_json::to_string(&run.workflow_params)?;

        let mut request = match kind {
            WorkflowType::Cwl => {
                let mut request = json!({
                    "container_image": "arvados/jobs:latest",
                    "cwd": "/var/spool/cwl",
                    "output_path": "/var/spool/cwl",
                    "runtime_constraints": {"vcpus": 1, "ram": GIB},
                    "mounts": {"/var/spool/cwl": {"kind": "tmp", "capacity": GIB}},
                    "environment": {"CWLINPUT": inputs, "WORKFLOW_URL": run.workflow_url},
                });
                if let Some(reference) = run.workflow_url.strip_prefix("arvados:") {
                    let (collection, path) = reference.split_once('/').unwrap_or((reference, ""));
                    request["mounts"]["/var/lib/cwl/workflow"] =
                        json!({"kind": "collection", "uuid": collection, "path": path});
                    request["command"] = json!([
                        "arvados-cwl-runner",
                        "--api=containers",
                        "--no-wait",
                        "/var/lib/cwl/workflow",
                        "/var/spool/cwl/cwl.input.json",
                    ]);
                } else {
                    request["command"] = json!([
                        "bash",
                        "-c",
                        "cd /var/spool/cwl && curl -L -o workflow.cwl \"$WORKFLOW_URL\" && \
                         printf '%s' \"$CWLINPUT\" > cwl.input.json && \
                         arvados-cwl-runner --api=containers --no-wait workflow.cwl cwl.input.json",
                    ]);
                }
                request
            }
            WorkflowType::Wdl => json!({
                "container_image": "broadinstitute/cromwell:latest",
                "cwd": "/var/spool/wdl",
                "output_path": "/var/spool/wdl/outputs",
                "runtime_constraints": {"vcpus": 2, "ram": 2 * GIB},
                "mounts": {"/var/spool/wdl": {"kind": "tmp", "capacity": 2 * GIB}},
                "environment": {"WDL_INPUTS": inputs, "WORKFLOW_URL": run.workflow_url},
                "command": [
                    "bash",
                    "-c",
                    "cd /var/spool/wdl && curl -L -o workflow.wdl \"$WORKFLOW_URL\" && \
                     printf '%s' \"$WDL_INPUTS\" > inputs.json && \
                     java -jar /app/cromwell.jar run workflow.wdl -i inputs.json",
                ],
            }),
        };

        request["name"] = json!(format!("WES-{}", run.id));
        request["description"] = json!(format!("Workflow run {}", run.id));
        request["properties"] = Value::Object(properties);
        request["state"] = json!("Committed");
        request["priority"] = json!(DEFAULT_PRIORITY);
        request["owner_uuid"] = json!(self.project_uuid);
        request["scheduling_parameters"] = json!({"preemptible": false});
        Ok(request)
    }

    fn task_logs(
        &self,
        request: &ContainerRequest,
        container: Option<&Container>,
    ) -> Vec<NewTaskLog> {
        let mut tasks = vec![NewTaskLog {
            id: Some(request.uuid.clone()),
            name: "container_request".to_string(),
            start_time: request.created_at,
            end_time: (request.state == "Final").then_some(request.modified_at).flatten(),
            system_logs: vec![format!("Arvados container request state: {}", request.state)],
            ..Default::default()
        }];
        if let Some(container) = container {
            tasks.push(NewTaskLog {
                id: Some(container.uuid.clone()),
                name: "container".to_string(),
                start_time: container.started_at,
                end_time: container.finished_at,
                exit_code: container.exit_code,
                stdout_url: Some(format!(
                    "https://{}/containers/{}/log",
                    self.api_host, container.uuid
                )),
                system_logs: vec![format!("Arvados container state: {}", container.state)],
                ..Default::default()
            });
        }
        tasks
    }
}

#[async_trait]
impl Executor for ArvadosExecutor {
    fn executor_type(&self) -> &'static str {
        "arvados"
    }

    async fn submit(&self, run: &WorkflowRun) -> Result<Submission> {
        let body = json!({"container_request": self.container_request(run)?});
        let url = self.url(&["container_requests"])?;
        let created: ContainerRequest = self.call(Method::POST, url, Some(body)).await?;
        info!(
            run_id = %run.id,
            container_request = %created.uuid,
            "Submitted Arvados container request"
        );

        Ok(Submission {
            logs: vec![format!("Submitted Arvados container request: {}", created.uuid)],
            handle: created.uuid,
            state: RunState::Initializing,
        })
    }

    async fn poll_status(&self, run: &WorkflowRun, handle: &str) -> Result<StatusReport> {
        let url = self.url(&["container_requests", handle])?;
        let request: ContainerRequest = self.call(Method::GET, url, None).await?;

        // A failed container fetch must not read as "no container"; the
        // monitor retries the whole poll next cycle.
        let container = match &request.container_uuid {
            Some(uuid) => {
                let url = self.url(&["containers", uuid])?;
                let container = self
                    .call::<Container>(Method::GET, url, None)
                    .await
                    .inspect_err(|e| {
                        warn!(
                            run_id = %run.id,
                            container = %uuid,
                            error = %e,
                            "Failed to fetch Arvados container"
                        );
                    })?;
                Some(container)
            }
            None => None,
        };

        let Some((state, exit_code)) = map_state(&request, container.as_ref()) else {
            let mut report = StatusReport::new(RunState::SystemError, request.state.clone());
            report.logs.push(format!(
                "Unknown Arvados container request state: {}",
                request.state
            ));
            return Ok(report);
        };

        let backend_status = match &container {
            Some(c) => format!("{}/{}", request.state, c.state),
            None => request.state.clone(),
        };
        let mut report = StatusReport::new(state, backend_status);
        report.exit_code = exit_code;
        report.task_logs = Some(self.task_logs(&request, container.as_ref()));

        if let Some(log_uuid) = &request.log_uuid {
            report.stdout_url = Some(format!("https://{}/collections/{}", self.api_host, log_uuid));
        }

        match state {
            RunState::Complete => {
                let mut outputs = Outputs::new();
                if let Some(output_uuid) = &request.output_uuid {
                    outputs.insert(
                        "output_collection".to_string(),
                        json!({
                            "uuid": output_uuid,
                            "url": format!("https://{}/collections/{}", self.api_host, output_uuid),
                        }),
                    );
                }
                report.outputs = Some(outputs);
            }
            RunState::ExecutorError => {
                report.logs.push(format!(
                    "Arvados container finished with exit code {}",
                    exit_code.unwrap_or(1)
                ));
            }
            RunState::SystemError => {
                report
                    .logs
                    .push("Arvados container request finalized without a container".to_string());
            }
            _ => {}
        }

        Ok(report)
    }

    async fn cancel(&self, run: &WorkflowRun, handle: &str) -> Result<CancelOutcome> {
        let url = self.url(&["container_requests", handle])?;
        let body = json!({"container_request": {"priority": 0}});
        match self.call::<ContainerRequest>(Method::PUT, url, Some(body)).await {
            Ok(_) => {
                info!(
                    run_id = %run.id,
                    container_request = %handle,
                    "Arvados container request priority set to 0"
                );
                Ok(CancelOutcome::Confirmed)
            }
            Err(ExecutorError::Rejected { status, message }) => Ok(CancelOutcome::Unconfirmed(
                format!("Arvados refused cancellation ({}): {}", status, message),
            )),
            Err(e) => Err(e),
        }
    }
}
