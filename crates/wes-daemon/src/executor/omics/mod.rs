// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AWS HealthOmics executor.
//!
//! Runs are started with StartRun and tracked by their Omics run id. On
//! completion the executor collects the output location, CloudWatch console
//! links for the run, task and manifest log streams, and the output
//! manifest written by Omics to `{outputUri}/{omics_run_id}/logs/outputs.json`.
//! A manifest that cannot be fetched never fails the run.

pub mod client;
pub mod sigv4;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use wes_core::{NewTaskLog, Outputs, RunState, WorkflowRun};

use crate::callback::StatusMapper;
use crate::config::OmicsConfig;
use crate::executor::params::{WORKFLOW_ID_PARAM, convert_params};
use crate::executor::traits::*;

pub use client::{OmicsClient, RunDetail, TaskSummary};
pub use sigv4::Credentials;

/// Prefix marking a workflow URL as an Omics workflow reference.
pub const WORKFLOW_URL_PREFIX: &str = "omics:";

/// Engine parameters forwarded to StartRun unchanged.
const PASSTHROUGH_PARAMS: &[&str] = &[
    "runGroupId",
    "cacheId",
    "priority",
    "storageCapacity",
    "accelerators",
    "logLevel",
    "storageType",
];

/// Map a HealthOmics run status to a WES state.
pub fn map_status(status: &str) -> Option<RunState> {
    match status {
        "COMPLETED" => Some(RunState::Complete),
        "FAILED" => Some(RunState::ExecutorError),
        "CANCELLED" | "CANCELLED_RUNNING" | "CANCELLED_STARTING" => Some(RunState::Canceled),
        "PENDING" | "QUEUED" | "STARTING" | "RUNNING" | "STOPPING" | "TERMINATING" => {
            Some(RunState::Running)
        }
        _ => None,
    }
}

/// Status mapping for HealthOmics state-change events.
#[derive(Debug, Clone, Copy, Default)]
pub struct OmicsEventMapper;

impl StatusMapper for OmicsEventMapper {
    fn backend_name(&self) -> &'static str {
        "Omics"
    }

    fn map_status(&self, status: &str) -> Option<RunState> {
        map_status(status)
    }
}

/// Resolve the Omics workflow id of a run.
///
/// An `omics:<id>` workflow URL wins, then a `workflow_id` parameter, then
/// the workflow URL itself.
pub fn extract_workflow_id(run: &WorkflowRun) -> Result<String> {
    if let Some(rest) = run.workflow_url.strip_prefix(WORKFLOW_URL_PREFIX) {
        let id = rest.rsplit(':').next().unwrap_or(rest);
        if !id.is_empty() {
            return Ok(id.to_string());
        }
    }

    if let Some(id) = run.workflow_params.get(WORKFLOW_ID_PARAM) {
        match id {
            Value::String(s) if !s.is_empty() => return Ok(s.clone()),
            Value::Number(n) => return Ok(n.to_string()),
            _ => {}
        }
    }

    if run.workflow_url.trim().is_empty() {
        return Err(ExecutorError::InvalidRequest(
            "No Omics workflow id in workflow_url or workflow_params".to_string(),
        ));
    }
    Ok(run.workflow_url.clone())
}

/// Output location for a run: the `outputUri` engine parameter, or
/// `{bucket}/runs/{run_id}/output/`.
pub fn output_uri_for(run: &WorkflowRun, output_bucket: &str) -> String {
    if let Some(uri) = run.workflow_engine_parameters.get("outputUri") {
        return uri.clone();
    }
    let base = if output_bucket.starts_with("s3://") {
        output_bucket.to_string()
    } else {
        format!("s3://{}", output_bucket)
    };
    format!("{}/runs/{}/output/", base.trim_end_matches('/'), run.id)
}

/// Engine parameter values are strings; numbers, booleans and JSON
/// documents are forwarded with their JSON type.
fn engine_value(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw)
        .ok()
        .filter(|v| !v.is_string())
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

/// Build the StartRun request document for `run`.
pub fn build_start_run_request(
    run: &WorkflowRun,
    workflow_id: &str,
    role_arn: &str,
    output_uri: &str,
) -> Value {
    let mut body = Map::new();
    body.insert("workflowId".to_string(), json!(workflow_id));
    body.insert("roleArn".to_string(), json!(role_arn));
    body.insert(
        "parameters".to_string(),
        Value::Object(convert_params(&run.workflow_params, run.workflow_kind())),
    );
    body.insert("outputUri".to_string(), json!(output_uri));
    body.insert("name".to_string(), json!(format!("wes-run-{}", run.id)));
    body.insert("retentionMode".to_string(), json!("REMOVE"));
    body.insert("storageType".to_string(), json!("DYNAMIC"));
    // Idempotency token; a retried submission of the same run starts nothing new.
    body.insert("requestId".to_string(), json!(run.id));

    if !run.tags.is_empty() {
        body.insert("tags".to_string(), json!(run.tags));
        if let Some(name) = run.tags.get("Name") {
            body.insert("name".to_string(), json!(name));
        }
    }

    let engine = &run.workflow_engine_parameters;
    if let Some(name) = engine.get("name") {
        body.insert("name".to_string(), json!(name));
    }
    if let Some(tags) = engine.get("tags") {
        body.insert("tags".to_string(), engine_value(tags));
    }
    for key in PASSTHROUGH_PARAMS {
        if let Some(value) = engine.get(*key) {
            body.insert(key.to_string(), engine_value(value));
        }
    }

    Value::Object(body)
}

/// CloudWatch console URL for a log stream.
pub fn cloudwatch_url(region: &str, log_group: &str, log_stream: &str) -> String {
    format!(
        "https://{region}.console.aws.amazon.com/cloudwatch/home?region={region}\
         #logsV2:log-groups/log-group/{}/log-events/{}",
        log_group.replace('/', "%2F"),
        log_stream.replace('/', "%2F"),
    )
}

/// Region, log group and stream of a CloudWatch log stream ARN
/// (`arn:aws:logs:<region>:<account>:log-group:<group>:log-stream:<stream>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStreamArn {
    pub region: String,
    pub log_group: String,
    pub log_stream: String,
}

impl LogStreamArn {
    pub fn parse(arn: &str) -> Option<Self> {
        if !arn.starts_with("arn:aws:logs:") {
            return None;
        }
        let (head, log_stream) = arn.split_once(":log-stream:")?;
        let parts: Vec<&str> = head.split(':').collect();
        if parts.len() < 7 || parts[5] != "log-group" {
            return None;
        }
        Some(Self {
            region: parts[3].to_string(),
            log_group: parts[6..].join(":"),
            log_stream: log_stream.to_string(),
        })
    }

    /// Console URL of the run log stream.
    pub fn run_log_url(&self) -> String {
        cloudwatch_url(&self.region, &self.log_group, &self.log_stream)
    }

    /// Console URL of a sibling stream in the same log group.
    pub fn stream_url(&self, stream: &str) -> String {
        cloudwatch_url(&self.region, &self.log_group, stream)
    }
}

/// Log links for a run: run log, manifest log and task log streams.
pub fn log_urls(
    arn: &LogStreamArn,
    omics_run_id: &str,
    tasks: &[TaskSummary],
) -> Map<String, Value> {
    let task_links: Map<String, Value> = tasks
        .iter()
        .map(|task| {
            let name = task.name.clone().unwrap_or_else(|| task.task_id.clone());
            (name, json!(task_log_url(arn, omics_run_id, &task.task_id)))
        })
        .collect();

    let mut urls = Map::new();
    urls.insert("run_log".to_string(), json!(arn.run_log_url()));
    urls.insert(
        "manifest_log".to_string(),
        json!(arn.stream_url(&format!("manifest/run/{}", omics_run_id))),
    );
    urls.insert("task_logs".to_string(), Value::Object(task_links));
    urls.insert("log_group".to_string(), json!(arn.log_group));
    urls.insert("log_stream".to_string(), json!(arn.log_stream));
    urls
}

fn task_log_url(arn: &LogStreamArn, omics_run_id: &str, task_id: &str) -> String {
    arn.stream_url(&format!("run/{}/task/{}", omics_run_id, task_id))
}

/// Normalize an Omics output manifest into `output name -> location(s)`.
///
/// `{"location": ...}` entries become the location string, lists of such
/// entries become lists of strings, and anything else is stringified.
/// Returns `None` when the manifest is not a JSON object.
pub fn normalize_manifest(manifest: Value) -> Option<Map<String, Value>> {
    let Value::Object(entries) = manifest else {
        return None;
    };

    let location = |value: &Value| value.get("location").cloned();
    Some(
        entries
            .into_iter()
            .map(|(key, value)| {
                let normalized = match &value {
                    Value::Object(_) if location(&value).is_some() => {
                        location(&value).unwrap_or(Value::Null)
                    }
                    Value::Array(items)
                        if items.iter().all(|item| item.is_object() && location(item).is_some()) =>
                    {
                        Value::Array(items.iter().filter_map(location).collect())
                    }
                    Value::String(s) => Value::String(s.clone()),
                    other => Value::String(other.to_string()),
                };
                (key, normalized)
            })
            .collect(),
    )
}

/// Split `s3://bucket/key` into bucket and key.
pub fn split_s3_uri(uri: &str) -> Option<(&str, &str)> {
    let path = uri.strip_prefix("s3://")?;
    let (bucket, key) = path.split_once('/')?;
    if bucket.is_empty() {
        return None;
    }
    Some((bucket, key))
}

fn task_log(task: &TaskSummary, omics_run_id: &str, arn: Option<&LogStreamArn>) -> NewTaskLog {
    let status = task.status.clone().unwrap_or_else(|| "UNKNOWN".to_string());
    let exit_code = match status.as_str() {
        "COMPLETED" => Some(0),
        "FAILED" | "CANCELLED" => Some(1),
        _ => None,
    };
    NewTaskLog {
        id: Some(format!("omics-{}", task.task_id)),
        name: task.name.clone().unwrap_or_else(|| "Unknown task".to_string()),
        cmd: Vec::new(),
        start_time: task.start_time,
        end_time: task.stop_time,
        stdout_url: arn.map(|arn| task_log_url(arn, omics_run_id, &task.task_id)),
        stderr_url: None,
        exit_code,
        system_logs: vec![format!("Omics task status: {}", status)],
        tes_uri: None,
    }
}

/// HealthOmics executor.
pub struct OmicsExecutor {
    client: OmicsClient,
    role_arn: String,
    output_bucket: String,
}

impl OmicsExecutor {
    /// Create an executor from configuration.
    pub fn new(config: &OmicsConfig) -> Result<Self> {
        let credentials = Credentials {
            access_key_id: config.access_key_id.clone(),
            secret_access_key: config.secret_access_key.clone(),
            session_token: config.session_token.clone(),
        };
        let client = OmicsClient::new(
            credentials,
            &config.region,
            config.endpoint.as_deref(),
            config.s3_endpoint.as_deref(),
        )?;
        Ok(Self {
            client,
            role_arn: config.role_arn.clone(),
            output_bucket: config.output_bucket.clone(),
        })
    }

    /// Fetch and normalize the output manifest. Failures become log lines.
    async fn fetch_output_mapping(
        &self,
        output_uri: &str,
        omics_run_id: &str,
        logs: &mut Vec<String>,
    ) -> Option<Map<String, Value>> {
        let Some((bucket, prefix)) = split_s3_uri(output_uri) else {
            warn!(output_uri = %output_uri, "Output URI is not an S3 URI");
            return None;
        };
        let prefix = prefix.trim_end_matches('/');
        let key = if prefix.is_empty() {
            format!("{}/logs/outputs.json", omics_run_id)
        } else {
            format!("{}/{}/logs/outputs.json", prefix, omics_run_id)
        };

        match self.client.get_object(bucket, &key).await {
            Ok(Some(body)) => match serde_json::from_slice::<Value>(&body) {
                Ok(manifest) => {
                    let normalized = normalize_manifest(manifest);
                    if normalized.is_none() {
                        logs.push(format!(
                            "Output manifest s3://{}/{} is not a JSON object",
                            bucket, key
                        ));
                    }
                    normalized
                }
                Err(e) => {
                    warn!(
                        omics_run_id = %omics_run_id,
                        error = %e,
                        "Output manifest is not valid JSON"
                    );
                    logs.push(format!(
                        "Workflow completed but output manifest could not be parsed: {}",
                        e
                    ));
                    None
                }
            },
            Ok(None) => {
                warn!(omics_run_id = %omics_run_id, key = %key, "No output manifest found");
                logs.push(format!(
                    "Workflow completed but no output manifest was found at s3://{}/{}",
                    bucket, key
                ));
                None
            }
            Err(e) => {
                warn!(omics_run_id = %omics_run_id, error = %e, "Failed to fetch output manifest");
                logs.push(format!(
                    "Workflow completed but failed to retrieve outputs: {}",
                    e
                ));
                None
            }
        }
    }

    async fn completion_outputs(
        &self,
        run: &WorkflowRun,
        detail: &RunDetail,
        tasks: &[TaskSummary],
        report: &mut StatusReport,
    ) -> Outputs {
        let output_uri = detail
            .output_uri
            .clone()
            .unwrap_or_else(|| output_uri_for(run, &self.output_bucket));
        let output_location = detail.run_output_uri.clone().unwrap_or_else(|| {
            format!("{}/{}", output_uri.trim_end_matches('/'), detail.id)
        });

        let mut outputs = Outputs::new();
        outputs.insert("omics_run_id".to_string(), json!(detail.id));
        outputs.insert("output_location".to_string(), json!(output_location));

        let arn = detail
            .log_location
            .as_ref()
            .and_then(|location| location.run_log_stream.as_deref())
            .and_then(LogStreamArn::parse);
        if let Some(arn) = &arn {
            report.stdout_url = Some(arn.run_log_url());
            outputs.insert(
                "log_urls".to_string(),
                Value::Object(log_urls(arn, &detail.id, tasks)),
            );
        }

        if let Some(mapping) = self
            .fetch_output_mapping(&output_uri, &detail.id, &mut report.logs)
            .await
        {
            outputs.insert("output_mapping".to_string(), Value::Object(mapping));
        }

        outputs
    }
}

#[async_trait]
impl Executor for OmicsExecutor {
    fn executor_type(&self) -> &'static str {
        "omics"
    }

    async fn submit(&self, run: &WorkflowRun) -> Result<Submission> {
        let workflow_id = extract_workflow_id(run)?;
        let output_uri = output_uri_for(run, &self.output_bucket);
        let body = build_start_run_request(run, &workflow_id, &self.role_arn, &output_uri);

        debug!(run_id = %run.id, workflow_id = %workflow_id, "Starting Omics run");
        let response = self.client.start_run(&body).await?;
        info!(run_id = %run.id, omics_run_id = %response.id, "Started Omics run");

        Ok(Submission {
            logs: vec![
                format!("Using Omics workflow ID: {}", workflow_id),
                format!(
                    "Started AWS Omics run: {}, output will be in: {}",
                    response.id, output_uri
                ),
            ],
            handle: response.id,
            state: RunState::Running,
        })
    }

    async fn poll_status(&self, run: &WorkflowRun, handle: &str) -> Result<StatusReport> {
        let detail = self.client.get_run(handle).await?;

        let Some(state) = map_status(&detail.status) else {
            let mut report = StatusReport::new(RunState::SystemError, detail.status.clone());
            report
                .logs
                .push(format!("Unknown Omics status: {}", detail.status));
            return Ok(report);
        };

        let mut report = StatusReport::new(state, detail.status.clone());

        let tasks = match self.client.list_run_tasks(handle).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(
                    run_id = %run.id,
                    omics_run_id = %handle,
                    error = %e,
                    "Failed to list Omics tasks"
                );
                Vec::new()
            }
        };
        if !tasks.is_empty() {
            let arn = detail
                .log_location
                .as_ref()
                .and_then(|location| location.run_log_stream.as_deref())
                .and_then(LogStreamArn::parse);
            report.task_logs = Some(
                tasks
                    .iter()
                    .map(|task| task_log(task, handle, arn.as_ref()))
                    .collect(),
            );
        }

        match state {
            RunState::Complete => {
                report.exit_code = Some(0);
                let outputs = self
                    .completion_outputs(run, &detail, &tasks, &mut report)
                    .await;
                report.outputs = Some(outputs);
            }
            RunState::ExecutorError => {
                report.exit_code = Some(1);
                let reason = detail
                    .failure_reason
                    .clone()
                    .or_else(|| detail.status_message.clone())
                    .or_else(|| detail.message.clone())
                    .unwrap_or_else(|| "No error message".to_string());
                report.logs.push(format!("Omics workflow failed: {}", reason));
            }
            _ => {}
        }

        Ok(report)
    }

    async fn cancel(&self, run: &WorkflowRun, handle: &str) -> Result<CancelOutcome> {
        match self.client.cancel_run(handle).await {
            Ok(()) => {
                info!(run_id = %run.id, omics_run_id = %handle, "Omics run cancellation requested");
                Ok(CancelOutcome::Confirmed)
            }
            Err(ExecutorError::Rejected { status, message }) => Ok(CancelOutcome::Unconfirmed(
                format!("Omics refused cancellation ({}): {}", status, message),
            )),
            Err(e) => Err(e),
        }
    }
}
