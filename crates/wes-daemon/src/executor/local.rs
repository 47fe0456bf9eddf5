// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local stub executor.
//!
//! Simulates a workflow without running anything: every poll advances the
//! run by one step (download inputs, process workflow, upload outputs) and
//! the poll after the last step reports COMPLETE with placeholder outputs.
//! Execution state lives in memory only and is dropped once the terminal
//! state has been reported or a cancel has been confirmed.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use wes_core::{NewTaskLog, Outputs, RunState, WorkflowRun};

use super::traits::*;

/// Number of simulated steps before a run completes.
pub const STEP_COUNT: usize = 3;

#[derive(Debug, Clone)]
struct LocalExecution {
    run_id: String,
    steps_done: usize,
    tasks: Vec<NewTaskLog>,
}

/// Local stub executor.
pub struct LocalExecutor {
    executions: Arc<Mutex<HashMap<String, LocalExecution>>>,
    /// If true, every submission fails.
    pub fail_submission: bool,
    /// Step index (0-based) at which runs fail with EXECUTOR_ERROR.
    pub fail_at_step: Option<usize>,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalExecutor {
    /// Create a new local executor.
    pub fn new() -> Self {
        Self {
            executions: Arc::new(Mutex::new(HashMap::new())),
            fail_submission: false,
            fail_at_step: None,
        }
    }

    /// Create a local executor that rejects every submission.
    pub fn failing_submission() -> Self {
        Self {
            fail_submission: true,
            ..Self::new()
        }
    }

    /// Create a local executor whose runs fail at the given step.
    pub fn failing_at(step: usize) -> Self {
        Self {
            fail_at_step: Some(step),
            ..Self::new()
        }
    }

    /// Number of executions currently tracked.
    pub async fn tracked(&self) -> usize {
        self.executions.lock().await.len()
    }

    fn handle_for(run_id: &str) -> String {
        format!("local-{}", run_id)
    }

    fn step_task(run: &WorkflowRun, step: usize) -> NewTaskLog {
        let (name, cmd) = match step {
            0 => ("Download inputs", vec!["wget".to_string(), run.workflow_url.clone()]),
            1 => (
                "Process workflow",
                vec![
                    run.workflow_type.to_lowercase(),
                    "run".to_string(),
                    "workflow.cwl".to_string(),
                ],
            ),
            _ => (
                "Upload outputs",
                vec![
                    "aws".to_string(),
                    "s3".to_string(),
                    "cp".to_string(),
                    "outputs/".to_string(),
                    "s3://bucket/".to_string(),
                ],
            ),
        };
        NewTaskLog {
            id: Some(format!("{}-step-{}", run.id, step + 1)),
            name: name.to_string(),
            cmd,
            ..Default::default()
        }
    }

    fn outputs_for(run_id: &str) -> Outputs {
        let mut outputs = Outputs::new();
        outputs.insert(
            "output_file".to_string(),
            json!(format!("s3://bucket/runs/{}/output.txt", run_id)),
        );
        outputs.insert(
            "metrics".to_string(),
            json!({"duration_seconds": 6, "tasks_completed": STEP_COUNT}),
        );
        outputs
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn executor_type(&self) -> &'static str {
        "local"
    }

    async fn submit(&self, run: &WorkflowRun) -> Result<Submission> {
        if self.fail_submission {
            return Err(ExecutorError::Transient(
                "Simulated submission failure".to_string(),
            ));
        }

        let handle = Self::handle_for(&run.id);
        let mut executions = self.executions.lock().await;
        executions.insert(
            handle.clone(),
            LocalExecution {
                run_id: run.id.clone(),
                steps_done: 0,
                tasks: Vec::new(),
            },
        );

        Ok(Submission {
            handle,
            state: RunState::Running,
            logs: vec![format!("Started execution at {}", Utc::now().to_rfc3339())],
        })
    }

    async fn poll_status(&self, run: &WorkflowRun, handle: &str) -> Result<StatusReport> {
        let mut executions = self.executions.lock().await;
        let Some(execution) = executions.get_mut(handle) else {
            let mut report = StatusReport::new(RunState::SystemError, "LOST");
            report
                .logs
                .push(format!("No local execution found for handle {}", handle));
            return Ok(report);
        };

        let now = Utc::now();
        if execution.steps_done >= STEP_COUNT {
            let mut report = StatusReport::new(RunState::Complete, "COMPLETE");
            report.outputs = Some(Self::outputs_for(&execution.run_id));
            report.task_logs = Some(execution.tasks.clone());
            report.exit_code = Some(0);
            report
                .logs
                .push(format!("Completed execution at {}", now.to_rfc3339()));
            executions.remove(handle);
            return Ok(report);
        }

        let step = execution.steps_done;
        let mut task = Self::step_task(run, step);
        task.start_time = Some(now);
        task.end_time = Some(now);

        if self.fail_at_step == Some(step) {
            task.exit_code = Some(1);
            task.system_logs.push("Simulated task failure".to_string());
            execution.tasks.push(task.clone());

            let mut report = StatusReport::new(RunState::ExecutorError, "FAILED");
            report.task_logs = Some(execution.tasks.clone());
            report.exit_code = Some(1);
            report
                .logs
                .push(format!("Execution error: step '{}' failed", task.name));
            executions.remove(handle);
            return Ok(report);
        }

        task.exit_code = Some(0);
        execution.tasks.push(task);
        execution.steps_done += 1;

        let mut report = StatusReport::new(RunState::Running, "RUNNING");
        report.task_logs = Some(execution.tasks.clone());
        Ok(report)
    }

    async fn cancel(&self, _run: &WorkflowRun, handle: &str) -> Result<CancelOutcome> {
        let mut executions = self.executions.lock().await;
        match executions.remove(handle) {
            Some(_) => Ok(CancelOutcome::Confirmed),
            None => Ok(CancelOutcome::Unconfirmed(format!(
                "No local execution found for handle {}",
                handle
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wes_core::NewRun;

    fn run() -> WorkflowRun {
        WorkflowRun::queued(
            NewRun {
                workflow_type: "CWL".to_string(),
                workflow_type_version: "v1.0".to_string(),
                workflow_url: "https://example.org/wf.cwl".to_string(),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let executor = LocalExecutor::new();
        let run = run();

        let submission = executor.submit(&run).await.unwrap();
        assert_eq!(submission.state, RunState::Running);
        assert_eq!(submission.handle, format!("local-{}", run.id));

        for step in 1..=STEP_COUNT {
            let report = executor.poll_status(&run, &submission.handle).await.unwrap();
            assert_eq!(report.state, RunState::Running);
            assert_eq!(report.task_logs.as_ref().unwrap().len(), step);
        }

        let report = executor.poll_status(&run, &submission.handle).await.unwrap();
        assert_eq!(report.state, RunState::Complete);
        let outputs = report.outputs.unwrap();
        assert_eq!(
            outputs["output_file"],
            json!(format!("s3://bucket/runs/{}/output.txt", run.id))
        );
        assert_eq!(outputs["metrics"]["tasks_completed"], json!(3));

        let tasks = report.task_logs.unwrap();
        let names: Vec<_> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["Download inputs", "Process workflow", "Upload outputs"]);
        assert_eq!(tasks[0].cmd, ["wget", "https://example.org/wf.cwl"]);
        assert_eq!(tasks[1].cmd, ["cwl", "run", "workflow.cwl"]);
        assert!(tasks.iter().all(|t| t.exit_code == Some(0) && t.end_time.is_some()));
        assert_eq!(executor.tracked().await, 0);
    }

    #[tokio::test]
    async fn test_failing_submission() {
        let executor = LocalExecutor::failing_submission();
        let err = executor.submit(&run()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Transient(_)));
        assert_eq!(executor.tracked().await, 0);
    }

    #[tokio::test]
    async fn test_failing_step() {
        let executor = LocalExecutor::failing_at(1);
        let run = run();
        let submission = executor.submit(&run).await.unwrap();

        let first = executor.poll_status(&run, &submission.handle).await.unwrap();
        assert_eq!(first.state, RunState::Running);

        let second = executor.poll_status(&run, &submission.handle).await.unwrap();
        assert_eq!(second.state, RunState::ExecutorError);
        assert_eq!(second.exit_code, Some(1));
        assert_eq!(second.task_logs.unwrap()[1].exit_code, Some(1));
        assert_eq!(executor.tracked().await, 0);
    }

    #[tokio::test]
    async fn test_cancel() {
        let executor = LocalExecutor::new();
        let run = run();
        let submission = executor.submit(&run).await.unwrap();

        assert_eq!(executor.tracked().await, 1);

        let outcome = executor.cancel(&run, &submission.handle).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Confirmed);
        assert_eq!(executor.tracked().await, 0);

        let again = executor.cancel(&run, &submission.handle).await.unwrap();
        assert!(matches!(again, CancelOutcome::Unconfirmed(_)));
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let executor = LocalExecutor::new();
        let run = run();

        let outcome = executor.cancel(&run, "local-missing").await.unwrap();
        assert!(matches!(outcome, CancelOutcome::Unconfirmed(_)));

        let report = executor.poll_status(&run, "local-missing").await.unwrap();
        assert_eq!(report.state, RunState::SystemError);
        assert_eq!(report.logs.len(), 1);
    }
}
