// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the workflow monitor: dispatch, reconciliation and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use wes_core::{NewTaskLog, RunState, RunStore};
use wes_daemon::executor::{Executor, LocalExecutor, StatusReport, local::STEP_COUNT};
use wes_daemon::monitor::{Monitor, MonitorConfig};
use wes_daemon::runs::RunService;

fn monitor(store: &Arc<dyn RunStore>, executor: Arc<dyn Executor>, max: usize) -> Monitor {
    Monitor::new(
        store.clone(),
        executor,
        MonitorConfig {
            poll_interval: Duration::from_millis(10),
            max_concurrent_runs: max,
        },
    )
}

#[tokio::test]
async fn test_dispatch_respects_concurrency_ceiling() {
    let store = test_store().await;
    for _ in 0..5 {
        queued_run(&store).await;
    }

    let monitor = monitor(&store, Arc::new(LocalExecutor::new()), 2);
    let report = monitor.run_once().await;
    assert_eq!(report.dispatched, 2);
    assert_eq!(store.count_active_runs().await.unwrap(), 2);

    // Slots stay occupied while the runs are active.
    let report = monitor.run_once().await;
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.polled, 2);

    let counts = store.count_by_state().await.unwrap();
    assert_eq!(counts[&RunState::Queued], 3);
    assert_eq!(counts[&RunState::Running], 2);
}

#[tokio::test]
async fn test_queued_run_starts_running() {
    let store = test_store().await;
    let run = queued_run(&store).await;

    let report = monitor(&store, Arc::new(LocalExecutor::new()), 10)
        .run_once()
        .await;
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.transitions, 1);

    let run = reload(&store, &run.id).await;
    assert_eq!(run.state, RunState::Running);
    assert!(run.start_time.is_some());
    assert!(run.end_time.is_none());
    assert!(run.outputs.is_none());
    assert_eq!(run.backend_run_id, Some(format!("local-{}", run.id)));
    assert!(
        run.system_logs
            .contains(&"Run state update: QUEUED -> RUNNING".to_string())
    );
    assert!(run.system_logs.iter().any(|l| l.starts_with("Started execution at")));
}

#[tokio::test]
async fn test_local_run_completes_with_outputs_and_tasks() {
    let store = test_store().await;
    let run = queued_run(&store).await;
    let executor = Arc::new(LocalExecutor::new());
    let monitor = monitor(&store, executor.clone(), 10);

    // Submit, one poll per step, then the completing poll.
    for _ in 0..STEP_COUNT + 2 {
        monitor.run_once().await;
    }

    let run = reload(&store, &run.id).await;
    assert_eq!(run.state, RunState::Complete);
    assert_eq!(run.exit_code, Some(0));
    assert_end_time_invariant(&run);

    let outputs = run.outputs.as_ref().unwrap();
    assert_eq!(
        outputs["output_file"],
        format!("s3://bucket/runs/{}/output.txt", run.id)
    );
    assert_eq!(outputs["metrics"]["tasks_completed"], STEP_COUNT);
    assert!(
        run.system_logs
            .contains(&"Run state update: RUNNING -> COMPLETE".to_string())
    );

    let tasks = store.get_task_logs(&run.id).await.unwrap();
    let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["Download inputs", "Process workflow", "Upload outputs"]);
    assert!(tasks.iter().all(|t| t.end_time.is_some()));

    // A completed run is no longer polled.
    let report = monitor.run_once().await;
    assert_eq!(report.polled, 0);
    assert_eq!(reload(&store, &run.id).await, run);
    assert_eq!(executor.tracked().await, 0);
}

#[tokio::test]
async fn test_submit_failure_marks_system_error() {
    let store = test_store().await;
    let run = queued_run(&store).await;

    let report = monitor(&store, Arc::new(LocalExecutor::failing_submission()), 10)
        .run_once()
        .await;
    assert_eq!(report.submit_failures, 1);
    assert_eq!(report.dispatched, 0);

    let run = reload(&store, &run.id).await;
    assert_eq!(run.state, RunState::SystemError);
    assert_eq!(run.exit_code, Some(1));
    assert!(run.backend_run_id.is_none());
    assert!(run.system_logs.iter().any(|l| {
        l.starts_with("Failed to submit workflow:") && l.contains("Simulated submission failure")
    }));
    assert_end_time_invariant(&run);
}

#[tokio::test]
async fn test_executor_failure_marks_executor_error() {
    let store = test_store().await;
    let run = queued_run(&store).await;
    let monitor = monitor(&store, Arc::new(LocalExecutor::failing_at(1)), 10);

    for _ in 0..3 {
        monitor.run_once().await;
    }

    let run = reload(&store, &run.id).await;
    assert_eq!(run.state, RunState::ExecutorError);
    assert_eq!(run.exit_code, Some(1));
    assert!(run.outputs.is_none());
    assert_end_time_invariant(&run);

    let tasks = store.get_task_logs(&run.id).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[1].exit_code, Some(1));
}

#[tokio::test]
async fn test_cancel_dispatched_run() {
    let store = test_store().await;
    let run = queued_run(&store).await;
    let monitor = monitor(&store, Arc::new(LocalExecutor::new()), 10);
    monitor.run_once().await;

    let service = RunService::new(store.clone(), Default::default());
    service.cancel_run(&run.id, None).await.unwrap();
    assert_eq!(reload(&store, &run.id).await.state, RunState::Canceling);

    let report = monitor.run_once().await;
    assert_eq!(report.canceled, 1);

    let run = reload(&store, &run.id).await;
    assert_eq!(run.state, RunState::Canceled);
    assert!(
        run.system_logs
            .contains(&"Cancellation confirmed by backend".to_string())
    );
    assert_end_time_invariant(&run);
}

#[tokio::test]
async fn test_cancel_queued_run_without_backend() {
    let store = test_store().await;
    let run = queued_run(&store).await;
    let executor = Arc::new(ScriptedExecutor::new());

    RunService::new(store.clone(), Default::default())
        .cancel_run(&run.id, None)
        .await
        .unwrap();

    let report = monitor(&store, executor.clone(), 10).run_once().await;
    assert_eq!(report.canceled, 1);
    assert!(executor.submitted.lock().unwrap().is_empty());
    assert!(executor.canceled.lock().unwrap().is_empty());

    let run = reload(&store, &run.id).await;
    assert_eq!(run.state, RunState::Canceled);
    assert!(run.system_logs.contains(&"No backend run to cancel".to_string()));
}

#[tokio::test]
async fn test_unconfirmed_cancel_still_cancels() {
    let store = test_store().await;
    let run = run_in_state(&store, RunState::Canceling, Some("scripted-x")).await;
    let executor = Arc::new(ScriptedExecutor {
        confirm_cancel: false,
        ..ScriptedExecutor::new()
    });

    monitor(&store, executor.clone(), 10).run_once().await;

    assert_eq!(*executor.canceled.lock().unwrap(), ["scripted-x"]);
    let run = reload(&store, &run.id).await;
    assert_eq!(run.state, RunState::Canceled);
    assert!(
        run.system_logs
            .contains(&"Cancellation not confirmed by backend: backend unreachable".to_string())
    );
}

#[tokio::test]
async fn test_transient_poll_error_leaves_state() {
    let store = test_store().await;
    let run = run_in_state(&store, RunState::Running, Some("scripted-a")).await;
    let before = reload(&store, &run.id).await;
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("scripted-a", Err("connection reset".to_string()));

    let report = monitor(&store, executor, 10).run_once().await;
    assert_eq!(report.errors, 1);
    assert_eq!(report.transitions, 0);
    assert_eq!(reload(&store, &run.id).await, before);
}

#[tokio::test]
async fn test_one_failing_run_does_not_block_others() {
    let store = test_store().await;
    let broken = run_in_state(&store, RunState::Running, Some("scripted-a")).await;
    let healthy = run_in_state(&store, RunState::Running, Some("scripted-b")).await;
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("scripted-a", Err("timeout".to_string()));
    let mut done = StatusReport::new(RunState::Complete, "COMPLETED");
    done.exit_code = Some(0);
    executor.script("scripted-b", Ok(done));

    let report = monitor(&store, executor, 10).run_once().await;
    assert_eq!(report.errors, 1);
    assert_eq!(report.transitions, 1);
    assert_eq!(reload(&store, &broken.id).await.state, RunState::Running);
    assert_eq!(reload(&store, &healthy.id).await.state, RunState::Complete);
}

#[tokio::test]
async fn test_initializing_run_passes_through_running_to_complete() {
    let store = test_store().await;
    let run = run_in_state(&store, RunState::Initializing, Some("scripted-c")).await;
    let executor = Arc::new(ScriptedExecutor::new());
    executor.script("scripted-c", Ok(StatusReport::new(RunState::Complete, "COMPLETED")));

    monitor(&store, executor, 10).run_once().await;

    let run = reload(&store, &run.id).await;
    assert_eq!(run.state, RunState::Complete);
    assert!(
        run.system_logs
            .contains(&"Run state update: INITIALIZING -> RUNNING".to_string())
    );
    assert!(
        run.system_logs
            .contains(&"Run state update: RUNNING -> COMPLETE".to_string())
    );
}

fn repeated_job_tasks() -> Vec<NewTaskLog> {
    let job = NewTaskLog {
        id: Some("task-1-job".to_string()),
        name: "job".to_string(),
        ..Default::default()
    };
    vec![job.clone(), job]
}

#[tokio::test]
async fn test_repeated_task_ids_do_not_block_completion() {
    let store = test_store().await;
    let run = run_in_state(&store, RunState::Running, Some("scripted-dup")).await;
    let executor = Arc::new(ScriptedExecutor::new());
    let mut report = StatusReport::new(RunState::Complete, "COMPLETED");
    report.task_logs = Some(repeated_job_tasks());
    executor.script("scripted-dup", Ok(report));

    monitor(&store, executor, 10).run_once().await;

    let run = reload(&store, &run.id).await;
    assert_eq!(run.state, RunState::Complete);
    let tasks = store.get_task_logs(&run.id).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_ne!(tasks[0].id, tasks[1].id);
}

#[tokio::test]
async fn test_repeated_task_ids_are_written_once_while_running() {
    let store = test_store().await;
    let run = run_in_state(&store, RunState::Running, Some("scripted-dup-r")).await;
    let executor = Arc::new(ScriptedExecutor::new());
    for _ in 0..2 {
        let mut report = StatusReport::new(RunState::Running, "RUNNING");
        report.task_logs = Some(repeated_job_tasks());
        executor.script("scripted-dup-r", Ok(report));
    }
    let monitor = monitor(&store, executor, 10);

    monitor.run_once().await;
    let first = reload(&store, &run.id).await;
    assert_eq!(store.get_task_logs(&run.id).await.unwrap().len(), 2);

    monitor.run_once().await;
    let second = reload(&store, &run.id).await;
    assert_eq!(second.revision, first.revision);
    assert_eq!(second.state, RunState::Running);
}

#[tokio::test]
async fn test_unknown_backend_status_marks_system_error() {
    let store = test_store().await;
    let run = run_in_state(&store, RunState::Running, Some("scripted-d")).await;
    let executor = Arc::new(ScriptedExecutor::new());
    let mut report = StatusReport::new(RunState::SystemError, "WEIRD");
    report.logs.push("Unknown backend status: WEIRD".to_string());
    executor.script("scripted-d", Ok(report));

    monitor(&store, executor, 10).run_once().await;

    let run = reload(&store, &run.id).await;
    assert_eq!(run.state, RunState::SystemError);
    assert!(run.system_logs.contains(&"Unknown backend status: WEIRD".to_string()));
    assert_end_time_invariant(&run);
}

#[tokio::test]
async fn test_active_run_without_handle_marks_system_error() {
    let store = test_store().await;
    let run = run_in_state(&store, RunState::Running, None).await;

    monitor(&store, Arc::new(ScriptedExecutor::new()), 10)
        .run_once()
        .await;

    let run = reload(&store, &run.id).await;
    assert_eq!(run.state, RunState::SystemError);
    assert_end_time_invariant(&run);
}

#[tokio::test]
async fn test_paused_run_is_reconciled() {
    let store = test_store().await;
    let run = run_in_state(&store, RunState::Paused, Some("scripted-p")).await;

    monitor(&store, Arc::new(ScriptedExecutor::new()), 10)
        .run_once()
        .await;

    let run = reload(&store, &run.id).await;
    assert_eq!(run.state, RunState::Running);
    assert!(
        run.system_logs
            .contains(&"Run state update: PAUSED -> RUNNING".to_string())
    );
}

#[tokio::test]
async fn test_shutdown_stops_monitor() {
    let store = test_store().await;
    let monitor = Monitor::new(
        store,
        Arc::new(LocalExecutor::new()),
        MonitorConfig {
            poll_interval: Duration::from_secs(3600),
            max_concurrent_runs: 1,
        },
    );
    let shutdown = monitor.shutdown_handle();
    let worker = tokio::spawn(async move { monitor.run().await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.notify_one();

    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("monitor did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_end_time_invariant_across_lifecycle() {
    let store = test_store().await;
    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(queued_run(&store).await.id);
    }
    let monitor = monitor(&store, Arc::new(LocalExecutor::failing_at(2)), 3);

    for _ in 0..10 {
        monitor.run_once().await;
        for id in &ids {
            assert_end_time_invariant(&reload(&store, id).await);
        }
    }

    for id in &ids {
        assert_eq!(reload(&store, id).await.state, RunState::ExecutorError);
    }
}
