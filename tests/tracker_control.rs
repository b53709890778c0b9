mod common;
use crate::common::{FakeAirflow, Harness, count_kind, drain, fast_options, init_tracing, with_timeout};

use std::error::Error;
use std::time::Duration;

use chainwatch::config::TrackerOptions;
use chainwatch::errors::ChainwatchError;
use chainwatch::events::EventKind;
use chainwatch::tracker::ExecuteOptions;
use chainwatch::types::{TaskStatus, WorkflowStatus};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn stop_cancels_only_its_own_chain() -> TestResult {
    init_tracing();
    let airflow = FakeAirflow::new();
    airflow.script("stuck", &["running"]);
    airflow.script("slow", &["running", "running", "running", "success"]);
    let h = Harness::with_airflow(airflow, fast_options());
    let mut rx = h.subscribe();

    let victim = h.create(&["stuck", "after"]).await;
    let bystander = h.create(&["slow", "after"]).await;
    h.tracker.start(victim.id, ExecuteOptions::default()).await?;
    h.tracker.start(bystander.id, ExecuteOptions::default()).await?;

    let stopped = h.tracker.stop(victim.id).await?;
    assert_eq!(stopped.status, TaskStatus::Cancelled);
    assert!(!h.tracker.is_active(victim.id));

    let runs = h.runs(victim.id).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, WorkflowStatus::Failed);
    assert_eq!(runs[0].note.as_deref(), Some("stopped"));

    let changes = h.airflow.state_changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].0, "stuck");
    assert_eq!(changes[0].2, "failed");

    let done = with_timeout(h.wait_terminal(bystander.id)).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(
        h.store.get_task(victim.id).await?.status,
        TaskStatus::Cancelled
    );
    assert!(!h.airflow.triggered_dags().is_empty());
    assert_eq!(
        h.airflow
            .triggered_dags()
            .iter()
            .filter(|d| d.as_str() == "after")
            .count(),
        1
    );

    let events = drain(&mut rx);
    let victim_events: Vec<_> = events
        .iter()
        .filter(|e| e.task_id == Some(victim.id))
        .collect();
    assert!(victim_events.iter().any(|e| e.kind == EventKind::WorkflowStopped));
    assert_eq!(
        victim_events
            .iter()
            .filter(|e| e.kind == EventKind::TaskCancelled)
            .count(),
        1
    );
    assert!(!victim_events.iter().any(|e| e.kind == EventKind::TaskFailed));
    Ok(())
}

#[tokio::test]
async fn stop_requires_a_live_chain() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let task = h.create(&["a"]).await;

    let err = h.tracker.stop(task.id).await.unwrap_err();
    assert!(matches!(err, ChainwatchError::InvalidState(_)));
    assert_eq!(h.store.get_task(task.id).await?.status, TaskStatus::Pending);

    let err = h.tracker.stop(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, ChainwatchError::TaskNotFound(_)));
    Ok(())
}

#[tokio::test]
async fn element_timeout_fails_the_chain() -> TestResult {
    init_tracing();
    let airflow = FakeAirflow::new();
    airflow.script("forever", &["running"]);
    let options = TrackerOptions {
        poll_interval: Duration::from_millis(5),
        initial_delay: Duration::ZERO,
        run_timeout: Duration::from_millis(40),
    };
    let h = Harness::with_airflow(airflow, options);
    let mut rx = h.subscribe();
    let task = h.create(&["forever", "never"]).await;

    h.tracker.start(task.id, ExecuteOptions::default()).await?;
    let done = h.wait_terminal(task.id).await;

    assert_eq!(done.status, TaskStatus::Failed);
    let runs = h.runs(task.id).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, WorkflowStatus::Failed);
    assert_eq!(runs[0].note.as_deref(), Some("timeout"));
    assert!(!h.airflow.triggered_dags().contains(&"never".to_string()));

    let events = drain(&mut rx);
    let failed = events
        .iter()
        .find(|e| e.kind == EventKind::TaskFailed)
        .ok_or("missing task.failed")?;
    assert!(
        failed.data["reason"]
            .as_str()
            .is_some_and(|r| r.contains("timeout"))
    );
    Ok(())
}

#[tokio::test]
async fn success_seen_at_the_deadline_still_completes() -> TestResult {
    init_tracing();
    let airflow = FakeAirflow::new();
    airflow.script("a", &["running", "success"]);
    let options = TrackerOptions {
        poll_interval: Duration::from_millis(50),
        initial_delay: Duration::ZERO,
        run_timeout: Duration::from_millis(50),
    };
    let h = Harness::with_airflow(airflow, options);
    let task = h.create(&["a"]).await;

    h.tracker.start(task.id, ExecuteOptions::default()).await?;
    let done = h.wait_terminal(task.id).await;

    assert_eq!(done.status, TaskStatus::Completed);
    let runs = h.runs(task.id).await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, WorkflowStatus::Success);
    assert_eq!(runs[0].note, None);
    Ok(())
}

#[tokio::test]
async fn initial_delay_does_not_count_against_the_run_timeout() -> TestResult {
    init_tracing();
    let options = TrackerOptions {
        poll_interval: Duration::from_millis(10),
        initial_delay: Duration::from_millis(100),
        run_timeout: Duration::from_millis(50),
    };
    let h = Harness::with_airflow(FakeAirflow::new(), options);
    let task = h.create(&["a", "b"]).await;

    h.tracker.start(task.id, ExecuteOptions::default()).await?;
    let done = h.wait_terminal(task.id).await;

    assert_eq!(done.status, TaskStatus::Completed);
    assert!(h.airflow.poll_count("a_run_1") >= 1);
    let runs = h.runs(task.id).await;
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == WorkflowStatus::Success));
    Ok(())
}

#[tokio::test]
async fn retry_reruns_a_failed_chain() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.airflow.script("b", &["failed"]);
    let task = h.create(&["a", "b"]).await;

    h.tracker.start(task.id, ExecuteOptions::default()).await?;
    assert_eq!(h.wait_terminal(task.id).await.status, TaskStatus::Failed);

    h.airflow.script("b", &["success"]);
    let execution = h.tracker.retry(task.id, ExecuteOptions::default()).await?;
    assert_eq!(execution.task.attempt, 2);

    let done = h.wait_terminal(task.id).await;
    assert_eq!(done.status, TaskStatus::Completed);

    let latest = h.store.runs_for_task(task.id, Some(2)).await?;
    assert_eq!(latest.len(), 2);
    assert!(latest.iter().all(|r| r.status == WorkflowStatus::Success));
    assert_eq!(h.runs(task.id).await.len(), 4);
    Ok(())
}

#[tokio::test]
async fn retry_after_stop() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.airflow.script("a", &["running"]);
    let task = h.create(&["a"]).await;

    h.tracker.start(task.id, ExecuteOptions::default()).await?;
    h.tracker.stop(task.id).await?;

    h.airflow.script("a", &["success"]);
    h.tracker.retry(task.id, ExecuteOptions::default()).await?;
    assert_eq!(h.wait_terminal(task.id).await.status, TaskStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn retry_rejects_running_and_pending_tasks() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.airflow.script("a", &["running"]);

    let pending = h.create(&["a"]).await;
    let err = h
        .tracker
        .retry(pending.id, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ChainwatchError::InvalidState(_)));

    h.tracker.start(pending.id, ExecuteOptions::default()).await?;
    let err = h
        .tracker
        .retry(pending.id, ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ChainwatchError::AlreadyRunning(_)));
    assert_eq!(h.runs(pending.id).await.len(), 1);

    h.tracker.stop(pending.id).await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_stops_every_loop() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.airflow.script("a", &["running"]);
    let first = h.create(&["a"]).await;
    let second = h.create(&["a"]).await;

    h.tracker.start(first.id, ExecuteOptions::default()).await?;
    h.tracker.start(second.id, ExecuteOptions::default()).await?;
    assert_eq!(h.tracker.active_count(), 2);

    with_timeout(h.tracker.shutdown()).await;
    assert_eq!(h.tracker.active_count(), 0);

    let events_before = h.airflow.triggers().len();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.airflow.triggers().len(), events_before);
    Ok(())
}

#[tokio::test]
async fn stop_events_reach_subscribers_once() -> TestResult {
    init_tracing();
    let h = Harness::new();
    h.airflow.script("a", &["running"]);
    let mut rx = h.subscribe();
    let task = h.create(&["a"]).await;

    h.tracker.start(task.id, ExecuteOptions::default()).await?;
    h.tracker.stop(task.id).await?;
    let err = h.tracker.stop(task.id).await.unwrap_err();
    assert!(matches!(err, ChainwatchError::InvalidState(_)));

    let events = drain(&mut rx);
    assert_eq!(count_kind(&events, EventKind::WorkflowStopped), 1);
    assert_eq!(count_kind(&events, EventKind::TaskCancelled), 1);
    Ok(())
}
