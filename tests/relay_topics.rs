mod common;
use crate::common::{Harness, TaskBuilder, init_tracing, with_timeout};

use std::error::Error;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chainwatch::events::Topic;
use chainwatch::relay::{Registry, spawn_relay};
use chainwatch::tracker::ExecuteOptions;

type TestResult = Result<(), Box<dyn Error>>;

/// Receive messages until one of type `task.completed` arrives.
async fn until_task_completed(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
    let mut seen = Vec::new();
    loop {
        let text = with_timeout(rx.recv()).await.expect("connection closed");
        let value: Value = serde_json::from_str(&text).expect("json");
        let done = value["type"] == "task.completed";
        seen.push(value);
        if done {
            return seen;
        }
    }
}

fn drain_now(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(text) = rx.try_recv() {
        out.push(serde_json::from_str(&text).expect("json"));
    }
    out
}

#[tokio::test]
async fn workflow_subscribers_only_see_their_workflow() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let registry = Arc::new(Registry::new(256));
    let cancel = CancellationToken::new();
    let relay = spawn_relay(&h.events, Arc::clone(&registry), cancel.clone());

    let (_a, mut a_rx) = registry.add([Topic::Workflow {
        workflow_id: "ingest".into(),
    }]);
    let (_b, mut b_rx) = registry.add([Topic::Workflow {
        workflow_id: "train".into(),
    }]);
    let (_g, mut global_rx) = registry.add([Topic::Global]);

    let first = h.create(&["ingest"]).await;
    let second = h.create(&["train"]).await;
    h.tracker.start(first.id, ExecuteOptions::default()).await?;
    h.tracker.start(second.id, ExecuteOptions::default()).await?;

    let mut a_seen = until_task_completed(&mut a_rx).await;
    let mut b_seen = until_task_completed(&mut b_rx).await;
    a_seen.extend(drain_now(&mut a_rx));
    b_seen.extend(drain_now(&mut b_rx));

    assert!(a_seen.iter().all(|v| v["workflow_id"] == "ingest"));
    assert!(b_seen.iter().all(|v| v["workflow_id"] == "train"));
    assert_eq!(a_seen.len(), 3);
    assert_eq!(b_seen.len(), 3);

    let mut global = until_task_completed(&mut global_rx).await;
    global.extend(until_task_completed(&mut global_rx).await);
    global.extend(drain_now(&mut global_rx));
    assert_eq!(global.len(), 6);

    cancel.cancel();
    relay.await?;
    Ok(())
}

#[tokio::test]
async fn user_topics_filter_by_owner() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let registry = Arc::new(Registry::new(256));
    let cancel = CancellationToken::new();
    let relay = spawn_relay(&h.events, Arc::clone(&registry), cancel.clone());

    let (_u, mut user_rx) = registry.add([Topic::User { user_id: 7 }]);
    let (_uw, mut user_wf_rx) = registry.add([Topic::UserWorkflow {
        user_id: 7,
        workflow_id: "b".into(),
    }]);

    let mine = h
        .create_task(TaskBuilder::new("mine").chain(&["a", "b"]).user(7).build())
        .await;
    let theirs = h
        .create_task(TaskBuilder::new("theirs").chain(&["b"]).user(8).build())
        .await;
    h.tracker.start(theirs.id, ExecuteOptions::default()).await?;
    h.wait_terminal(theirs.id).await;
    h.tracker.start(mine.id, ExecuteOptions::default()).await?;

    let seen = until_task_completed(&mut user_rx).await;
    assert!(seen.iter().all(|v| v["user_id"] == 7));
    assert!(seen.iter().any(|v| v["workflow_id"] == "a"));

    // user 7 + workflow b: b's triggered/completed and the final task event.
    let seen = until_task_completed(&mut user_wf_rx).await;
    assert!(
        seen.iter()
            .all(|v| v["user_id"] == 7 && v["workflow_id"] == "b")
    );
    assert_eq!(seen.len(), 3);

    cancel.cancel();
    relay.await?;
    Ok(())
}

#[tokio::test]
async fn slow_client_is_dropped_without_blocking_others() -> TestResult {
    init_tracing();
    let h = Harness::new();
    let registry = Arc::new(Registry::new(3));
    let cancel = CancellationToken::new();
    let relay = spawn_relay(&h.events, Arc::clone(&registry), cancel.clone());

    let (slow, _slow_rx) = registry.add([Topic::Global]);
    let (_fast, mut fast_rx) = registry.add([Topic::Global]);

    let task = h.create(&["a", "b"]).await;
    h.tracker.start(task.id, ExecuteOptions::default()).await?;

    // The fast client reads everything; the slow one never reads.
    let mut kinds = Vec::new();
    while kinds.last().map(String::as_str) != Some("task.completed") {
        let text = with_timeout(fast_rx.recv()).await.ok_or("closed")?;
        let value: Value = serde_json::from_str(&text)?;
        kinds.push(value["type"].as_str().unwrap_or_default().to_string());
    }

    assert!(!registry.contains(slow));
    cancel.cancel();
    relay.await?;
    Ok(())
}
