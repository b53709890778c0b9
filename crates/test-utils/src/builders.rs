#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::broadcast;

use chainwatch::config::TrackerOptions;
use chainwatch::events::{Event, EventBus};
use chainwatch::store::{MemoryStore, NewTask, Task, TaskStore, WorkflowRun};
use chainwatch::tracker::{Tracker, TrackerContext};
use chainwatch::types::{TaskId, UserId};

use crate::fake_airflow::FakeAirflow;
use crate::wait_until;

/// Builder for `NewTask`.
pub struct TaskBuilder {
    task: NewTask,
}

impl TaskBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            task: NewTask {
                name: name.to_string(),
                dag_chain: Vec::new(),
                user_id: None,
                parameters: json!({}),
            },
        }
    }

    pub fn chain(mut self, dags: &[&str]) -> Self {
        self.task.dag_chain = dags.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn user(mut self, user_id: UserId) -> Self {
        self.task.user_id = Some(user_id);
        self
    }

    pub fn parameters(mut self, parameters: Value) -> Self {
        self.task.parameters = parameters;
        self
    }

    pub fn build(self) -> NewTask {
        self.task
    }
}

/// Tracker timing suitable for tests: polls every few milliseconds.
pub fn fast_options() -> TrackerOptions {
    TrackerOptions {
        poll_interval: Duration::from_millis(5),
        initial_delay: Duration::ZERO,
        run_timeout: Duration::from_secs(5),
    }
}

/// Tracker wired to a `FakeAirflow` and an in-memory store.
pub struct Harness {
    pub airflow: FakeAirflow,
    pub store: Arc<dyn TaskStore>,
    pub events: EventBus,
    pub tracker: Arc<Tracker>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(fast_options())
    }

    pub fn with_options(options: TrackerOptions) -> Self {
        Self::with_airflow(FakeAirflow::new(), options)
    }

    pub fn with_airflow(airflow: FakeAirflow, options: TrackerOptions) -> Self {
        Self::with_store(airflow, Arc::new(MemoryStore::new()), options)
    }

    /// Same as `with_airflow`, over a caller-supplied store.
    pub fn with_store(
        airflow: FakeAirflow,
        store: Arc<dyn TaskStore>,
        options: TrackerOptions,
    ) -> Self {
        let events = EventBus::new(256);
        let ctx = TrackerContext::new(
            Arc::new(airflow.clone()),
            Arc::clone(&store),
            events.clone(),
        );
        let tracker = Arc::new(Tracker::new(ctx, options));
        Self {
            airflow,
            store,
            events,
            tracker,
        }
    }

    pub async fn create(&self, dags: &[&str]) -> Task {
        self.create_task(TaskBuilder::new("test-task").chain(dags).build())
            .await
    }

    pub async fn create_task(&self, new: NewTask) -> Task {
        self.store.create_task(new).await.expect("create task")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Wait until the task is terminal and its poll loop has exited.
    pub async fn wait_terminal(&self, task_id: TaskId) -> Task {
        wait_until(move || async move {
            let task = self.store.get_task(task_id).await.expect("task");
            task.status.is_terminal() && !self.tracker.is_active(task_id)
        })
        .await;
        self.store.get_task(task_id).await.expect("task")
    }

    pub async fn runs(&self, task_id: TaskId) -> Vec<WorkflowRun> {
        self.store
            .runs_for_task(task_id, None)
            .await
            .expect("runs")
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain every event currently buffered in `rx`.
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}
