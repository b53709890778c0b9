// src/tracker/mod.rs

//! DAG chain tracking.
//!
//! - [`chain`] is the pure state machine deciding what happens after each
//!   poll.
//! - [`poller`] is the per-task async loop that polls Airflow and applies the
//!   machine's commands.
//! - [`service`] owns the registry of live loops and implements
//!   start/stop/retry.

pub mod chain;
pub mod poller;
pub mod service;

use std::sync::Arc;

use crate::airflow::AirflowApi;
use crate::events::{Event, EventBus};
use crate::store::TaskStore;

pub use chain::{ChainCommand, ChainState, ChainStep};
pub use service::{ExecuteOptions, Execution, Tracker};

/// Collaborators shared by the tracker and every poll loop.
#[derive(Clone)]
pub struct TrackerContext {
    pub airflow: Arc<dyn AirflowApi>,
    pub store: Arc<dyn TaskStore>,
    pub events: EventBus,
}

impl TrackerContext {
    pub fn new(airflow: Arc<dyn AirflowApi>, store: Arc<dyn TaskStore>, events: EventBus) -> Self {
        Self {
            airflow,
            store,
            events,
        }
    }

    pub(crate) fn emit(&self, event: Event) {
        self.events.publish(event);
    }
}
