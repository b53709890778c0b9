#![allow(dead_code)]

pub use chainwatch_test_utils::builders::{Harness, TaskBuilder, drain, fast_options};
pub use chainwatch_test_utils::fake_airflow::FakeAirflow;
pub use chainwatch_test_utils::{init_tracing, wait_until, with_timeout};

use chainwatch::events::{Event, EventKind};

pub fn count_kind(events: &[Event], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}
