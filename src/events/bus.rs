// src/events/bus.rs

//! In-process event fan-out based on a bounded `tokio::sync::broadcast`
//! channel.

use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::Event;

/// Cloneable handle to the shared broadcast channel.
///
/// Publishing never blocks and never fails the caller. Receivers that fall
/// more than `capacity` events behind lose the oldest ones.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Best-effort publish. Returns the number of receivers reached.
    pub fn publish(&self, event: Event) -> usize {
        let kind = event.kind;
        match self.tx.send(event) {
            Ok(receivers) => {
                trace!(%kind, receivers, "event published");
                receivers
            }
            Err(broadcast::error::SendError(_)) => {
                debug!(%kind, "no subscribers; event dropped");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
