// src/relay/mod.rs

//! WebSocket relay: forwards bus events to subscribed connections.

pub mod registry;
pub mod socket;

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::EventBus;

pub use registry::{ConnectionId, Registry, RegistryStats};
pub use socket::{handle_client_text, serve_socket};

/// Spawn the loop that fans bus events out through `registry`.
///
/// The bus subscription is taken before this returns, so events published
/// afterwards are never missed.
pub fn spawn_relay(
    bus: &EventBus,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();

    tokio::spawn(async move {
        info!("event relay started");
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => received,
            };

            match received {
                Ok(event) => {
                    let delivered = registry.broadcast(&event);
                    debug!(kind = %event.kind, delivered, "event relayed");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event relay lagged; oldest events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("event relay finished");
    })
}
