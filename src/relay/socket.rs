// src/relay/socket.rs

//! Per-connection WebSocket handling.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tracing::debug;

use crate::events::Topic;
use crate::relay::registry::{ConnectionId, Registry};

/// Drive one accepted socket until either side closes.
pub async fn serve_socket(socket: WebSocket, registry: Arc<Registry>, topics: Vec<Topic>) {
    let (id, mut outbound) = registry.add(topics.clone());
    let (mut sink, mut stream) = socket.split();

    let welcome = json!({
        "type": "connection_established",
        "connection_id": id,
        "topics": topics.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "timestamp": Utc::now(),
    });
    registry.send_to(id, welcome.to_string());

    let mut writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_client_text(&registry, id, &text);
                    if !registry.send_to(id, reply.to_string()) {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(connection = id, error = %err, "websocket receive failed");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    registry.remove(id);
    writer.abort();
    debug!(connection = id, "websocket closed");
}

/// Answer one client message.
pub fn handle_client_text(registry: &Registry, id: ConnectionId, text: &str) -> Value {
    let message: Value = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(_) => return json!({ "error": "Invalid JSON format" }),
    };

    match message.get("type").and_then(Value::as_str) {
        Some("ping") => json!({ "type": "pong", "timestamp": Utc::now() }),
        Some("subscribe") => match requested_topic(&message) {
            Some((kind, target, topic)) => {
                registry.subscribe(id, topic);
                json!({
                    "type": "subscription_confirmed",
                    "subscription_type": kind,
                    "target": target,
                })
            }
            None => json!({ "error": "Invalid subscription request" }),
        },
        Some("unsubscribe") => match requested_topic(&message) {
            Some((kind, target, topic)) => {
                registry.unsubscribe(id, &topic);
                json!({
                    "type": "unsubscription_confirmed",
                    "subscription_type": kind,
                    "target": target,
                })
            }
            None => json!({ "error": "Invalid unsubscription request" }),
        },
        Some("get_status") => match message.get("request_type").and_then(Value::as_str) {
            Some("connection_stats") => json!({
                "type": "status_response",
                "request_type": "connection_stats",
                "stats": registry.stats(),
            }),
            other => json!({
                "error": format!("Unknown status request type: {}", other.unwrap_or_default())
            }),
        },
        other => json!({
            "error": format!("Unknown message type: {}", other.unwrap_or_default())
        }),
    }
}

/// `(subscription_type, target, topic)` of a subscribe/unsubscribe message.
fn requested_topic(message: &Value) -> Option<(&'static str, Value, Topic)> {
    let target = message.get("target")?;
    match message.get("subscription_type").and_then(Value::as_str)? {
        "workflow" => {
            let workflow_id = target.as_str().filter(|s| !s.is_empty())?;
            Some((
                "workflow",
                target.clone(),
                Topic::Workflow {
                    workflow_id: workflow_id.to_string(),
                },
            ))
        }
        "user" => {
            let user_id = match target {
                Value::Number(n) => n.as_u64()?,
                Value::String(s) => s.trim().parse().ok()?,
                _ => return None,
            };
            Some(("user", target.clone(), Topic::User { user_id }))
        }
        _ => None,
    }
}
