//! WebSocket progress relay.
//!
//! Bridges Progress Bus topics to connected clients. Each handler accepts,
//! subscribes, sends the connection greeting, then joins two tasks: forward
//! bus messages out, answer pings in. Whichever side ends first tears the
//! connection down; dropping the subscription releases the bus channel.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::SinkExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use renderflow_events::Subscription;
use renderflow_protocol::JobId;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/jobs/{job_id}", get(job_status_ws))
        .route("/ws/jobs", get(multi_job_status_ws))
}

/// Real-time status stream for one job.
async fn job_status_ws(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| async move {
        let job_id = JobId::new(job_id);
        info!("WebSocket client connected for job {job_id}");
        let subscription = state.bus.subscribe_job(job_id);
        let greeting = json!({
            "type": "connection",
            "job_id": job_id,
            "status": "connected",
        });
        relay_loop(socket, subscription, greeting).await;
        info!("WebSocket client disconnected for job {job_id}");
    })
}

/// Real-time status stream for several jobs (`?job_ids=1,2,3`).
async fn multi_job_status_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |mut socket| async move {
        let raw = params.get("job_ids").cloned().unwrap_or_default();
        let ids = match parse_job_ids(&raw) {
            Ok(ids) if !ids.is_empty() => ids,
            Ok(_) => {
                let _ = send_json(&mut socket, &json!({"error": "No valid job IDs provided"}))
                    .await;
                let _ = socket.close().await;
                return;
            }
            Err(bad) => {
                let _ = send_json(
                    &mut socket,
                    &json!({"error": format!("Invalid job id: {bad}")}),
                )
                .await;
                let _ = socket.close().await;
                return;
            }
        };

        info!("WebSocket client connected for jobs {:?}", ids);
        let subscription = state.bus.subscribe_jobs(&ids);
        let greeting = json!({
            "type": "connection",
            "job_ids": ids,
            "status": "connected",
        });
        relay_loop(socket, subscription, greeting).await;
        info!("Multi-job WebSocket client disconnected");
    })
}

fn parse_job_ids(raw: &str) -> Result<Vec<JobId>, String> {
    let mut ids = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.parse::<JobId>() {
            Ok(id) => ids.push(id),
            Err(_) => return Err(part.to_string()),
        }
    }
    Ok(ids)
}

/// Forward bus messages to the client and answer pings until either side
/// goes away.
async fn relay_loop(mut socket: WebSocket, mut subscription: Subscription, greeting: Value) {
    if send_json(&mut socket, &greeting).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            published = subscription.recv() => {
                match published {
                    Some(payload) => {
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            // Client went away mid-send; it will reconnect.
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&mut socket, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary/ping/pong frames ignored
                    Some(Err(e)) => {
                        debug!("WebSocket receive error: {e}");
                        break;
                    }
                }
            }
        }
    }

    let _ = socket.close().await;
}

/// `{"type":"ping"}` earns a pong; everything else is ignored.
async fn handle_client_message(socket: &mut WebSocket, text: &str) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return;
    };
    if value.get("type").and_then(Value::as_str) == Some("ping") {
        if let Err(e) = send_json(socket, &json!({"type": "pong"})).await {
            warn!("Failed to answer ping: {e}");
        }
    }
}

async fn send_json(socket: &mut WebSocket, value: &Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(value.to_string().into())).await
}
