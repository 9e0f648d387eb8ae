//! WebSocket streams for dashboards: the node fleet as periodic snapshots
//! plus push deltas, and a per-node heartbeat tail.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use mesh_core::ids::MachineId;
use serde_json::json;

use crate::{unix_now, AppState};

const SNAPSHOT_PERIOD: Duration = Duration::from_secs(2);

pub async fn nodes_stream(
    State(state): State<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| run_nodes_stream(state, socket))
}

async fn run_nodes_stream(state: Arc<AppState>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (sub_id, mut deltas) = state.broadcaster.subscribe();
    let mut ticker = tokio::time::interval(SNAPSHOT_PERIOD);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = json!({
                    "type": "snapshot",
                    "nodes": state.registry.realtime_views(unix_now()),
                });
                if send_json(&mut sink, &snapshot).await.is_err() {
                    break;
                }
            }
            delta = deltas.recv() => {
                let Some(delta) = delta else { break };
                let message = json!({ "type": "delta", "node": delta });
                if send_json(&mut sink, &message).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
    state.broadcaster.unsubscribe(sub_id);
}

pub async fn node_log_stream(
    State(state): State<Arc<AppState>>,
    Path(machine_id): Path<u64>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| run_node_log_stream(state, MachineId(machine_id), socket))
}

/// Tail a machine's heartbeat log: recent entries on connect, then only
/// entries not yet sent. Dedup goes by the per-machine sequence number,
/// since several heartbeats can land within one second.
async fn run_node_log_stream(state: Arc<AppState>, machine_id: MachineId, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let mut ticker = tokio::time::interval(SNAPSHOT_PERIOD);
    let mut last_seq: Option<u64> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut entries = state.registry.recent_heartbeats(machine_id, 20);
                entries.retain(|h| last_seq.map_or(true, |s| h.seq > s));
                entries.reverse();
                if let Some(newest) = entries.last() {
                    last_seq = Some(newest.seq);
                }
                for entry in entries {
                    let message = json!({ "type": "heartbeat", "entry": entry });
                    if send_json(&mut sink, &message).await.is_err() {
                        return;
                    }
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    _ => {}
                }
            }
        }
    }
}

async fn send_json(
    sink: &mut (impl futures::Sink<Message, Error = axum::Error> + Unpin),
    value: &serde_json::Value,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    sink.send(Message::Text(text.into())).await
}
