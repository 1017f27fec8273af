//! Per-client WebSocket handling

use std::collections::BTreeSet;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use tokio::time::Instant;

use strand_engine::{AggregateId, Consumer, ConsumerFilter};

use super::frames::{self, ClientFrame};
use crate::state::AppState;

/// Keepalive ping period
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Missing a pong for this long closes the connection
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Cap on inbound subscription frames
pub const MAX_FRAME_BYTES: usize = 512;

/// WebSocket endpoint for event subscriptions
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Outcome of applying one subscribe frame
enum Subscribed {
    /// New consumer and the sequence events must reach to be forwarded
    Swapped(Consumer, i64, String),
    /// Frame was malformed; keep the current consumer
    Ignored,
    /// Aggregate path was invalid; close the connection
    Rejected(String),
}

async fn apply_subscribe(state: &AppState, text: &str) -> Subscribed {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(error) => {
            tracing::warn!(%error, "malformed subscription frame");
            return Subscribed::Ignored;
        }
    };
    let ClientFrame::Subscribe { data } = frame;

    let types: Option<BTreeSet<String>> = if data.event_types.is_empty() {
        None
    } else {
        Some(data.event_types.iter().cloned().collect())
    };

    if data.aggregate_id.is_empty() {
        // Type-only or no-op subscription; nothing is snapshot-gated.
        let consumer = match types {
            Some(set) => state.engine.hub().subscribe_types(set),
            None => state.engine.hub().subscribe(ConsumerFilter::Nothing),
        };
        return Subscribed::Swapped(consumer, 0, String::new());
    }

    // Validate the aggregate path before touching the hub.
    let snapshot = match data.aggregate_id.as_slice() {
        [kind] if kind == "engine" => match state.engine.engine_state().await {
            Ok((engine_state, next_sequence)) => {
                let data = serde_json::to_value(&engine_state).unwrap_or(serde_json::Value::Null);
                Ok((data, next_sequence))
            }
            Err(error) => {
                tracing::warn!(%error, "engine snapshot failed");
                Err("snapshot unavailable".to_string())
            }
        },
        [kind, flow_id] if kind == "flow" => match state.engine.flow_snapshot(flow_id).await {
            Ok((flow, next_sequence)) => {
                let data = flow
                    .and_then(|f| serde_json::to_value(&f).ok())
                    .unwrap_or(serde_json::Value::Null);
                Ok((data, next_sequence))
            }
            Err(error) => {
                tracing::warn!(%error, "flow snapshot failed");
                Err("snapshot unavailable".to_string())
            }
        },
        other => Err(format!("invalid aggregate path: {other:?}")),
    };

    match snapshot {
        Ok((snapshot, next_sequence)) => {
            let prefix = AggregateId::from_segments(data.aggregate_id.clone());
            let consumer = state.engine.hub().subscribe_aggregate(prefix, types);
            let ack = frames::subscribed_frame(&data.aggregate_id, snapshot, next_sequence);
            Subscribed::Swapped(consumer, next_sequence, ack)
        }
        Err(reason) => Subscribed::Rejected(reason),
    }
}

async fn close_with(socket: &mut WebSocket, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: axum::extract::ws::close_code::POLICY,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// Drive one client connection until disconnect, cancellation, or overflow
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (client_id, cancel) = state.clients.register();

    // Placeholder consumer until the first subscribe frame arrives.
    let mut consumer = state.engine.hub().subscribe(ConsumerFilter::Nothing);
    let mut min_sequence: i64 = 0;

    let mut ping = tokio::time::interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
    let mut pong_deadline = Instant::now() + PONG_WAIT;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                close_with(&mut socket, "server shutting down").await;
                break;
            }

            () = tokio::time::sleep_until(pong_deadline) => {
                tracing::debug!(client = client_id, "pong deadline missed");
                break;
            }

            _ = ping.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }

            event = consumer.recv() => {
                match event {
                    Some(event) => {
                        // Stale relative to the snapshot the client holds.
                        if event.sequence < min_sequence {
                            continue;
                        }
                        let frame = frames::event_frame(&event);
                        if socket.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Dropped for falling behind, or hub teardown.
                        close_with(&mut socket, "event buffer overflow").await;
                        break;
                    }
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match apply_subscribe(&state, &text).await {
                            Subscribed::Swapped(new_consumer, sequence, ack) => {
                                consumer.close();
                                consumer = new_consumer;
                                min_sequence = sequence;
                                if !ack.is_empty()
                                    && socket.send(Message::Text(ack.into())).await.is_err()
                                {
                                    break;
                                }
                            }
                            Subscribed::Ignored => {}
                            Subscribed::Rejected(reason) => {
                                close_with(&mut socket, &reason).await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = Instant::now() + PONG_WAIT;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(Message::Binary(_))) => {}
                }
            }
        }
    }

    consumer.close();
    state.clients.remove(client_id);
}
