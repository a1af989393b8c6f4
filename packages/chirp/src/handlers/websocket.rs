//! WebSocket Handler
//!
//! One task per connection: registers with the conduit, pumps the endpoint's
//! outbox into the socket and forwards inbound frames to the conduit.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chirp_conduit::{Conduit, ConduitError, Payload, outbox};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::AppState;
use crate::metrics::ServerMetrics;

pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if state.conduit.is_closed() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let conduit = state.conduit.clone();
    let metrics = state.metrics.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, conduit, metrics))
}

fn to_message(payload: Payload) -> Message {
    match payload {
        Payload::Text(text) => Message::Text(text.into()),
        Payload::Binary(bytes) => Message::Binary(bytes.into()),
    }
}

/// Drive a single WebSocket connection until either side hangs up.
pub async fn handle_socket(socket: WebSocket, conduit: Arc<Conduit>, metrics: Arc<ServerMetrics>) {
    let (tx, mut rx) = outbox();
    let registration = match conduit.connect(tx).await {
        Ok(r) => r,
        Err(e) => {
            warn!("Rejecting WebSocket connection: {}", e);
            return;
        }
    };
    let endpoint = registration.endpoint;
    let sid = endpoint.session_id().clone();

    metrics.connection_opened();
    if registration.replaying > 0 {
        metrics.replay_scheduled(registration.replaying);
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task to send queued payloads to the WebSocket
    let watch = endpoint.clone();
    let sender_task = async move {
        loop {
            tokio::select! {
                biased;
                queued = rx.recv() => {
                    let Some(payload) = queued else { break };
                    if ws_sender.send(to_message(payload)).await.is_err() {
                        break;
                    }
                }
                _ = watch.retired() => {
                    // Flush anything queued before retirement (e.g. a final broadcast)
                    while let Ok(payload) = rx.try_recv() {
                        if ws_sender.send(to_message(payload)).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    };

    // Task to forward incoming frames to the conduit
    let input_task = async {
        while let Some(msg) = ws_receiver.next().await {
            let payload = match msg {
                Ok(Message::Text(text)) => Payload::Text(text.as_str().to_owned()),
                Ok(Message::Binary(bytes)) => Payload::Binary(bytes.to_vec()),
                Ok(Message::Close(_)) => break,
                // Ping/pong are answered by axum
                Ok(_) => continue,
                Err(e) => {
                    debug!(sid = %sid, "WebSocket receive error: {}", e);
                    break;
                }
            };
            metrics.message_received();
            if let Err(e) = conduit.write(payload).await {
                debug!(sid = %sid, "Dropping inbound message: {}", e);
                break;
            }
        }
    };

    tokio::select! {
        _ = sender_task => {}
        _ = input_task => {}
    }

    metrics.connection_closed();
    if let Err(e) = conduit.disconnect(&endpoint).await {
        fatal(e);
    }
    debug!(sid = %sid, "WebSocket connection closed");
}

/// A corrupt pool cannot be recovered from; take the process down.
fn fatal(e: ConduitError) -> ! {
    error!("{}", e);
    std::process::abort();
}
