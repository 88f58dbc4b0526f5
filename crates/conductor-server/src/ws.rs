//! The bidirectional message channel: `GET /ws` upgrades into a socket
//! bridged onto the notification bus.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};

use conductor_core::bus::ClientMessage;

use crate::routes::AppState;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if !state.config.enable_websockets {
        return (StatusCode::FORBIDDEN, "websockets are disabled").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// Pump envelopes out and client messages in until either side hangs up.
async fn handle_socket(state: AppState, socket: WebSocket) {
    let (connection_id, mut outbound) = state.bus.open();
    tracing::debug!(connection_id = %connection_id, "subscriber connected");

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else { break };
                let Ok(text) = serde_json::to_string(&envelope) else { continue };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(message) => {
                                state.bus.handle_client_message(connection_id, message);
                            }
                            Err(e) => {
                                tracing::debug!(
                                    connection_id = %connection_id,
                                    error = %e,
                                    "ignoring malformed client message"
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.bus.close(connection_id);
    tracing::debug!(connection_id = %connection_id, "subscriber disconnected");
}
