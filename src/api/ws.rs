//! WebSocket feed of domain events.
//!
//! Each connection gets its own broadcast subscription; events are forwarded
//! as JSON until the client disconnects. A subscriber that falls behind the
//! channel capacity misses the dropped events and keeps going.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::routes::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.events.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(missed)) => {
                        debug!(missed, "ws subscriber lagged, skipping");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let msg = match serde_json::to_string(&event) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("failed to serialize ws event: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {} // clients only listen on this feed
                    Some(Err(_)) => break,
                }
            }
        }
    }
}
