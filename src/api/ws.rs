//! WebSocket stream of feed snapshots.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use tracing::{debug, warn};

use crate::api::routes::AppState;
use crate::feed::session::FeedSnapshot;

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode(snapshot: &FeedSnapshot) -> Option<String> {
    match serde_json::to_string(snapshot) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, "Failed to serialize feed snapshot");
            None
        }
    }
}

/// Current snapshot on connect, then one frame per change.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.feed.subscribe();

    let initial = encode(&rx.borrow_and_update());
    if let Some(text) = initial {
        if socket.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    debug!("feed session closed; ending snapshot stream");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                let text = encode(&rx.borrow_and_update());
                if let Some(text) = text {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        let _ = socket.send(Message::Text("pong".to_string())).await;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
