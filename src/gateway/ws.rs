use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::notify::NotificationHub;

use super::AppState;

/// Upgrade to a WebSocket and register the connection as observer
/// `client_id`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, client_id, state.hub))
}

/// Outbound hub messages are forwarded by a sender task; inbound frames are
/// handled here until the peer closes.
async fn handle_socket(socket: WebSocket, client_id: String, hub: Arc<NotificationHub>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    hub.register(&client_id, tx.clone());

    let (mut sink, mut stream) = socket.split();

    let sender_id = client_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                log::debug!("socket for observer {} closed", sender_id);
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let hub = Arc::clone(&hub);
                let observer = client_id.clone();
                let body = text.as_str().to_owned();
                let reply =
                    tokio::task::spawn_blocking(move || hub.handle_message(&observer, &body)).await;
                match reply {
                    Ok(Some(reply)) => {
                        if tx.send(reply).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => log::error!("observer {} message handler failed: {}", client_id, e),
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("observer {} receive error: {}", client_id, e);
                break;
            }
        }
    }

    hub.unregister_channel(&client_id, &tx);
    send_task.abort();
}
