//! `GET /ws` (§4.I): streams bus events as tagged JSON frames.
//!
//! Grounded in the donor's `handle_websocket`/`handle_ws_connection` shape
//! (mpsc forwarding task + a drain task), generalized to forward every
//! `CoreEvent` variant instead of the donor's hand-picked subset, and to
//! poll both of the bus's status/progress receivers instead of one.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use dlman_core::DlmanCore;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

pub async fn upgrade(ws: WebSocketUpgrade, State(core): State<DlmanCore>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, core))
}

async fn handle_connection(socket: WebSocket, core: DlmanCore) {
    use futures_util::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(128);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let mut subscription = core.subscribe();
    let forward_tx = tx.clone();
    let forward_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                result = subscription.status.recv() => result,
                result = subscription.progress.recv() => result,
            };
            match event {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        if forward_tx.send(json).await.is_err() {
                            break;
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "control server ws subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Text(_)) | Ok(Message::Binary(_)) => {
                // Inbound frames are ignored: every mutation goes through
                // HTTP REST, the socket is events-only (§4.I).
            }
        }
    }

    forward_task.abort();
    send_task.abort();
}
