use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use huddle_proto::{ClientMessage, ServerMessage};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::handlers::SharedHub;

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(hub): State<SharedHub>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub, remote_addr))
}

async fn handle_socket(socket: WebSocket, hub: SharedHub, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let participant_id = hub.connect(tx.clone());

    // The hub drops its sender on eviction; closing the socket then ends the reader too.
    let writer_id = participant_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(participant_id = %writer_id, error = %err, "failed to encode server message"),
            }
        }
        let _ = sender.send(Message::Close(None)).await;
        debug!(participant_id = %writer_id, "writer task ended");
    });
    drop(tx);

    debug!(participant_id = %participant_id, %remote_addr, "websocket connected");

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(participant_id = %participant_id, error = %err, "websocket error");
                break;
            }
        };
        hub.touch(&participant_id);

        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(participant_id = %participant_id, "ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => {
                debug!(participant_id = %participant_id, message = message.name(), "client message");
                hub.handle(&participant_id, message);
            }
            Err(err) => {
                warn!(participant_id = %participant_id, error = %err, "failed to parse client message");
                hub.reject(&participant_id, format!("Invalid message format: {err}"));
            }
        }

        if !hub.is_connected(&participant_id) {
            break;
        }
    }

    hub.disconnect(&participant_id);
    let _ = writer.await;
    debug!(participant_id = %participant_id, %remote_addr, "websocket disconnected");
}
