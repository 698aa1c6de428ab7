//! WebSocket connection to the signaling server.

use futures_util::{SinkExt, StreamExt};
use huddle_proto::{ClientMessage, ServerMessage};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};
use url::Url;

use crate::manager::ManagerInput;
use crate::{MeshError, MeshResult};

/// Pumps [`ClientMessage`]s from the manager to the server and
/// [`ServerMessage`]s back into the manager's input channel.
///
/// The manager sees `ManagerInput::SignalingClosed` once the socket goes
/// away.
pub struct SignalingClient {
    url: Url,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn websocket_url(raw: &str) -> Result<Url, MeshError> {
    let url = Url::parse(raw).map_err(|err| MeshError::Signaling(format!("invalid url {raw}: {err}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(MeshError::Signaling(format!(
            "unsupported signaling scheme {other}"
        ))),
    }
}

impl SignalingClient {
    pub async fn connect(
        signaling_url: &str,
        mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
        inbound: mpsc::UnboundedSender<ManagerInput>,
        heartbeat: Duration,
    ) -> MeshResult<Self> {
        let url = websocket_url(signaling_url)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| MeshError::Signaling(format!("websocket connect failed: {err}")))?;
        debug!(url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let writer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                let message = tokio::select! {
                    message = outbound.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                    _ = ticker.tick() => ClientMessage::Ping,
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(kind = message.name(), error = %err, "failed to encode message");
                        continue;
                    }
                };
                trace!(event = "ws_out", kind = message.name(), len = text.len());
                if ws_write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.to_string(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!("ignoring non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!("signaling websocket closed: {err}");
                            }
                            _ => warn!("signaling websocket error: {err}"),
                        }
                        break;
                    }
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        trace!(event = "ws_in", kind = message.name(), len = text.len());
                        if inbound.send(ManagerInput::Server(message)).is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!(error = %err, "unparseable server message"),
                }
            }
            let _ = inbound.send(ManagerInput::SignalingClosed);
        });

        Ok(Self {
            url,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.tasks.lock().iter().all(JoinHandle::is_finished)
    }

    /// Stops both pumps without notifying the manager.
    pub fn close(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}
