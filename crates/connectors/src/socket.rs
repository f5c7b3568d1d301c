//! WebSocket transport
//!
//! One JSON message per text frame, in both directions. Frames that do not
//! parse as a known backend message are logged and skipped.

use async_trait::async_trait;
use casework_protocol::{ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::{ConnectorError, Frame, Link, Transport};

const LINK_CAPACITY: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn open(&self, endpoint: &str) -> Result<Link, ConnectorError> {
        let (ws_stream, _) = connect_async(endpoint)
            .await
            .map_err(|e| ConnectorError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientMessage>(LINK_CAPACITY);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(LINK_CAPACITY);

        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerMessage>(text.as_str()) {
                                Ok(parsed) => {
                                    if frame_tx.send(Frame::Message(parsed)).await.is_err() {
                                        break "link dropped".to_string();
                                    }
                                }
                                Err(e) => {
                                    debug!(
                                        component = "websocket",
                                        event = "websocket.frame.unparsed",
                                        error = %e,
                                        "Skipping unrecognized backend frame"
                                    );
                                }
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame
                                .map(|f| f.reason.to_string())
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "closed by backend".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break format!("websocket error: {e}"),
                        None => break "connection closed by backend".to_string(),
                    },
                    outgoing = outbound_rx.recv() => match outgoing {
                        Some(msg) => {
                            let json = match serde_json::to_string(&msg) {
                                Ok(json) => json,
                                Err(e) => {
                                    warn!(
                                        component = "websocket",
                                        event = "websocket.send.serialize_failed",
                                        error = %e,
                                        "Failed to serialize outbound message"
                                    );
                                    continue;
                                }
                            };
                            if let Err(e) = write.send(Message::Text(json.into())).await {
                                break format!("send error: {e}");
                            }
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            return;
                        }
                    },
                }
            };

            let _ = frame_tx.send(Frame::Closed { reason }).await;
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: frame_rx,
        })
    }
}
