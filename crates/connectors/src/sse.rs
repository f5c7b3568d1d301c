//! Server-Sent Events transport
//!
//! Each `start_generation` becomes a `POST` to the endpoint with
//! `Accept: text/event-stream`; the response body is parsed into backend
//! messages. Unnamed events carry incremental text with `<br/>` standing in
//! for newlines, and an event `id` doubles as the resume token sent back as
//! `Last-Event-ID`. The end of the response body completes the turn.
//!
//! ```text
//! id: 7
//! data: Here are a few<br/>options
//!
//! event: goals_update
//! data: {"goals":["Find stable housing"],"resources":[]}
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use casework_protocol::{ClientMessage, GenerationRequest, ServerMessage, SideChannelSnapshot};
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{ConnectorError, Frame, Link, Transport};

const LINK_CAPACITY: usize = 64;
const LAST_EVENT_ID: &str = "Last-Event-ID";

/// A parsed Server-Sent Event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
    pub id: Option<String>,
}

/// Incremental SSE parser fed with raw body bytes.
///
/// Lines may be split across network reads, including in the middle of a
/// multi-byte character, so bytes are buffered until a full line arrives.
#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
    event_type: Option<String>,
    data_lines: Vec<String>,
    id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of body bytes, returning every event it completes.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }

        events
    }

    /// Flush an event left open when the body ends without a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&raw).into_owned();
            self.process_line(line.strip_suffix('\r').unwrap_or(&line));
        }
        self.process_line("")
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.data_lines.is_empty() {
                self.event_type = None;
                return None;
            }
            return Some(SseEvent {
                event_type: self.event_type.take(),
                data: std::mem::take(&mut self.data_lines).join("\n"),
                id: self.id.take(),
            });
        }

        // Comment
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(pos) => {
                let value = &line[pos + 1..];
                (&line[..pos], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };
        match field {
            "data" => self.data_lines.push(value.to_string()),
            "event" => self.event_type = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Map one SSE event onto the backend message it carries.
pub fn to_server_message(event: SseEvent) -> Option<ServerMessage> {
    match event.event_type.as_deref() {
        None | Some("message") | Some("generation_update") => Some(ServerMessage::GenerationUpdate {
            chunk: event.data.replace("<br/>", "\n"),
            sequence_token: event.id,
        }),
        Some("conversation_id") => Some(ServerMessage::ConversationId {
            conversation_id: event.data.trim().to_string(),
        }),
        Some("goals_update") => match serde_json::from_str::<SideChannelSnapshot>(&event.data) {
            Ok(snapshot) => Some(ServerMessage::GoalsUpdate(snapshot)),
            Err(e) => {
                debug!(
                    component = "sse",
                    event = "sse.goals.unparsed",
                    error = %e,
                    "Skipping malformed goals update"
                );
                None
            }
        },
        Some("generation_complete") => Some(ServerMessage::GenerationComplete {
            message: Some(event.data).filter(|d| !d.is_empty()),
        }),
        Some("error") => Some(ServerMessage::Error {
            message: event.data,
        }),
        Some(other) => {
            debug!(
                component = "sse",
                event = "sse.event.unknown",
                event_type = other,
                "Skipping unknown event type"
            );
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct SseTransport {
    client: reqwest::Client,
    reset_url: Option<String>,
}

impl SseTransport {
    /// `reset_url` receives `reset_session` notices as JSON posts; without
    /// one they are dropped, since a plain SSE backend keeps no session.
    pub fn new(client: reqwest::Client, reset_url: Option<String>) -> Self {
        Self { client, reset_url }
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn name(&self) -> &'static str {
        "sse"
    }

    async fn open(&self, endpoint: &str) -> Result<Link, ConnectorError> {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientMessage>(LINK_CAPACITY);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(LINK_CAPACITY);
        let client = self.client.clone();
        let reset_url = self.reset_url.clone();
        let endpoint = endpoint.to_string();

        tokio::spawn(async move {
            let mut stream: Option<JoinHandle<()>> = None;

            while let Some(msg) = outbound_rx.recv().await {
                match msg {
                    ClientMessage::StartGeneration(request) => {
                        if let Some(previous) = stream.take() {
                            previous.abort();
                        }
                        stream = Some(tokio::spawn(run_request(
                            client.clone(),
                            endpoint.clone(),
                            request,
                            frame_tx.clone(),
                        )));
                    }
                    reset @ ClientMessage::ResetSession { .. } => {
                        let Some(url) = reset_url.clone() else {
                            debug!(
                                component = "sse",
                                event = "sse.reset.skipped",
                                "No reset endpoint configured"
                            );
                            continue;
                        };
                        let client = client.clone();
                        tokio::spawn(async move {
                            if let Err(e) = client.post(&url).json(&reset).send().await {
                                warn!(
                                    component = "sse",
                                    event = "sse.reset.failed",
                                    error = %e,
                                    "Reset notice not delivered"
                                );
                            }
                        });
                    }
                }
            }

            if let Some(stream) = stream {
                stream.abort();
            }
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: frame_rx,
        })
    }
}

async fn run_request(
    client: reqwest::Client,
    endpoint: String,
    request: GenerationRequest,
    frame_tx: mpsc::Sender<Frame>,
) {
    let mut builder = client
        .post(&endpoint)
        .header(ACCEPT, "text/event-stream")
        .header(CONTENT_TYPE, "application/json")
        .json(&request);
    if let Some(token) = &request.resume_token {
        builder = builder.header(LAST_EVENT_ID, token.as_str());
    }

    let response = match builder.send().await.and_then(|r| r.error_for_status()) {
        Ok(response) => response,
        Err(e) => {
            let _ = frame_tx
                .send(Frame::Closed {
                    reason: format!("request failed: {}", ConnectorError::Http(e)),
                })
                .await;
            return;
        }
    };

    let reason = forward_events(response.bytes_stream(), &frame_tx).await;
    match reason {
        Ok(()) => {
            let _ = frame_tx
                .send(Frame::Message(ServerMessage::GenerationComplete { message: None }))
                .await;
        }
        Err(reason) => {
            let _ = frame_tx.send(Frame::Closed { reason }).await;
        }
    }
}

/// Parse a response body into frames until it ends.
async fn forward_events(
    body: impl Stream<Item = Result<Bytes, reqwest::Error>>,
    frame_tx: &mpsc::Sender<Frame>,
) -> Result<(), String> {
    let mut body = Box::pin(body);
    let mut parser = SseParser::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| format!("stream interrupted: {e}"))?;
        for event in parser.feed(&chunk) {
            if let Some(msg) = to_server_message(event) {
                frame_tx
                    .send(Frame::Message(msg))
                    .await
                    .map_err(|_| "link dropped".to_string())?;
            }
        }
    }

    if let Some(msg) = parser.finish().and_then(to_server_message) {
        frame_tx
            .send(Frame::Message(msg))
            .await
            .map_err(|_| "link dropped".to_string())?;
    }
    Ok(())
}
