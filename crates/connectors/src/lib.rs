//! Casework Connectors
//!
//! The duplex channel between the dialogue client and the generation
//! backend. A [`Transport`] opens raw links (WebSocket or SSE); the
//! [`ChannelAdapter`] wraps a transport with connect retry, chunk
//! normalization and epoch stamping, and turns backend frames into a fixed
//! set of [`ChannelEvent`]s.

pub mod adapter;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod normalize;
pub mod socket;
pub mod sse;

use std::time::Duration;

use async_trait::async_trait;
use casework_protocol::{ClientMessage, ServerMessage, SideChannelSnapshot};
use thiserror::Error;
use tokio::sync::mpsc;

pub use adapter::{ChannelAdapter, Envelope, Inbound};
pub use normalize::{ChunkMode, ChunkNormalizer};
pub use socket::WebSocketTransport;
pub use sse::SseTransport;

/// Errors that can occur in connectors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Channel not ready")]
    NotReady,

    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Connect attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Outbound queue full")]
    QueueFull,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Events emitted by the channel adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Channel is open and accepts submissions
    Connected,

    /// Backend assigned (or confirmed) the conversation id
    SessionAssigned { conversation_id: String },

    /// Latest full text of the current turn
    Chunk {
        text: String,
        sequence_token: Option<String>,
    },

    /// Goals/resources snapshot
    SideChannel(SideChannelSnapshot),

    /// Turn finished
    Completed,

    /// Backend reported an error
    Error { detail: String },

    /// Channel is gone (transport drop or connect retries exhausted)
    Disconnected { reason: String },
}

/// A raw frame delivered by a transport link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(ServerMessage),
    Closed { reason: String },
}

/// An open transport link: outbound client messages in, backend frames out.
pub struct Link {
    pub outbound: mpsc::Sender<ClientMessage>,
    pub inbound: mpsc::Receiver<Frame>,
}

/// Opens links to the generation backend.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn open(&self, endpoint: &str) -> Result<Link, ConnectorError>;
}

/// Connection settings for the adapter
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoint: String,
    pub chunk_mode: ChunkMode,
    pub max_connect_attempts: u32,
    pub connect_timeout: Duration,
    pub connect_backoff: Duration,
}

impl ChannelConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            chunk_mode: ChunkMode::Cumulative,
            max_connect_attempts: 5,
            connect_timeout: Duration::from_secs(20),
            connect_backoff: Duration::from_secs(1),
        }
    }
}
