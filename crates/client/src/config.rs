//! Client configuration
//!
//! Loaded from a TOML file; every field has a default so a partial (or
//! missing) file works. Environment overrides are applied on top by the
//! caller through [`ClientConfig::apply_env`].

use std::path::Path;
use std::time::Duration;

use casework_connectors::{ChannelConfig, ChunkMode};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::transition::RetryPolicy;

pub const ENDPOINT_ENV: &str = "CASEWORK_ENDPOINT";
pub const TRANSPORT_ENV: &str = "CASEWORK_TRANSPORT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Websocket,
    Sse,
}

impl TransportKind {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::Websocket),
            "sse" => Ok(Self::Sse),
            other => Err(ConfigError::Invalid(format!("unknown transport '{other}'"))),
        }
    }

    /// How the backend on this transport shapes its chunks
    pub fn default_chunk_mode(self) -> ChunkMode {
        match self {
            Self::Websocket => ChunkMode::Cumulative,
            Self::Sse => ChunkMode::Incremental,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub endpoint: String,
    pub transport: TransportKind,
    /// Unset means the transport's usual shape
    pub chunk_mode: Option<ChunkMode>,
    /// Assistant tool the conversation is routed to
    pub tool: Option<String>,
    pub subject_id: Option<String>,
    pub max_connect_attempts: u32,
    pub connect_timeout_ms: u64,
    pub connect_backoff_ms: u64,
    pub max_turn_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8000/ws".to_string(),
            transport: TransportKind::Websocket,
            chunk_mode: None,
            tool: None,
            subject_id: None,
            max_connect_attempts: 5,
            connect_timeout_ms: 20_000,
            connect_backoff_ms: 1_000,
            max_turn_retries: 2,
            retry_backoff_ms: 1_000,
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Apply `CASEWORK_ENDPOINT` / `CASEWORK_TRANSPORT` overrides.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup(ENDPOINT_ENV).filter(|v| !v.trim().is_empty()) {
            self.endpoint = endpoint.trim().to_string();
        }
        if let Some(transport) = lookup(TRANSPORT_ENV).filter(|v| !v.trim().is_empty()) {
            self.transport = TransportKind::parse(&transport)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint is empty".to_string()));
        }
        if self.max_connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_connect_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn chunk_mode(&self) -> ChunkMode {
        self.chunk_mode
            .unwrap_or_else(|| self.transport.default_chunk_mode())
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            endpoint: self.endpoint.clone(),
            chunk_mode: self.chunk_mode(),
            max_connect_attempts: self.max_connect_attempts,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            connect_backoff: Duration::from_millis(self.connect_backoff_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_turn_retries: self.max_turn_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// Where an SSE backend takes `reset_session` notices: a `reset_session`
    /// path next to the generation endpoint.
    pub fn reset_url(&self) -> String {
        let base = self
            .endpoint
            .split(|c: char| c == '?' || c == '#')
            .next()
            .unwrap_or(&self.endpoint)
            .trim_end_matches('/');
        let path_start = base.find("://").map_or(0, |i| i + 3);
        match base[path_start..].rfind('/') {
            Some(i) => format!("{}/reset_session", &base[..path_start + i]),
            None => format!("{base}/reset_session"),
        }
    }
}
