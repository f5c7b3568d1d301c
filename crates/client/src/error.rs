use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced to callers of the session controller
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Message text is empty")]
    InvalidInput,

    #[error("A generation is already in progress")]
    AlreadyInProgress,

    #[error("Channel is not connected yet")]
    ChannelNotReady,

    #[error("Conflicting state: {0}")]
    ConflictingState(String),

    #[error("Session actor is gone")]
    ActorClosed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}
