//! Chunk normalization
//!
//! Backends either resend the whole text so far on every update or send
//! only the new fragment. Downstream consumers always see the latest full
//! text of the turn, never a fragment.

use serde::{Deserialize, Serialize};

/// How the backend's chunk payloads relate to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkMode {
    /// Every chunk is the full text so far
    #[default]
    Cumulative,
    /// Every chunk is a new fragment to append
    Incremental,
}

#[derive(Debug, Clone)]
pub struct ChunkNormalizer {
    mode: ChunkMode,
    text: String,
}

impl ChunkNormalizer {
    pub fn new(mode: ChunkMode) -> Self {
        Self {
            mode,
            text: String::new(),
        }
    }

    /// Forget the current turn's text
    pub fn reset(&mut self) {
        self.text.clear();
    }

    /// Fold one chunk in and return the latest full text
    pub fn push(&mut self, chunk: &str) -> String {
        match self.mode {
            ChunkMode::Cumulative => {
                self.text.clear();
                self.text.push_str(chunk);
            }
            ChunkMode::Incremental => self.text.push_str(chunk),
        }
        self.text.clone()
    }
}
