//! Client → Backend messages

use serde::{Deserialize, Serialize};

use crate::types::{HistoryEntry, ResetReason};

/// Payload of one generation request.
///
/// `previous_text` holds the exchange log *before* this turn's user entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub text: String,
    #[serde(default)]
    pub previous_text: Vec<HistoryEntry>,
    pub subject_id: Option<String>,
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

impl GenerationRequest {
    /// The same request, re-targeted at the current conversation and
    /// carrying the resumption marker observed so far.
    pub fn resumed(&self, conversation_id: Option<String>, resume_token: Option<String>) -> Self {
        Self {
            conversation_id: conversation_id.or_else(|| self.conversation_id.clone()),
            resume_token,
            ..self.clone()
        }
    }
}

/// Messages sent from client to backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartGeneration(GenerationRequest),
    ResetSession {
        reason: ResetReason,
        previous_subject_id: String,
        new_subject_id: String,
    },
}
