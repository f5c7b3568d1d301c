//! Backend → Client messages

use serde::{Deserialize, Serialize};

use crate::types::SideChannelSnapshot;

/// Messages sent from backend to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Lifecycle
    Welcome {
        #[serde(default)]
        message: String,
    },
    ConversationId {
        conversation_id: String,
    },

    // Generation stream
    GenerationUpdate {
        chunk: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_token: Option<String>,
    },
    GenerationComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    // Side channel
    GoalsUpdate(SideChannelSnapshot),

    ResetAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_subject_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_subject_id: Option<String>,
    },

    // Errors
    Error {
        message: String,
    },
}
