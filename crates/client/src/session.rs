//! Per-conversation identity: who the conversation is about, the
//! backend-assigned conversation id, and the resumption marker.

/// Identity of one dialogue session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub conversation_id: Option<String>,
    pub subject_id: Option<String>,
    pub last_sequence_token: Option<String>,
}

impl Session {
    pub fn new(subject_id: Option<String>) -> Self {
        Self {
            subject_id: normalize_subject(subject_id),
            ..Self::default()
        }
    }

    /// Record the conversation id the backend reported. A different id
    /// starts a new conversation, so the resume marker is dropped.
    /// Returns true when the id changed.
    pub fn assign_conversation(&mut self, conversation_id: String) -> bool {
        if conversation_id.is_empty()
            || self.conversation_id.as_deref() == Some(conversation_id.as_str())
        {
            return false;
        }
        self.conversation_id = Some(conversation_id);
        self.last_sequence_token = None;
        true
    }

    /// Advance the resume marker. Numeric tokens never move backwards;
    /// opaque tokens are taken in arrival order.
    pub fn advance_token(&mut self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let current = self
            .last_sequence_token
            .as_deref()
            .and_then(|t| t.parse::<u64>().ok());
        if let (Some(current), Ok(next)) = (current, token.parse::<u64>()) {
            if next < current {
                return false;
            }
        }
        self.last_sequence_token = Some(token.to_string());
        true
    }

    /// Forget everything but the subject
    pub fn restart(&mut self) {
        self.conversation_id = None;
        self.last_sequence_token = None;
    }
}

/// Empty subject ids mean a general inquiry.
pub fn normalize_subject(subject_id: Option<String>) -> Option<String> {
    subject_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && s != "general")
}
