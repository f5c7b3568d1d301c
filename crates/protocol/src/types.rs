//! Core types shared across the protocol

use serde::{Deserialize, Serialize};

/// Who authored a transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Assistant,
}

/// Role of an entry in the exchange log sent back as context.
///
/// Completed assistant turns are recorded as `system`, which is what the
/// backend expects in `previous_text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    User,
    System,
}

/// One entry of the compact exchange log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub content: String,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: HistoryRole::System,
            content: content.into(),
        }
    }
}

/// Latest goals/resources snapshot pushed alongside the text stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideChannelSnapshot {
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
}

impl SideChannelSnapshot {
    pub fn is_empty(&self) -> bool {
        self.goals.is_empty() && self.resources.is_empty()
    }
}

/// Why the client asked the backend to drop its per-connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    SubjectSwitch,
    NewSession,
}

/// Subject id as carried in `reset_session`; the backend uses "general" for
/// conversations that are not about a specific service user.
pub fn subject_label(subject_id: Option<&str>) -> String {
    match subject_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => "general".to_string(),
    }
}
