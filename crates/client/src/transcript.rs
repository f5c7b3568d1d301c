//! Ordered, append-only conversation transcript
//!
//! Only the trailing assistant message may change after it is appended, and
//! only until it is finalized.

use casework_protocol::Sender;
use serde::Serialize;

use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub sender: Sender,
    pub text: String,
    #[serde(rename = "final")]
    pub is_final: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn append_user(&mut self, text: &str) -> Result<(), SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::InvalidInput);
        }
        self.messages.push(Message {
            sender: Sender::User,
            text: text.to_string(),
            is_final: true,
        });
        Ok(())
    }

    /// Append the empty assistant message that streamed text will fill.
    pub fn append_placeholder_assistant(&mut self) -> Result<(), SessionError> {
        if self.has_open_assistant() {
            return Err(SessionError::ConflictingState(
                "an assistant message is still streaming".to_string(),
            ));
        }
        self.messages.push(Message {
            sender: Sender::Assistant,
            text: String::new(),
            is_final: false,
        });
        Ok(())
    }

    /// Replace the streaming assistant text. Returns false when there is no
    /// open assistant message.
    pub fn update_last_assistant(&mut self, text: &str) -> bool {
        match self.open_assistant() {
            Some(message) => {
                message.text.clear();
                message.text.push_str(text);
                true
            }
            None => false,
        }
    }

    /// Mark the streaming assistant message final and return its text.
    pub fn finalize_last_assistant(&mut self) -> Option<String> {
        let message = self.open_assistant()?;
        message.is_final = true;
        Some(message.text.clone())
    }

    pub fn has_open_assistant(&self) -> bool {
        matches!(
            self.messages.last(),
            Some(Message {
                sender: Sender::Assistant,
                is_final: false,
                ..
            })
        )
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    fn open_assistant(&mut self) -> Option<&mut Message> {
        self.messages
            .last_mut()
            .filter(|m| m.sender == Sender::Assistant && !m.is_final)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_user_text() {
        let mut transcript = Transcript::new();
        assert_eq!(transcript.append_user("   \n"), Err(SessionError::InvalidInput));
        assert!(transcript.is_empty());
    }

    #[test]
    fn user_text_is_trimmed() {
        let mut transcript = Transcript::new();
        transcript.append_user("  I need housing help ").unwrap();
        assert_eq!(transcript.messages()[0].text, "I need housing help");
        assert!(transcript.messages()[0].is_final);
    }

    #[test]
    fn only_one_open_placeholder() {
        let mut transcript = Transcript::new();
        transcript.append_user("hi").unwrap();
        transcript.append_placeholder_assistant().unwrap();
        assert!(matches!(
            transcript.append_placeholder_assistant(),
            Err(SessionError::ConflictingState(_))
        ));
        assert_eq!(transcript.len(), 2);
    }

    #[test]
    fn updates_replace_streaming_text() {
        let mut transcript = Transcript::new();
        transcript.append_user("hi").unwrap();
        transcript.append_placeholder_assistant().unwrap();

        assert!(transcript.update_last_assistant("Here"));
        assert!(transcript.update_last_assistant("Here are"));
        assert_eq!(transcript.last().unwrap().text, "Here are");
    }

    #[test]
    fn finalized_message_no_longer_changes() {
        let mut transcript = Transcript::new();
        transcript.append_user("hi").unwrap();
        transcript.append_placeholder_assistant().unwrap();
        transcript.update_last_assistant("done");

        assert_eq!(transcript.finalize_last_assistant().as_deref(), Some("done"));
        assert!(!transcript.update_last_assistant("stray"));
        assert!(transcript.finalize_last_assistant().is_none());
        assert_eq!(transcript.last().unwrap().text, "done");
        assert!(!transcript.has_open_assistant());
    }

    #[test]
    fn update_without_placeholder_is_a_no_op() {
        let mut transcript = Transcript::new();
        transcript.append_user("hi").unwrap();
        assert!(!transcript.update_last_assistant("text"));
        assert_eq!(transcript.len(), 1);
    }
}
