//! Subject-switch confirmation
//!
//! Switching the subject of a conversation that already has content
//! discards it, so the switch is parked until the user confirms.

use serde::Serialize;

/// A switch waiting for confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSwitch {
    pub subject_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum SwitchDecision {
    /// Already the active subject
    NoChange,
    /// Nothing to lose; switched right away
    Immediate { subject_id: Option<String> },
    /// Waiting for `confirm` or `cancel`
    AwaitingConfirmation { subject_id: Option<String> },
    /// Another switch is already waiting
    Blocked,
}

#[derive(Debug, Clone, Default)]
pub struct SubjectSwitchGuard {
    pending: Option<PendingSwitch>,
}

impl SubjectSwitchGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_switch(
        &mut self,
        current: Option<&str>,
        requested: Option<String>,
        transcript_empty: bool,
    ) -> SwitchDecision {
        if self.pending.is_some() {
            return SwitchDecision::Blocked;
        }
        if current == requested.as_deref() {
            return SwitchDecision::NoChange;
        }
        if transcript_empty {
            return SwitchDecision::Immediate {
                subject_id: requested,
            };
        }
        self.pending = Some(PendingSwitch {
            subject_id: requested.clone(),
        });
        SwitchDecision::AwaitingConfirmation {
            subject_id: requested,
        }
    }

    /// Take the parked switch, if any
    pub fn confirm(&mut self) -> Option<PendingSwitch> {
        self.pending.take()
    }

    /// Drop the parked switch. Returns true when one was pending.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    pub fn pending(&self) -> Option<&PendingSwitch> {
        self.pending.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_subject_is_a_no_op() {
        let mut guard = SubjectSwitchGuard::new();
        assert_eq!(
            guard.request_switch(Some("su-1"), Some("su-1".to_string()), false),
            SwitchDecision::NoChange
        );
        assert_eq!(guard.request_switch(None, None, false), SwitchDecision::NoChange);
    }

    #[test]
    fn empty_transcript_switches_immediately() {
        let mut guard = SubjectSwitchGuard::new();
        let decision = guard.request_switch(None, Some("su-1".to_string()), true);
        assert_eq!(
            decision,
            SwitchDecision::Immediate {
                subject_id: Some("su-1".to_string())
            }
        );
        assert!(guard.pending().is_none());
    }

    #[test]
    fn pending_switch_blocks_further_requests() {
        let mut guard = SubjectSwitchGuard::new();
        guard.request_switch(None, Some("su-1".to_string()), false);
        assert_eq!(
            guard.request_switch(None, Some("su-2".to_string()), false),
            SwitchDecision::Blocked
        );
        assert_eq!(
            guard.pending().and_then(|p| p.subject_id.as_deref()),
            Some("su-1")
        );
    }

    #[test]
    fn cancel_and_confirm_clear_pending() {
        let mut guard = SubjectSwitchGuard::new();
        guard.request_switch(None, Some("su-1".to_string()), false);
        assert!(guard.cancel());
        assert!(!guard.cancel());

        guard.request_switch(None, Some("su-2".to_string()), false);
        let confirmed = guard.confirm().expect("pending switch");
        assert_eq!(confirmed.subject_id.as_deref(), Some("su-2"));
        assert!(guard.confirm().is_none());
    }
}
