//! What to do when the host shell gains or loses the user's attention.
//!
//! The host reports two neutral signals, foreground and background. Going
//! to the background never tears anything down; it only holds back the
//! automatic retry timer. Coming back resumes a failed turn once, or
//! reopens a dropped channel when nothing is in flight.

use crate::transition::GenerationState;

/// The parts of session state the policy looks at
#[derive(Debug, Clone, Copy)]
pub struct ResumeView {
    pub phase: GenerationState,
    pub has_pending_turn: bool,
    pub resume_in_flight: bool,
    pub channel_ready: bool,
    pub connecting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForegroundAction {
    /// Reconnect and resubmit the failed turn
    Resume,
    /// Reopen the channel
    Reconnect,
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundAction {
    /// Cancel the armed retry and replay it on the next foreground
    DeferRetry,
    Nothing,
}

pub fn on_foreground(view: &ResumeView) -> ForegroundAction {
    match view.phase {
        GenerationState::Errored if view.has_pending_turn && !view.resume_in_flight => {
            ForegroundAction::Resume
        }
        GenerationState::Idle if !view.channel_ready && !view.connecting => {
            ForegroundAction::Reconnect
        }
        _ => ForegroundAction::Nothing,
    }
}

pub fn on_background(retry_scheduled: bool) -> BackgroundAction {
    if retry_scheduled {
        BackgroundAction::DeferRetry
    } else {
        BackgroundAction::Nothing
    }
}
