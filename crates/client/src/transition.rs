//! Pure state transition function
//!
//! All generation lifecycle logic lives here as a pure, synchronous
//! function: `transition(state, input) -> (state, effects)`. The session
//! actor feeds it user commands, channel events and timer expiries, then
//! executes the returned effects.

use std::time::Duration;

use casework_connectors::{ChannelEvent, Envelope};
use casework_protocol::{
    subject_label, GenerationRequest, HistoryEntry, ResetReason, SideChannelSnapshot,
};
use serde::Serialize;

use crate::error::SessionError;
use crate::session::{normalize_subject, Session};
use crate::side_channel::SideChannelStore;
use crate::subject_guard::{PendingSwitch, SubjectSwitchGuard, SwitchDecision};
use crate::transcript::{Message, Transcript};
use crate::visibility::{self, BackgroundAction, ForegroundAction, ResumeView};

// ---------------------------------------------------------------------------
// GenerationState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Idle,
    Awaiting,
    Streaming,
    /// Passed through on the way back to `Idle`
    Complete,
    Errored,
}

/// Retry limits for a failed turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_turn_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_turn_retries: 2,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Linear backoff: the nth retry waits n times the base delay
    pub fn delay(&self, attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(attempt.max(1))
    }
}

/// The request of the turn currently in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTurn {
    pub turn: u64,
    pub request: GenerationRequest,
    pub attempts: u32,
    pub exhausted: bool,
}

// ---------------------------------------------------------------------------
// TransitionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransitionState {
    pub phase: GenerationState,
    pub session: Session,
    pub transcript: Transcript,
    pub history: Vec<HistoryEntry>,
    pub side_channel: SideChannelStore,
    pub guard: SubjectSwitchGuard,
    /// Increases on every submit and never resets
    pub turn: u64,
    pub pending: Option<PendingTurn>,
    pub channel_ready: bool,
    pub connecting: bool,
    pub foreground: bool,
    pub resume_in_flight: bool,
    pub retry_scheduled: bool,
    pub retry_deferred: bool,
    pub retry: RetryPolicy,
    pub tool: Option<String>,
}

impl TransitionState {
    pub fn new(subject_id: Option<String>, tool: Option<String>, retry: RetryPolicy) -> Self {
        Self {
            phase: GenerationState::Idle,
            session: Session::new(subject_id),
            transcript: Transcript::new(),
            history: Vec::new(),
            side_channel: SideChannelStore::new(),
            guard: SubjectSwitchGuard::new(),
            turn: 0,
            pending: None,
            channel_ready: false,
            connecting: false,
            foreground: true,
            resume_in_flight: false,
            retry_scheduled: false,
            retry_deferred: false,
            retry,
            tool,
        }
    }

    fn resume_view(&self) -> ResumeView {
        ResumeView {
            phase: self.phase,
            has_pending_turn: self.pending.is_some(),
            resume_in_flight: self.resume_in_flight,
            channel_ready: self.channel_ready,
            connecting: self.connecting,
        }
    }

    /// Whether events for `turn` may still touch the transcript
    fn accepts_turn(&self, turn: u64) -> bool {
        let live = match self.phase {
            GenerationState::Awaiting | GenerationState::Streaming => true,
            GenerationState::Errored => self.resume_in_flight,
            GenerationState::Idle | GenerationState::Complete => false,
        };
        live && self.pending.as_ref().is_some_and(|p| p.turn == turn)
    }

    fn holds_exhausted_turn(&self) -> bool {
        self.phase == GenerationState::Errored
            && !self.resume_in_flight
            && self.pending.as_ref().is_some_and(|p| p.exhausted)
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Input {
    Submit { text: String },
    Channel(Envelope),
    /// Sending the request for `turn` failed before it reached the channel
    SendFailed { turn: u64, reason: String },
    RetryDue { turn: u64 },
    Foreground,
    Background,
    NewSession,
    RequestSwitch { subject_id: Option<String> },
    ConfirmSwitch,
    CancelSwitch,
    Abandon,
}

// ---------------------------------------------------------------------------
// Effects: IO for the actor to perform
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Tear down any existing channel and open a new one
    Connect,
    Teardown,
    Send {
        turn: u64,
        request: GenerationRequest,
    },
    ScheduleRetry {
        turn: u64,
        delay: Duration,
    },
    CancelRetry,
    NotifyReset {
        reason: ResetReason,
        previous_subject_id: String,
        new_subject_id: String,
    },
    Emit(SessionUpdate),
    Respond(Response),
}

/// Answer to the command that produced the input
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Submitted { turn: u64 },
    Done,
    Switch(SwitchDecision),
    Rejected(SessionError),
}

/// Change notifications for subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    PhaseChanged(GenerationState),
    ChannelStatus {
        ready: bool,
    },
    UserMessage {
        text: String,
    },
    /// Latest full text of the streaming assistant message
    AssistantText {
        text: String,
    },
    TurnCompleted {
        text: String,
    },
    TurnFailed {
        reason: String,
        attempt: u32,
        exhausted: bool,
    },
    TurnAbandoned,
    ConversationAssigned {
        conversation_id: String,
    },
    SideChannel(SideChannelSnapshot),
    SwitchPending {
        subject_id: Option<String>,
    },
    SwitchCancelled,
    SubjectChanged {
        subject_id: Option<String>,
    },
    SessionReset {
        reason: ResetReason,
        subject_id: Option<String>,
    },
}

/// Read-only view published after every transition
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub phase: GenerationState,
    pub messages: Vec<Message>,
    pub subject_id: Option<String>,
    pub conversation_id: Option<String>,
    pub side_channel: SideChannelSnapshot,
    pub channel_ready: bool,
    pub foreground: bool,
    pub pending_switch: Option<PendingSwitch>,
    pub attempts: u32,
    pub exhausted: bool,
}

impl SessionSnapshot {
    pub fn from_state(id: &str, state: &TransitionState) -> Self {
        Self {
            id: id.to_string(),
            phase: state.phase,
            messages: state.transcript.messages().to_vec(),
            subject_id: state.session.subject_id.clone(),
            conversation_id: state.session.conversation_id.clone(),
            side_channel: state.side_channel.snapshot().clone(),
            channel_ready: state.channel_ready,
            foreground: state.foreground,
            pending_switch: state.guard.pending().cloned(),
            attempts: state.pending.as_ref().map_or(0, |p| p.attempts),
            exhausted: state.pending.as_ref().is_some_and(|p| p.exhausted),
        }
    }
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// Pure, synchronous state transition.
///
/// Given the current state and an input, returns the new state and the
/// effects (channel calls, timers, notifications, replies) to execute.
pub fn transition(mut state: TransitionState, input: Input) -> (TransitionState, Vec<Effect>) {
    let mut effects: Vec<Effect> = Vec::new();

    match input {
        // -- Submission -------------------------------------------------------
        Input::Submit { text } => {
            // A turn that ran out of retries gives way to a fresh one.
            if state.holds_exhausted_turn() && state.channel_ready && !text.trim().is_empty() {
                abandon_turn(&mut state, &mut effects);
            }
            match submit(&mut state, &text) {
                Ok((turn, request)) => {
                    let text = request.text.clone();
                    effects.push(Effect::Send { turn, request });
                    effects.push(Effect::Emit(SessionUpdate::UserMessage { text }));
                    effects.push(Effect::Emit(SessionUpdate::PhaseChanged(state.phase)));
                    effects.push(Effect::Respond(Response::Submitted { turn }));
                }
                Err(e) => effects.push(Effect::Respond(Response::Rejected(e))),
            }
        }

        // -- Channel events ---------------------------------------------------
        Input::Channel(Envelope { turn, event }) => {
            channel_event(&mut state, &mut effects, turn, event);
        }

        Input::SendFailed { turn, reason } => {
            if state.pending.as_ref().is_some_and(|p| p.turn == turn) {
                fail_turn(&mut state, &mut effects, reason);
            }
        }

        // -- Retry ------------------------------------------------------------
        Input::RetryDue { turn } => {
            let due = state.retry_scheduled
                && state.phase == GenerationState::Errored
                && state.pending.as_ref().is_some_and(|p| p.turn == turn);
            state.retry_scheduled = false;
            if due {
                if state.foreground {
                    start_resume(&mut state, &mut effects);
                } else {
                    state.retry_deferred = true;
                }
            }
        }

        // -- Visibility -------------------------------------------------------
        Input::Foreground => {
            state.foreground = true;
            match visibility::on_foreground(&state.resume_view()) {
                ForegroundAction::Resume => {
                    if state.retry_scheduled {
                        state.retry_scheduled = false;
                        effects.push(Effect::CancelRetry);
                    }
                    start_resume(&mut state, &mut effects);
                }
                ForegroundAction::Reconnect => {
                    state.connecting = true;
                    effects.push(Effect::Connect);
                }
                ForegroundAction::Nothing => {}
            }
        }

        Input::Background => {
            state.foreground = false;
            if visibility::on_background(state.retry_scheduled) == BackgroundAction::DeferRetry {
                state.retry_scheduled = false;
                state.retry_deferred = true;
                effects.push(Effect::CancelRetry);
            }
        }

        // -- Session reset ----------------------------------------------------
        Input::NewSession => {
            let subject = state.session.subject_id.clone();
            reset_session(&mut state, &mut effects, ResetReason::NewSession, subject);
            effects.push(Effect::Respond(Response::Done));
        }

        Input::RequestSwitch { subject_id } => {
            let requested = normalize_subject(subject_id);
            let decision = state.guard.request_switch(
                state.session.subject_id.as_deref(),
                requested,
                state.transcript.is_empty(),
            );
            match &decision {
                SwitchDecision::Immediate { subject_id } => {
                    state.session.subject_id = subject_id.clone();
                    effects.push(Effect::Emit(SessionUpdate::SubjectChanged {
                        subject_id: subject_id.clone(),
                    }));
                }
                SwitchDecision::AwaitingConfirmation { subject_id } => {
                    effects.push(Effect::Emit(SessionUpdate::SwitchPending {
                        subject_id: subject_id.clone(),
                    }));
                }
                SwitchDecision::NoChange | SwitchDecision::Blocked => {}
            }
            effects.push(Effect::Respond(Response::Switch(decision)));
        }

        Input::ConfirmSwitch => match state.guard.confirm() {
            Some(PendingSwitch { subject_id }) => {
                reset_session(&mut state, &mut effects, ResetReason::SubjectSwitch, subject_id);
                effects.push(Effect::Respond(Response::Done));
            }
            None => effects.push(Effect::Respond(Response::Rejected(
                SessionError::ConflictingState("no subject switch is pending".to_string()),
            ))),
        },

        Input::CancelSwitch => {
            if state.guard.cancel() {
                effects.push(Effect::Emit(SessionUpdate::SwitchCancelled));
            }
            effects.push(Effect::Respond(Response::Done));
        }

        // -- Abandon ----------------------------------------------------------
        Input::Abandon => {
            if state.phase == GenerationState::Errored && state.pending.is_some() {
                abandon_turn(&mut state, &mut effects);
                effects.push(Effect::Respond(Response::Done));
            } else {
                effects.push(Effect::Respond(Response::Rejected(
                    SessionError::ConflictingState("no failed turn to abandon".to_string()),
                )));
            }
        }
    }

    (state, effects)
}

fn submit(
    state: &mut TransitionState,
    text: &str,
) -> Result<(u64, GenerationRequest), SessionError> {
    if state.phase != GenerationState::Idle {
        return Err(SessionError::AlreadyInProgress);
    }
    let text = text.trim();
    if text.is_empty() {
        return Err(SessionError::InvalidInput);
    }
    if !state.channel_ready {
        return Err(SessionError::ChannelNotReady);
    }

    state.transcript.append_user(text)?;
    state.transcript.append_placeholder_assistant()?;

    let previous_text = state.history.clone();
    state.history.push(HistoryEntry::user(text));

    state.turn += 1;
    let request = GenerationRequest {
        text: text.to_string(),
        previous_text,
        subject_id: state.session.subject_id.clone(),
        conversation_id: state.session.conversation_id.clone(),
        resume_token: None,
        tool: state.tool.clone(),
    };
    state.pending = Some(PendingTurn {
        turn: state.turn,
        request: request.clone(),
        attempts: 0,
        exhausted: false,
    });
    state.phase = GenerationState::Awaiting;
    Ok((state.turn, request))
}

fn channel_event(
    state: &mut TransitionState,
    effects: &mut Vec<Effect>,
    turn: u64,
    event: ChannelEvent,
) {
    match event {
        ChannelEvent::Connected => {
            state.channel_ready = true;
            state.connecting = false;
            effects.push(Effect::Emit(SessionUpdate::ChannelStatus { ready: true }));

            if state.resume_in_flight && state.phase == GenerationState::Errored {
                if let Some(pending) = &state.pending {
                    let request = pending.request.resumed(
                        state.session.conversation_id.clone(),
                        state.session.last_sequence_token.clone(),
                    );
                    effects.push(Effect::Send {
                        turn: pending.turn,
                        request,
                    });
                }
            }
        }

        ChannelEvent::SessionAssigned { conversation_id } => {
            if state.session.assign_conversation(conversation_id.clone()) {
                effects.push(Effect::Emit(SessionUpdate::ConversationAssigned {
                    conversation_id,
                }));
            }
        }

        ChannelEvent::SideChannel(snapshot) => {
            state.side_channel.apply(snapshot.clone());
            effects.push(Effect::Emit(SessionUpdate::SideChannel(snapshot)));
        }

        ChannelEvent::Chunk {
            text,
            sequence_token,
        } => {
            if !state.accepts_turn(turn) {
                return;
            }
            state.transcript.update_last_assistant(&text);
            if let Some(token) = sequence_token.as_deref() {
                state.session.advance_token(token);
            }
            state.resume_in_flight = false;
            if state.phase != GenerationState::Streaming {
                state.phase = GenerationState::Streaming;
                effects.push(Effect::Emit(SessionUpdate::PhaseChanged(state.phase)));
            }
            effects.push(Effect::Emit(SessionUpdate::AssistantText { text }));
        }

        ChannelEvent::Completed => {
            if !state.accepts_turn(turn) {
                return;
            }
            let text = state.transcript.finalize_last_assistant().unwrap_or_default();
            state.history.push(HistoryEntry::system(text.clone()));
            clear_turn(state);

            state.phase = GenerationState::Complete;
            effects.push(Effect::Emit(SessionUpdate::PhaseChanged(state.phase)));
            effects.push(Effect::Emit(SessionUpdate::TurnCompleted { text }));
            state.phase = GenerationState::Idle;
            effects.push(Effect::Emit(SessionUpdate::PhaseChanged(state.phase)));
        }

        ChannelEvent::Error { detail } => {
            if state.accepts_turn(turn) {
                fail_turn(state, effects, detail);
            }
        }

        ChannelEvent::Disconnected { reason } => {
            // Only a link that was up gets reopened here; a drop reported
            // after the connect attempts ran out is final until foreground.
            let was_ready = state.channel_ready;
            state.channel_ready = false;
            state.connecting = false;
            effects.push(Effect::Emit(SessionUpdate::ChannelStatus { ready: false }));
            if state.accepts_turn(turn) {
                fail_turn(state, effects, reason);
            }
            if was_ready && state.foreground && !state.retry_scheduled && !state.resume_in_flight {
                state.connecting = true;
                effects.push(Effect::Connect);
            }
        }
    }
}

/// Count a failure of the pending turn and decide whether to retry.
fn fail_turn(state: &mut TransitionState, effects: &mut Vec<Effect>, reason: String) {
    let Some(pending) = state.pending.as_mut() else {
        return;
    };
    pending.attempts += 1;
    let attempt = pending.attempts;
    let turn = pending.turn;
    let exhausted = attempt > state.retry.max_turn_retries;
    pending.exhausted = exhausted;

    state.resume_in_flight = false;
    if state.phase != GenerationState::Errored {
        state.phase = GenerationState::Errored;
        effects.push(Effect::Emit(SessionUpdate::PhaseChanged(state.phase)));
    }

    if !exhausted {
        if state.foreground {
            state.retry_scheduled = true;
            effects.push(Effect::ScheduleRetry {
                turn,
                delay: state.retry.delay(attempt),
            });
        } else {
            state.retry_deferred = true;
        }
    }

    effects.push(Effect::Emit(SessionUpdate::TurnFailed {
        reason,
        attempt,
        exhausted,
    }));
}

/// Reconnect; the stored request goes out again once `Connected` arrives.
fn start_resume(state: &mut TransitionState, effects: &mut Vec<Effect>) {
    state.resume_in_flight = true;
    state.retry_deferred = false;
    state.channel_ready = false;
    state.connecting = true;
    effects.push(Effect::Connect);
}

/// Give up on the failed turn, keeping whatever text it produced.
fn abandon_turn(state: &mut TransitionState, effects: &mut Vec<Effect>) {
    if state.retry_scheduled {
        effects.push(Effect::CancelRetry);
    }
    if let Some(text) = state.transcript.finalize_last_assistant() {
        if !text.is_empty() {
            state.history.push(HistoryEntry::system(text));
        }
    }
    clear_turn(state);
    state.phase = GenerationState::Idle;
    effects.push(Effect::Emit(SessionUpdate::TurnAbandoned));
    effects.push(Effect::Emit(SessionUpdate::PhaseChanged(state.phase)));
}

fn clear_turn(state: &mut TransitionState) {
    state.pending = None;
    state.resume_in_flight = false;
    state.retry_scheduled = false;
    state.retry_deferred = false;
}

fn reset_session(
    state: &mut TransitionState,
    effects: &mut Vec<Effect>,
    reason: ResetReason,
    subject_id: Option<String>,
) {
    let previous_subject_id = subject_label(state.session.subject_id.as_deref());

    state.transcript.clear();
    state.history.clear();
    state.side_channel.clear();
    state.session.restart();
    state.session.subject_id = subject_id;
    state.guard.cancel();
    clear_turn(state);
    state.phase = GenerationState::Idle;
    state.channel_ready = false;
    state.connecting = true;

    effects.push(Effect::CancelRetry);
    effects.push(Effect::Teardown);
    effects.push(Effect::Connect);
    effects.push(Effect::NotifyReset {
        reason,
        previous_subject_id,
        new_subject_id: subject_label(state.session.subject_id.as_deref()),
    });
    effects.push(Effect::Emit(SessionUpdate::SessionReset {
        reason,
        subject_id: state.session.subject_id.clone(),
    }));
    effects.push(Effect::Emit(SessionUpdate::PhaseChanged(state.phase)));
}

#[cfg(test)]
mod tests {
    use casework_protocol::{HistoryRole, Sender};

    use super::*;

    fn test_state() -> TransitionState {
        let mut state =
            TransitionState::new(None, Some("wellness".to_string()), RetryPolicy::default());
        state.channel_ready = true;
        state
    }

    fn apply(state: TransitionState, input: Input) -> (TransitionState, Vec<Effect>) {
        transition(state, input)
    }

    fn event(turn: u64, event: ChannelEvent) -> Input {
        Input::Channel(Envelope { turn, event })
    }

    fn chunk(turn: u64, text: &str) -> Input {
        event(
            turn,
            ChannelEvent::Chunk {
                text: text.to_string(),
                sequence_token: None,
            },
        )
    }

    fn error(turn: u64) -> Input {
        event(
            turn,
            ChannelEvent::Error {
                detail: "backend failed".to_string(),
            },
        )
    }

    fn response(effects: &[Effect]) -> Option<&Response> {
        effects.iter().find_map(|e| match e {
            Effect::Respond(r) => Some(r),
            _ => None,
        })
    }

    fn submitted(text: &str) -> (TransitionState, u64) {
        let (state, effects) = apply(test_state(), Input::Submit { text: text.to_string() });
        match response(&effects) {
            Some(Response::Submitted { turn }) => (state, *turn),
            other => panic!("submit not accepted: {:?}", other),
        }
    }

    fn texts(state: &TransitionState) -> Vec<(Sender, &str)> {
        state
            .transcript
            .messages()
            .iter()
            .map(|m| (m.sender, m.text.as_str()))
            .collect()
    }

    #[test]
    fn housing_help_turn_streams_and_completes() {
        let (state, turn) = submitted("I need housing help");
        assert_eq!(state.phase, GenerationState::Awaiting);

        let (state, _) = apply(state, chunk(turn, "Here"));
        assert_eq!(state.phase, GenerationState::Streaming);
        let (state, _) = apply(state, chunk(turn, "Here are"));
        let (state, effects) = apply(state, event(turn, ChannelEvent::Completed));

        assert_eq!(
            texts(&state),
            vec![
                (Sender::User, "I need housing help"),
                (Sender::Assistant, "Here are"),
            ]
        );
        assert!(state.transcript.messages().iter().all(|m| m.is_final));
        assert_eq!(state.phase, GenerationState::Idle);

        let phases: Vec<_> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(SessionUpdate::PhaseChanged(p)) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(phases, vec![GenerationState::Complete, GenerationState::Idle]);

        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[1].role, HistoryRole::System);
        assert_eq!(state.history[1].content, "Here are");
    }

    #[test]
    fn submit_sends_history_before_this_turn() {
        let (state, turn) = submitted("first");
        let (state, _) = apply(state, chunk(turn, "answer"));
        let (state, _) = apply(state, event(turn, ChannelEvent::Completed));

        let (state, effects) = apply(state, Input::Submit { text: "second".to_string() });
        let request = effects
            .iter()
            .find_map(|e| match e {
                Effect::Send { request, .. } => Some(request.clone()),
                _ => None,
            })
            .expect("send effect");

        assert_eq!(request.text, "second");
        assert_eq!(request.tool.as_deref(), Some("wellness"));
        assert_eq!(
            request.previous_text,
            vec![HistoryEntry::user("first"), HistoryEntry::system("answer")]
        );
        assert_eq!(state.history.len(), 3);
    }

    #[test]
    fn submit_while_busy_is_rejected_without_new_message() {
        let (state, turn) = submitted("hi");
        let (state, _) = apply(state, chunk(turn, "partial"));

        let (state, effects) = apply(state, Input::Submit { text: "again".to_string() });
        assert_eq!(
            response(&effects),
            Some(&Response::Rejected(SessionError::AlreadyInProgress))
        );
        assert!(!effects.iter().any(|e| matches!(e, Effect::Send { .. })));
        assert_eq!(state.transcript.len(), 2);

        let (state, _) = apply(state, error(turn));
        let (state, effects) = apply(state, Input::Submit { text: "again".to_string() });
        assert_eq!(
            response(&effects),
            Some(&Response::Rejected(SessionError::AlreadyInProgress))
        );
        assert_eq!(state.transcript.len(), 2);
    }

    #[test]
    fn submit_validates_text_and_channel() {
        let (state, effects) = apply(test_state(), Input::Submit { text: "  ".to_string() });
        assert_eq!(
            response(&effects),
            Some(&Response::Rejected(SessionError::InvalidInput))
        );
        assert!(state.transcript.is_empty());

        let mut state = test_state();
        state.channel_ready = false;
        let (state, effects) = apply(state, Input::Submit { text: "hi".to_string() });
        assert_eq!(
            response(&effects),
            Some(&Response::Rejected(SessionError::ChannelNotReady))
        );
        assert_eq!(state.phase, GenerationState::Idle);
        assert!(state.history.is_empty());
    }

    #[test]
    fn late_chunk_after_completion_is_ignored() {
        let (state, turn) = submitted("hi");
        let (state, _) = apply(state, chunk(turn, "final"));
        let (state, _) = apply(state, event(turn, ChannelEvent::Completed));
        let (state, effects) = apply(state, chunk(turn, "stray"));

        assert!(effects.is_empty());
        assert_eq!(state.transcript.last().unwrap().text, "final");
        assert_eq!(state.phase, GenerationState::Idle);
    }

    #[test]
    fn chunk_for_an_older_turn_is_ignored() {
        let (state, turn) = submitted("hi");
        let (state, _) = apply(state, event(turn, ChannelEvent::Completed));
        let (state, _) = apply(state, Input::Submit { text: "next".to_string() });

        let (state, effects) = apply(state, chunk(turn, "from the old turn"));
        assert!(effects.is_empty());
        assert_eq!(state.transcript.last().unwrap().text, "");
        assert_eq!(state.phase, GenerationState::Awaiting);
    }

    #[test]
    fn last_text_is_latest_chunk_not_concatenation() {
        let (mut state, turn) = submitted("hi");
        for text in ["A", "A quick", "A quick answer"] {
            state = apply(state, chunk(turn, text)).0;
        }
        let (state, _) = apply(state, event(turn, ChannelEvent::Completed));
        assert_eq!(state.transcript.last().unwrap().text, "A quick answer");
    }

    #[test]
    fn error_schedules_linear_retry_then_resumes() {
        let (state, turn) = submitted("hi");
        let (state, _) = apply(
            state,
            event(
                turn,
                ChannelEvent::Chunk {
                    text: "Here".to_string(),
                    sequence_token: Some("3".to_string()),
                },
            ),
        );
        let (state, _) = apply(
            state,
            event(
                turn,
                ChannelEvent::SessionAssigned {
                    conversation_id: "conv-1".to_string(),
                },
            ),
        );
        // A fresh conversation id drops the marker seen before it
        let (state, _) = apply(
            state,
            event(
                turn,
                ChannelEvent::Chunk {
                    text: "Here are".to_string(),
                    sequence_token: Some("4".to_string()),
                },
            ),
        );

        let (state, effects) = apply(state, error(turn));
        assert_eq!(state.phase, GenerationState::Errored);
        assert!(effects.contains(&Effect::ScheduleRetry {
            turn,
            delay: Duration::from_secs(1),
        }));

        let (state, effects) = apply(state, Input::RetryDue { turn });
        assert_eq!(effects, vec![Effect::Connect]);
        assert!(state.resume_in_flight);

        let (state, effects) = apply(state, event(turn, ChannelEvent::Connected));
        let request = effects
            .iter()
            .find_map(|e| match e {
                Effect::Send { request, .. } => Some(request.clone()),
                _ => None,
            })
            .expect("resubmit");
        assert_eq!(request.text, "hi");
        assert_eq!(request.conversation_id.as_deref(), Some("conv-1"));
        assert_eq!(request.resume_token.as_deref(), Some("4"));

        let (state, _) = apply(state, chunk(turn, "Here are more"));
        assert_eq!(state.phase, GenerationState::Streaming);
        let (state, _) = apply(state, event(turn, ChannelEvent::Completed));
        assert_eq!(state.phase, GenerationState::Idle);
        assert_eq!(
            texts(&state),
            vec![(Sender::User, "hi"), (Sender::Assistant, "Here are more")]
        );
    }

    #[test]
    fn second_retry_waits_twice_as_long() {
        let (state, turn) = submitted("hi");
        let (state, _) = apply(state, error(turn));
        let (state, _) = apply(state, Input::RetryDue { turn });
        let (state, _) = apply(state, event(turn, ChannelEvent::Connected));
        let (_, effects) = apply(state, error(turn));

        assert!(effects.contains(&Effect::ScheduleRetry {
            turn,
            delay: Duration::from_secs(2),
        }));
    }

    #[test]
    fn three_errors_exhaust_retries_and_keep_partial_text() {
        let (state, turn) = submitted("I need housing help");
        let (mut state, _) = apply(state, chunk(turn, "Here"));

        for attempt in 1..=3u32 {
            let (next, effects) = apply(state, error(turn));
            state = next;
            let exhausted = attempt == 3;
            assert!(effects.contains(&Effect::Emit(SessionUpdate::TurnFailed {
                reason: "backend failed".to_string(),
                attempt,
                exhausted,
            })));
            if !exhausted {
                state = apply(state, Input::RetryDue { turn }).0;
                state = apply(state, event(turn, ChannelEvent::Connected)).0;
            } else {
                assert!(!effects.iter().any(|e| matches!(e, Effect::ScheduleRetry { .. })));
            }
        }

        assert_eq!(state.phase, GenerationState::Errored);
        assert_eq!(
            texts(&state),
            vec![(Sender::User, "I need housing help"), (Sender::Assistant, "Here")]
        );
        assert!(state.pending.as_ref().unwrap().exhausted);
    }

    #[test]
    fn repeated_failure_signals_while_waiting_count_once() {
        let (state, turn) = submitted("hi");
        let (state, _) = apply(state, error(turn));
        let (state, _) = apply(
            state,
            event(
                turn,
                ChannelEvent::Disconnected {
                    reason: "closed".to_string(),
                },
            ),
        );
        assert_eq!(state.pending.as_ref().unwrap().attempts, 1);
        assert!(!state.channel_ready);
    }

    #[test]
    fn backgrounded_failure_defers_retry_until_foreground() {
        let (state, turn) = submitted("hi");
        let (state, _) = apply(state, Input::Background);
        let (state, effects) = apply(state, error(turn));

        assert!(!effects.iter().any(|e| matches!(e, Effect::ScheduleRetry { .. })));
        assert!(state.retry_deferred);

        let (state, effects) = apply(state, Input::Foreground);
        assert!(effects.contains(&Effect::Connect));
        assert!(state.resume_in_flight);
        assert!(!state.retry_deferred);

        // No second resume while the first is in flight
        let (_, effects) = apply(state, Input::Foreground);
        assert!(effects.is_empty());
    }

    #[test]
    fn background_cancels_an_armed_retry() {
        let (state, turn) = submitted("hi");
        let (state, _) = apply(state, error(turn));
        assert!(state.retry_scheduled);

        let (state, effects) = apply(state, Input::Background);
        assert_eq!(effects, vec![Effect::CancelRetry]);
        assert!(state.retry_deferred);

        // The timer may still fire once; it must not resume in the background
        let (state, effects) = apply(state, Input::RetryDue { turn });
        assert!(effects.is_empty());
        assert!(!state.resume_in_flight);
        assert_eq!(state.transcript.len(), 2);
    }

    #[test]
    fn foreground_reconnects_idle_dropped_channel() {
        let mut state = test_state();
        state.channel_ready = false;
        let (state, effects) = apply(state, Input::Foreground);
        assert_eq!(effects, vec![Effect::Connect]);
        assert!(state.connecting);

        let (_, effects) = apply(state, Input::Foreground);
        assert!(effects.is_empty());
    }

    #[test]
    fn reset_from_any_state_empties_session() {
        let (state, turn) = submitted("hi");
        let (state, _) = apply(
            state,
            event(
                turn,
                ChannelEvent::SessionAssigned {
                    conversation_id: "conv-1".to_string(),
                },
            ),
        );
        let (state, _) = apply(
            state,
            event(
                turn,
                ChannelEvent::SideChannel(SideChannelSnapshot {
                    goals: vec!["A".to_string()],
                    resources: Vec::new(),
                }),
            ),
        );
        let (state, _) = apply(state, chunk(turn, "partial"));

        let (state, effects) = apply(state, Input::NewSession);
        assert!(state.transcript.is_empty());
        assert!(state.history.is_empty());
        assert!(state.side_channel.snapshot().is_empty());
        assert_eq!(state.phase, GenerationState::Idle);
        assert!(state.session.conversation_id.is_none());
        assert!(state.session.last_sequence_token.is_none());
        assert!(state.pending.is_none());
        assert!(effects.contains(&Effect::Teardown));
        assert!(effects.contains(&Effect::Connect));

        // The counter keeps going so the old turn can't match anything new
        let (state, _) = apply(state, chunk(turn, "stale"));
        assert!(state.transcript.is_empty());
        assert_eq!(state.turn, turn);
    }

    #[test]
    fn side_channel_updates_replace_each_other() {
        let (state, turn) = submitted("hi");
        let (state, _) = apply(state, event(turn, ChannelEvent::Completed));
        let (state, _) = apply(
            state,
            event(
                turn,
                ChannelEvent::SideChannel(SideChannelSnapshot {
                    goals: vec!["A".to_string()],
                    resources: vec!["B".to_string()],
                }),
            ),
        );
        let (state, _) = apply(
            state,
            event(
                turn,
                ChannelEvent::SideChannel(SideChannelSnapshot {
                    goals: vec!["C".to_string()],
                    resources: Vec::new(),
                }),
            ),
        );

        assert_eq!(
            state.side_channel.snapshot(),
            &SideChannelSnapshot {
                goals: vec!["C".to_string()],
                resources: Vec::new(),
            }
        );
    }

    #[test]
    fn switch_with_content_waits_for_confirmation() {
        let (state, turn) = submitted("hi");
        let (state, _) = apply(state, event(turn, ChannelEvent::Completed));

        let (state, effects) = apply(
            state,
            Input::RequestSwitch {
                subject_id: Some("su-7".to_string()),
            },
        );
        assert_eq!(
            response(&effects),
            Some(&Response::Switch(SwitchDecision::AwaitingConfirmation {
                subject_id: Some("su-7".to_string())
            }))
        );
        assert!(state.guard.pending().is_some());

        let (state, _) = apply(state, Input::CancelSwitch);
        assert!(state.guard.pending().is_none());
        assert_eq!(state.transcript.len(), 2);
        assert_eq!(state.session.subject_id, None);

        let (state, _) = apply(
            state,
            Input::RequestSwitch {
                subject_id: Some("su-7".to_string()),
            },
        );
        let (state, effects) = apply(state, Input::ConfirmSwitch);
        assert!(state.transcript.is_empty());
        assert_eq!(state.session.subject_id.as_deref(), Some("su-7"));
        assert!(state.guard.pending().is_none());
        assert!(effects.contains(&Effect::NotifyReset {
            reason: ResetReason::SubjectSwitch,
            previous_subject_id: "general".to_string(),
            new_subject_id: "su-7".to_string(),
        }));
    }

    #[test]
    fn switch_on_empty_transcript_is_immediate() {
        let (state, effects) = apply(
            test_state(),
            Input::RequestSwitch {
                subject_id: Some("su-3".to_string()),
            },
        );
        assert_eq!(state.session.subject_id.as_deref(), Some("su-3"));
        assert!(!effects.iter().any(|e| matches!(e, Effect::NotifyReset { .. })));
    }

    #[test]
    fn confirm_without_pending_switch_is_rejected() {
        let (_, effects) = apply(test_state(), Input::ConfirmSwitch);
        assert!(matches!(
            response(&effects),
            Some(Response::Rejected(SessionError::ConflictingState(_)))
        ));
    }

    #[test]
    fn abandon_finalizes_partial_text_and_frees_the_session() {
        let (state, turn) = submitted("hi");
        let (state, _) = apply(state, chunk(turn, "partial"));
        let (state, _) = apply(state, error(turn));

        let (state, effects) = apply(state, Input::Abandon);
        assert_eq!(response(&effects), Some(&Response::Done));
        assert!(effects.contains(&Effect::CancelRetry));
        assert_eq!(state.phase, GenerationState::Idle);
        assert!(state.transcript.messages().iter().all(|m| m.is_final));
        assert_eq!(state.history.last(), Some(&HistoryEntry::system("partial")));

        let (_, effects) = apply(state, Input::Submit { text: "again".to_string() });
        assert!(matches!(response(&effects), Some(Response::Submitted { .. })));
    }

    #[test]
    fn resubmit_after_exhaustion_starts_a_fresh_turn() {
        let (state, turn) = submitted("I need housing help");
        let (mut state, _) = apply(state, chunk(turn, "Here"));
        for _ in 0..3 {
            state = apply(state, error(turn)).0;
            if !state.pending.as_ref().unwrap().exhausted {
                state = apply(state, Input::RetryDue { turn }).0;
                state = apply(state, event(turn, ChannelEvent::Connected)).0;
            }
        }

        let (state, effects) = apply(state, Input::Submit { text: "try again".to_string() });
        assert!(effects.contains(&Effect::Emit(SessionUpdate::TurnAbandoned)));
        assert_eq!(
            response(&effects),
            Some(&Response::Submitted { turn: turn + 1 })
        );
        assert_eq!(state.phase, GenerationState::Awaiting);
        assert_eq!(
            texts(&state),
            vec![
                (Sender::User, "I need housing help"),
                (Sender::Assistant, "Here"),
                (Sender::User, "try again"),
                (Sender::Assistant, ""),
            ]
        );
        assert_eq!(state.history[1], HistoryEntry::system("Here"));
    }

    #[test]
    fn idle_link_drop_reopens_the_channel() {
        let (state, effects) = apply(
            test_state(),
            event(
                0,
                ChannelEvent::Disconnected {
                    reason: "server restarted".to_string(),
                },
            ),
        );
        assert!(effects.contains(&Effect::Connect));
        assert!(state.connecting);
        assert!(!state.channel_ready);

        // The reopen gave up: stay down until the host asks again
        let (state, effects) = apply(
            state,
            event(
                0,
                ChannelEvent::Disconnected {
                    reason: "gave up after 5 connect attempts".to_string(),
                },
            ),
        );
        assert!(!effects.contains(&Effect::Connect));
        assert!(!state.connecting);
    }

    #[test]
    fn drop_during_a_turn_reconnects_through_the_retry() {
        let (state, turn) = submitted("hi");
        let (state, effects) = apply(
            state,
            event(
                turn,
                ChannelEvent::Disconnected {
                    reason: "closed".to_string(),
                },
            ),
        );
        assert!(state.retry_scheduled);
        assert!(!effects.contains(&Effect::Connect));
    }

    #[test]
    fn backgrounded_idle_drop_waits_for_foreground() {
        let (state, _) = apply(test_state(), Input::Background);
        let (state, effects) = apply(
            state,
            event(
                0,
                ChannelEvent::Disconnected {
                    reason: "closed".to_string(),
                },
            ),
        );
        assert!(!effects.contains(&Effect::Connect));

        let (_, effects) = apply(state, Input::Foreground);
        assert_eq!(effects, vec![Effect::Connect]);
    }

    #[test]
    fn abandon_outside_errored_is_rejected() {
        let (state, _) = submitted("hi");
        let (state, effects) = apply(state, Input::Abandon);
        assert!(matches!(
            response(&effects),
            Some(Response::Rejected(SessionError::ConflictingState(_)))
        ));
        assert_eq!(state.phase, GenerationState::Awaiting);
    }
}
