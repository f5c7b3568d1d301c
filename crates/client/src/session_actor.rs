//! Session actor: owns the dialogue state and the channel adapter.
//!
//! One tokio task per session. User commands, adapter events and the retry
//! deadline are multiplexed in a single `select!` loop, each turned into a
//! transition [`Input`]; the resulting effects are executed in order.
//! Callers talk to it through [`SessionActorHandle`]; reads go through a
//! lock-free `ArcSwap` snapshot and a broadcast stream of updates.

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use casework_connectors::{ChannelAdapter, Inbound, Transport};
use casework_protocol::new_id;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::session_command::SessionCommand;
use crate::subject_guard::SwitchDecision;
use crate::transition::{
    transition, Effect, Input, Response, SessionSnapshot, SessionUpdate, TransitionState,
};

const COMMAND_CAPACITY: usize = 64;
const UPDATE_CAPACITY: usize = 512;

/// Handle to a running session actor (cheap to Clone).
#[derive(Clone)]
pub struct SessionActorHandle {
    pub id: String,
    command_tx: mpsc::Sender<SessionCommand>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionActorHandle {
    /// Spawn a session actor and start connecting right away.
    pub fn spawn(config: &ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let id = new_id();
        let state = TransitionState::new(
            config.subject_id.clone(),
            config.tool.clone(),
            config.retry_policy(),
        );
        let (adapter, inbound_rx) = ChannelAdapter::new(transport, config.channel_config());
        let snapshot = Arc::new(ArcSwap::from_pointee(SessionSnapshot::from_state(
            &id, &state,
        )));
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);

        let actor = SessionActor {
            id: id.clone(),
            adapter,
            retry_at: None,
            snapshot: Arc::clone(&snapshot),
            updates: updates.clone(),
        };
        tokio::spawn(actor.run(state, command_rx, inbound_rx));

        Self {
            id,
            command_tx,
            snapshot,
            updates,
        }
    }

    /// Send a command to the actor.
    pub async fn send(&self, cmd: SessionCommand) -> Result<(), SessionError> {
        self.command_tx.send(cmd).await.map_err(|_| {
            warn!(
                component = "session_actor",
                session_id = %self.id,
                "Actor channel closed, command dropped"
            );
            SessionError::ActorClosed
        })
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub async fn submit(&self, text: impl Into<String>) -> Result<u64, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Submit {
            text: text.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::ActorClosed)?
    }

    pub async fn abandon(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Abandon { reply }).await?;
        rx.await.map_err(|_| SessionError::ActorClosed)?
    }

    pub async fn new_session(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::NewSession).await
    }

    pub async fn request_switch(
        &self,
        subject_id: Option<String>,
    ) -> Result<SwitchDecision, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::RequestSwitch { subject_id, reply })
            .await?;
        rx.await.map_err(|_| SessionError::ActorClosed)
    }

    pub async fn confirm_switch(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::ConfirmSwitch { reply }).await?;
        rx.await.map_err(|_| SessionError::ActorClosed)?
    }

    pub async fn cancel_switch(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::CancelSwitch).await
    }

    pub async fn foreground(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Foreground).await
    }

    pub async fn background(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Background).await
    }

    /// Stop the actor and release its channel.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Shutdown { reply }).await?;
        rx.await.map_err(|_| SessionError::ActorClosed)
    }
}

struct SessionActor {
    id: String,
    adapter: ChannelAdapter,
    /// Armed retry: the turn and when it is due
    retry_at: Option<(u64, Instant)>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut state: TransitionState,
        mut command_rx: mpsc::Receiver<SessionCommand>,
        mut inbound_rx: mpsc::Receiver<Inbound>,
    ) {
        info!(
            component = "session_actor",
            event = "session.started",
            session_id = %self.id,
            subject = ?state.session.subject_id,
            "Session actor started"
        );

        state.connecting = true;
        self.adapter.connect();
        self.publish(&state);

        loop {
            let deadline = self.retry_at.map(|(_, at)| at);

            tokio::select! {
                cmd = command_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if let SessionCommand::Shutdown { reply } = cmd {
                        self.adapter.teardown();
                        let _ = reply.send(());
                        break;
                    }
                    state = self.handle_command(state, cmd);
                }

                Some(inbound) = inbound_rx.recv() => {
                    if let Some(envelope) = self.adapter.ingest(inbound) {
                        debug!(
                            component = "session_actor",
                            event = "session.channel_event",
                            session_id = %self.id,
                            epoch = self.adapter.epoch(),
                            turn = envelope.turn,
                            channel_event = ?envelope.event,
                            "Channel event"
                        );
                        state = self.apply(state, Input::Channel(envelope)).0;
                    }
                }

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some((turn, _)) = self.retry_at.take() {
                        info!(
                            component = "session_actor",
                            event = "session.retry.due",
                            session_id = %self.id,
                            turn,
                            "Retrying failed turn"
                        );
                        state = self.apply(state, Input::RetryDue { turn }).0;
                    }
                }
            }
        }

        info!(
            component = "session_actor",
            event = "session.stopped",
            session_id = %self.id,
            "Session actor stopped"
        );
    }

    fn handle_command(&mut self, state: TransitionState, cmd: SessionCommand) -> TransitionState {
        match cmd {
            SessionCommand::Submit { text, reply } => {
                let (state, response) = self.apply(state, Input::Submit { text });
                let result = match response {
                    Some(Response::Submitted { turn }) => Ok(turn),
                    Some(Response::Rejected(e)) => Err(e),
                    other => Err(unexpected(other)),
                };
                let _ = reply.send(result);
                state
            }
            SessionCommand::Abandon { reply } => {
                let (state, response) = self.apply(state, Input::Abandon);
                let _ = reply.send(into_result(response));
                state
            }
            SessionCommand::NewSession => self.apply(state, Input::NewSession).0,
            SessionCommand::RequestSwitch { subject_id, reply } => {
                let (state, response) = self.apply(state, Input::RequestSwitch { subject_id });
                if let Some(Response::Switch(decision)) = response {
                    let _ = reply.send(decision);
                }
                state
            }
            SessionCommand::ConfirmSwitch { reply } => {
                let (state, response) = self.apply(state, Input::ConfirmSwitch);
                let _ = reply.send(into_result(response));
                state
            }
            SessionCommand::CancelSwitch => self.apply(state, Input::CancelSwitch).0,
            SessionCommand::Foreground => self.apply(state, Input::Foreground).0,
            SessionCommand::Background => self.apply(state, Input::Background).0,
            SessionCommand::Shutdown { reply } => {
                let _ = reply.send(());
                state
            }
        }
    }

    /// Run one input through the transition and execute its effects. A
    /// failed send feeds back in as another input.
    fn apply(
        &mut self,
        state: TransitionState,
        input: Input,
    ) -> (TransitionState, Option<Response>) {
        let mut state = state;
        let mut response = None;
        let mut queue = VecDeque::from([input]);

        while let Some(input) = queue.pop_front() {
            let (next, effects) = transition(state, input);
            state = next;

            for effect in effects {
                match effect {
                    Effect::Connect => self.adapter.connect(),
                    Effect::Teardown => self.adapter.teardown(),
                    Effect::Send { turn, request } => {
                        let resuming = request.resume_token.is_some();
                        match self.adapter.submit(turn, request) {
                            Ok(()) => info!(
                                component = "session_actor",
                                event = "session.turn.sent",
                                session_id = %self.id,
                                turn,
                                resuming,
                                "Generation request sent"
                            ),
                            Err(e) => {
                                warn!(
                                    component = "session_actor",
                                    event = "session.turn.send_failed",
                                    session_id = %self.id,
                                    turn,
                                    channel_ready = self.adapter.is_ready(),
                                    error = %e,
                                    "Generation request not sent"
                                );
                                queue.push_back(Input::SendFailed {
                                    turn,
                                    reason: e.to_string(),
                                });
                            }
                        }
                    }
                    Effect::ScheduleRetry { turn, delay } => {
                        info!(
                            component = "session_actor",
                            event = "session.retry.scheduled",
                            session_id = %self.id,
                            turn,
                            delay_ms = delay.as_millis() as u64,
                            "Retry scheduled"
                        );
                        self.retry_at = Some((turn, Instant::now() + delay));
                    }
                    Effect::CancelRetry => self.retry_at = None,
                    Effect::NotifyReset {
                        reason,
                        previous_subject_id,
                        new_subject_id,
                    } => {
                        info!(
                            component = "session_actor",
                            event = "session.reset",
                            session_id = %self.id,
                            reason = ?reason,
                            previous_subject_id = %previous_subject_id,
                            new_subject_id = %new_subject_id,
                            "Session reset"
                        );
                        self.adapter
                            .notify_reset(reason, previous_subject_id, new_subject_id);
                    }
                    Effect::Emit(update) => self.emit(update),
                    Effect::Respond(r) => {
                        if let Response::Rejected(SessionError::ConflictingState(detail)) = &r {
                            error!(
                                component = "session_actor",
                                event = "session.conflicting_state",
                                session_id = %self.id,
                                detail = %detail,
                                "Command conflicts with session state"
                            );
                        }
                        response.get_or_insert(r);
                    }
                }
            }
        }

        self.publish(&state);
        (state, response)
    }

    fn emit(&self, update: SessionUpdate) {
        match &update {
            SessionUpdate::TurnCompleted { text } => info!(
                component = "session_actor",
                event = "session.turn.completed",
                session_id = %self.id,
                chars = text.chars().count(),
                "Turn completed"
            ),
            SessionUpdate::TurnFailed {
                reason,
                attempt,
                exhausted,
            } => warn!(
                component = "session_actor",
                event = "session.turn.failed",
                session_id = %self.id,
                attempt,
                exhausted,
                reason = %reason,
                "Turn failed"
            ),
            _ => {}
        }
        // No subscribers is fine
        let _ = self.updates.send(update);
    }

    fn publish(&self, state: &TransitionState) {
        self.snapshot
            .store(Arc::new(SessionSnapshot::from_state(&self.id, state)));
    }
}

fn into_result(response: Option<Response>) -> Result<(), SessionError> {
    match response {
        Some(Response::Rejected(e)) => Err(e),
        _ => Ok(()),
    }
}

fn unexpected(response: Option<Response>) -> SessionError {
    SessionError::ConflictingState(format!("unexpected response: {response:?}"))
}
