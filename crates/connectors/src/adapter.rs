//! Duplex channel adapter
//!
//! Owns one logical connection to the backend at a time. `connect` spawns a
//! pump task that opens a transport link (with bounded, linearly backed-off
//! retries) and forwards frames into a single inbound queue. Every frame is
//! stamped with the epoch of the pump that produced it; `teardown` bumps the
//! epoch so anything still queued from an old link is dropped in `ingest`.
//!
//! The adapter itself is not shared: the owner calls `ingest` for each
//! queued [`Inbound`] on its own task, which is where chunks are normalized
//! and readiness is tracked.

use std::sync::Arc;

use casework_protocol::{ClientMessage, GenerationRequest, ResetReason, ServerMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::normalize::ChunkNormalizer;
use crate::{ChannelConfig, ChannelEvent, ConnectorError, Frame, Link, Transport};

const INBOUND_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 32;

/// A frame queued by a pump task, not yet ingested
#[derive(Debug)]
pub struct Inbound {
    epoch: u64,
    kind: InboundKind,
}

#[derive(Debug)]
enum InboundKind {
    Connected,
    Frame(ServerMessage),
    Disconnected { reason: String },
}

/// A normalized event attributed to the turn it was received for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub turn: u64,
    pub event: ChannelEvent,
}

pub struct ChannelAdapter {
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    inbound_tx: mpsc::Sender<Inbound>,
    epoch: u64,
    ready: bool,
    outbound: Option<mpsc::Sender<ClientMessage>>,
    pump: Option<JoinHandle<()>>,
    turn: u64,
    turn_closed: bool,
    normalizer: ChunkNormalizer,
}

impl ChannelAdapter {
    /// Create an adapter and the queue its events arrive on.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ChannelConfig,
    ) -> (Self, mpsc::Receiver<Inbound>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let normalizer = ChunkNormalizer::new(config.chunk_mode);
        let adapter = Self {
            transport,
            config,
            inbound_tx,
            epoch: 0,
            ready: false,
            outbound: None,
            pump: None,
            turn: 0,
            turn_closed: true,
            normalizer,
        };
        (adapter, inbound_rx)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Start a fresh connection, tearing down any existing one first.
    ///
    /// Emits `Connected` once the link is open, or `Disconnected` when all
    /// connect attempts fail.
    pub fn connect(&mut self) {
        self.teardown();

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let epoch = self.epoch;

        info!(
            component = "channel",
            event = "channel.connect.started",
            epoch,
            transport = self.transport.name(),
            endpoint = %self.config.endpoint,
            "Opening backend channel"
        );

        let pump = tokio::spawn(pump(
            Arc::clone(&self.transport),
            self.config.clone(),
            epoch,
            outbound_rx,
            self.inbound_tx.clone(),
        ));

        self.outbound = Some(outbound_tx);
        self.pump = Some(pump);
    }

    /// Send one generation request for `turn`.
    ///
    /// A request carrying a resume token for the turn already in progress
    /// keeps the accumulated text; anything else starts the turn over.
    pub fn submit(&mut self, turn: u64, request: GenerationRequest) -> Result<(), ConnectorError> {
        if !self.ready {
            return Err(ConnectorError::NotReady);
        }
        let outbound = self.outbound.as_ref().ok_or(ConnectorError::NotReady)?;

        let resuming = request.resume_token.is_some() && turn == self.turn;
        outbound
            .try_send(ClientMessage::StartGeneration(request))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ConnectorError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => ConnectorError::ChannelClosed,
            })?;

        if !resuming {
            self.normalizer.reset();
        }
        self.turn = turn;
        self.turn_closed = false;

        debug!(
            component = "channel",
            event = "channel.submit",
            epoch = self.epoch,
            turn,
            resuming,
            "Generation request queued"
        );
        Ok(())
    }

    /// Queue a `reset_session` notification. It goes out as soon as the
    /// current link is open; nobody waits for the acknowledgment.
    pub fn notify_reset(
        &mut self,
        reason: ResetReason,
        previous_subject_id: String,
        new_subject_id: String,
    ) {
        let Some(outbound) = self.outbound.as_ref() else {
            debug!(
                component = "channel",
                event = "channel.reset_notice.dropped",
                "No channel to carry reset notice"
            );
            return;
        };
        let msg = ClientMessage::ResetSession {
            reason,
            previous_subject_id,
            new_subject_id,
        };
        if outbound.try_send(msg).is_err() {
            warn!(
                component = "channel",
                event = "channel.reset_notice.dropped",
                epoch = self.epoch,
                "Outbound queue unavailable, reset notice dropped"
            );
        }
    }

    /// Release the current connection. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            debug!(
                component = "channel",
                event = "channel.teardown",
                epoch = self.epoch,
                "Backend channel released"
            );
        }
        self.outbound = None;
        self.ready = false;
        self.epoch += 1;
    }

    /// Turn a queued frame into an event, or drop it when it belongs to a
    /// torn-down link or to a turn that already completed.
    pub fn ingest(&mut self, inbound: Inbound) -> Option<Envelope> {
        if inbound.epoch != self.epoch {
            debug!(
                component = "channel",
                event = "channel.frame.stale",
                frame_epoch = inbound.epoch,
                epoch = self.epoch,
                "Dropping frame from a released channel"
            );
            return None;
        }

        let event = match inbound.kind {
            InboundKind::Connected => {
                self.ready = true;
                ChannelEvent::Connected
            }
            InboundKind::Disconnected { reason } => {
                self.ready = false;
                self.outbound = None;
                self.pump = None;
                ChannelEvent::Disconnected { reason }
            }
            InboundKind::Frame(msg) => self.translate(msg)?,
        };

        Some(Envelope {
            turn: self.turn,
            event,
        })
    }

    fn translate(&mut self, msg: ServerMessage) -> Option<ChannelEvent> {
        match msg {
            ServerMessage::Welcome { message } => {
                debug!(component = "channel", event = "channel.welcome", %message);
                None
            }
            ServerMessage::ConversationId { conversation_id } => {
                Some(ChannelEvent::SessionAssigned { conversation_id })
            }
            ServerMessage::GenerationUpdate {
                chunk,
                sequence_token,
            } => {
                if self.turn_closed {
                    debug!(
                        component = "channel",
                        event = "channel.chunk.late",
                        turn = self.turn,
                        "Dropping chunk for a completed turn"
                    );
                    return None;
                }
                let text = self.normalizer.push(&chunk);
                Some(ChannelEvent::Chunk {
                    text,
                    sequence_token,
                })
            }
            ServerMessage::GenerationComplete { .. } => {
                if self.turn_closed {
                    return None;
                }
                self.turn_closed = true;
                Some(ChannelEvent::Completed)
            }
            ServerMessage::GoalsUpdate(snapshot) => Some(ChannelEvent::SideChannel(snapshot)),
            ServerMessage::ResetAck { .. } => {
                debug!(component = "channel", event = "channel.reset_ack");
                None
            }
            ServerMessage::Error { message } => Some(ChannelEvent::Error { detail: message }),
        }
    }
}

impl Drop for ChannelAdapter {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Connect with retries, then shuttle frames until the link goes away.
async fn pump(
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    epoch: u64,
    mut outbound_rx: mpsc::Receiver<ClientMessage>,
    inbound_tx: mpsc::Sender<Inbound>,
) {
    let mut attempt: u32 = 0;
    let link = loop {
        attempt += 1;
        let failure = match tokio::time::timeout(
            config.connect_timeout,
            transport.open(&config.endpoint),
        )
        .await
        {
            Ok(Ok(link)) => break link,
            Ok(Err(e)) => e,
            Err(_) => ConnectorError::Timeout(config.connect_timeout),
        };

        warn!(
            component = "channel",
            event = "channel.connect.failed",
            epoch,
            attempt,
            error = %failure,
            "Backend connect attempt failed"
        );

        if attempt >= config.max_connect_attempts.max(1) {
            let reason = format!("gave up after {attempt} connect attempts: {failure}");
            let _ = inbound_tx
                .send(Inbound {
                    epoch,
                    kind: InboundKind::Disconnected { reason },
                })
                .await;
            return;
        }

        tokio::time::sleep(config.connect_backoff.saturating_mul(attempt)).await;
    };

    info!(
        component = "channel",
        event = "channel.connected",
        epoch,
        attempt,
        "Backend channel open"
    );
    if inbound_tx
        .send(Inbound {
            epoch,
            kind: InboundKind::Connected,
        })
        .await
        .is_err()
    {
        return;
    }

    let reason = run_link(link, epoch, &mut outbound_rx, &inbound_tx).await;
    info!(
        component = "channel",
        event = "channel.disconnected",
        epoch,
        %reason,
        "Backend channel closed"
    );
    let _ = inbound_tx
        .send(Inbound {
            epoch,
            kind: InboundKind::Disconnected { reason },
        })
        .await;
}

async fn run_link(
    mut link: Link,
    epoch: u64,
    outbound_rx: &mut mpsc::Receiver<ClientMessage>,
    inbound_tx: &mpsc::Sender<Inbound>,
) -> String {
    loop {
        tokio::select! {
            frame = link.inbound.recv() => match frame {
                Some(Frame::Message(msg)) => {
                    let queued = inbound_tx
                        .send(Inbound { epoch, kind: InboundKind::Frame(msg) })
                        .await;
                    if queued.is_err() {
                        return "adapter dropped".to_string();
                    }
                }
                Some(Frame::Closed { reason }) => return reason,
                None => return "transport ended".to_string(),
            },
            outgoing = outbound_rx.recv() => match outgoing {
                Some(msg) => {
                    if link.outbound.send(msg).await.is_err() {
                        return "transport stopped accepting messages".to_string();
                    }
                }
                None => return "channel released".to_string(),
            },
        }
    }
}
