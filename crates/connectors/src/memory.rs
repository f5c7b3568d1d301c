//! In-memory transport
//!
//! Every `open` hands the backend half of a fresh link to a
//! [`MemoryBackend`], so tests can script the backend side of a
//! conversation without a network.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use casework_protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;

use crate::{ConnectorError, Frame, Link, Transport};

const LINK_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

struct Inner {
    accepted: mpsc::UnboundedSender<MemoryLink>,
    fail_remaining: AtomicU32,
    hang_remaining: AtomicU32,
    opens: AtomicU32,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryBackend) {
        let (accepted, links) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(Inner {
                accepted,
                fail_remaining: AtomicU32::new(0),
                hang_remaining: AtomicU32::new(0),
                opens: AtomicU32::new(0),
            }),
        };
        (transport, MemoryBackend { links })
    }

    /// Make the next `n` opens fail
    pub fn fail_next(&self, n: u32) {
        self.inner.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` opens never complete
    pub fn hang_next(&self, n: u32) {
        self.inner.hang_remaining.store(n, Ordering::SeqCst);
    }

    /// Number of open attempts so far, failed ones included
    pub fn open_count(&self) -> u32 {
        self.inner.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open(&self, _endpoint: &str) -> Result<Link, ConnectorError> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);

        if take_one(&self.inner.hang_remaining) {
            return std::future::pending().await;
        }
        if take_one(&self.inner.fail_remaining) {
            return Err(ConnectorError::Connect("backend unreachable".to_string()));
        }

        let (outbound, sent) = mpsc::channel(LINK_CAPACITY);
        let (frames, inbound) = mpsc::channel(LINK_CAPACITY);
        self.inner
            .accepted
            .send(MemoryLink { sent, frames })
            .map_err(|_| ConnectorError::Connect("backend gone".to_string()))?;

        Ok(Link { outbound, inbound })
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Backend side of the in-memory transport
pub struct MemoryBackend {
    links: mpsc::UnboundedReceiver<MemoryLink>,
}

impl MemoryBackend {
    /// Wait for the client to open the next link
    pub async fn accept(&mut self) -> Option<MemoryLink> {
        self.links.recv().await
    }

    /// Take an already-opened link without waiting
    pub fn try_accept(&mut self) -> Option<MemoryLink> {
        self.links.try_recv().ok()
    }
}

/// One scripted backend connection
pub struct MemoryLink {
    sent: mpsc::Receiver<ClientMessage>,
    frames: mpsc::Sender<Frame>,
}

impl MemoryLink {
    /// Next message the client sent on this link
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        self.sent.recv().await
    }

    pub async fn send(&self, msg: ServerMessage) {
        let _ = self.frames.send(Frame::Message(msg)).await;
    }

    /// Close the link as a transport drop would
    pub async fn close(self, reason: &str) {
        let _ = self
            .frames
            .send(Frame::Closed {
                reason: reason.to_string(),
            })
            .await;
    }
}
