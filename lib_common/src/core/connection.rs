//! # Connection Handles
//!
//! The transport boundary. A `Connection` is one peer's bidirectional
//! channel; the engine only ever talks to peers through this trait, so a
//! WebSocket, a TCP stream or the in-memory pair below are interchangeable.
//!
//! Handles are shared as `Arc<dyn Connection>`: the registry owns the record,
//! while snapshots lend clones of the `Arc` for the length of one broadcast or
//! probe pass. Implementations must tolerate `send` and `receive` running
//! concurrently from different tasks.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::error::ConnectionError;
use crate::core::frame::Frame;

/// A request the room answers itself instead of broadcasting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomRequest {
    /// Send the current member list to every member.
    Members,
    /// Send up to `limit` recent history entries to the requester only.
    History { limit: usize },
}

/// One decoded unit of inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Chat content, broadcast to the room.
    Payload(Bytes),
    /// Client keepalive. Only refreshes `last_seen_at`.
    Heartbeat,
    Request(RoomRequest),
}

#[async_trait]
pub trait Connection: Send + Sync {
    /// Sends one encoded frame.
    async fn send(&self, frame: Bytes) -> Result<(), ConnectionError>;

    /// Waits for the next inbound item. Must be cancel-safe: the engine
    /// drops this future when shutdown is requested.
    async fn receive(&self) -> Result<Inbound, ConnectionError>;

    /// Liveness check. Resolves once the peer answered; the caller applies
    /// the timeout.
    async fn probe(&self) -> Result<(), ConnectionError>;

    /// Closes the channel. After this, `receive` resolves with `Closed`.
    async fn close(&self);
}

pub type ConnectionHandle = Arc<dyn Connection>;

/// Address-only comparison of two handles (ignores the vtable half of the
/// fat pointer).
pub fn same_connection(a: &ConnectionHandle, b: &ConnectionHandle) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Knobs and counters shared by both ends of a memory pair.
#[derive(Default)]
struct PairState {
    fail_sends: AtomicBool,
    ignore_probes: AtomicBool,
    send_delay_ms: AtomicU64,
    probes: AtomicUsize,
    closes: AtomicUsize,
    closed: CancellationToken,
}

/// # Memory Connection
///
/// The engine side of an in-process transport pair. Frames it sends land in
/// the `MemoryPeer`'s outbox; payloads the peer sends are returned by
/// `receive`.
pub struct MemoryConnection {
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    state: Arc<PairState>,
}

/// # Memory Peer
///
/// The remote side of a memory pair. Besides exchanging data it can script
/// failures: refuse sends, stall them, or stop answering probes.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    outbox: mpsc::UnboundedReceiver<Bytes>,
    state: Arc<PairState>,
}

impl MemoryConnection {
    pub fn pair() -> (MemoryConnection, MemoryPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(PairState::default());

        let connection = MemoryConnection {
            outbound: outbound_tx,
            inbound: Mutex::new(inbound_rx),
            state: Arc::clone(&state),
        };
        let peer = MemoryPeer {
            inbound: Some(inbound_tx),
            outbox: outbound_rx,
            state,
        };
        (connection, peer)
    }

    /// Convenience for callers that want the handle type straight away.
    pub fn handle_pair() -> (ConnectionHandle, MemoryPeer) {
        let (connection, peer) = Self::pair();
        (Arc::new(connection), peer)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, frame: Bytes) -> Result<(), ConnectionError> {
        if self.state.closed.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        let delay = self.state.send_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.state.fail_sends.load(Ordering::Relaxed) {
            return Err(ConnectionError::SendFailed("peer refused the frame".to_string()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| ConnectionError::SendFailed("peer dropped".to_string()))
    }

    async fn receive(&self) -> Result<Inbound, ConnectionError> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.state.closed.cancelled() => Err(ConnectionError::Closed),
            next = inbound.recv() => next.ok_or(ConnectionError::Closed),
        }
    }

    async fn probe(&self) -> Result<(), ConnectionError> {
        self.state.probes.fetch_add(1, Ordering::Relaxed);
        if self.state.closed.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        if self.state.ignore_probes.load(Ordering::Relaxed) {
            // Never answers; only closing the pair ends the wait.
            self.state.closed.cancelled().await;
            return Err(ConnectionError::Closed);
        }
        Ok(())
    }

    async fn close(&self) {
        self.state.closes.fetch_add(1, Ordering::Relaxed);
        self.state.closed.cancel();
    }
}

impl MemoryPeer {
    /// Queues a chat payload for the engine. Returns `false` after `disconnect`.
    pub fn send(&self, payload: impl Into<Bytes>) -> bool {
        self.send_inbound(Inbound::Payload(payload.into()))
    }

    /// Queues any inbound item: a heartbeat or a request.
    pub fn send_inbound(&self, inbound: Inbound) -> bool {
        match &self.inbound {
            Some(tx) => tx.send(inbound).is_ok(),
            None => false,
        }
    }

    /// Hangs up from the peer side; the engine's `receive` sees `Closed`.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Next raw frame sent by the engine.
    pub async fn recv_raw(&mut self) -> Option<Bytes> {
        self.outbox.recv().await
    }

    /// Next decoded frame sent by the engine. Undecodable frames end the stream.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        let raw = self.outbox.recv().await?;
        Frame::decode(&raw).ok()
    }

    /// Every frame already delivered, without waiting.
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(raw) = self.outbox.try_recv() {
            if let Ok(frame) = Frame::decode(&raw) {
                frames.push(frame);
            }
        }
        frames
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::Relaxed);
    }

    pub fn ignore_probes(&self, ignore: bool) {
        self.state.ignore_probes.store(ignore, Ordering::Relaxed);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.state
            .send_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn probe_count(&self) -> usize {
        self.state.probes.load(Ordering::Relaxed)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.is_cancelled()
    }
}
