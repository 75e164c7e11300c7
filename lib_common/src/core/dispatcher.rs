//! # Room Dispatcher
//!
//! The `Dispatcher` is the broadcast engine of the room. It takes one message,
//! records it, and delivers it to every member at once.
//!
//! ## Core Design Principles:
//!
//! 1.  **Single Acceptance Point**: A message is accepted under one short lock
//!     that assigns its sequence number, appends it to the `HistoryBuffer` and
//!     publishes it to stream subscribers. This is the engine's total order.
//!     Messages from one sender keep their order because a sender's session
//!     awaits each broadcast before submitting the next.
//!
//! 2.  **Zero-Copy Fan-out**: The frame is encoded once and every delivery
//!     gets a reference-counted clone of the same `Bytes`.
//!
//! 3.  **Isolated Deliveries**: Each peer is served by its own task with a
//!     bounded timeout. A refused send, a slow peer or even a panicking
//!     transport only fails that peer; the rest of the pass is unaffected.
//!
//! 4.  **Failure Means Eviction**: A failed delivery is proof of a dead
//!     connection. Failed identities are evicted through the registry's
//!     eviction path, with no retry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::configs::RoomConfig;
use crate::core::connection::ConnectionHandle;
use crate::core::error::DeliveryFailure;
use crate::core::frame::Frame;
use crate::core::history::HistoryBuffer;
use crate::core::message::{Message, MessageKind};
use crate::core::registry::{MemberInfo, Registry};

/// # Broadcast Report
///
/// Per-identity outcome of one broadcast pass. Every identity in the snapshot
/// appears in exactly one of the two collections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sequence number assigned to the message at acceptance. Zero for
    /// control frames, which are not sequenced.
    pub seq: u64,
    pub delivered: BTreeSet<String>,
    pub failed: BTreeMap<String, DeliveryFailure>,
}

impl BroadcastReport {
    fn new(seq: u64) -> Self {
        Self {
            seq,
            ..Default::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Lifetime counters, updated with relaxed atomics.
#[derive(Debug, Default)]
struct DispatchStats {
    accepted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchCounters {
    pub accepted: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Room overview served to operators (`/stats`).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub member_count: usize,
    pub members: Vec<MemberInfo>,
    pub history_len: usize,
    pub history_capacity: usize,
    pub counters: DispatchCounters,
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    history: Arc<HistoryBuffer>,
    delivery_timeout: Duration,
    announce_presence: bool,
    broadcast_user_list: bool,
    /// Last assigned sequence number; its lock is the acceptance point.
    last_seq: Mutex<u64>,
    stream: broadcast::Sender<Arc<Message>>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, history: Arc<HistoryBuffer>, config: &RoomConfig) -> Self {
        let (stream, _) = broadcast::channel(config.stream_buffer.max(1));
        Self {
            registry,
            history,
            delivery_timeout: config.delivery_timeout(),
            announce_presence: config.announce_presence,
            broadcast_user_list: config.broadcast_user_list,
            last_seq: Mutex::new(0),
            stream,
            stats: DispatchStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn history(&self) -> &Arc<HistoryBuffer> {
        &self.history
    }

    pub fn delivery_timeout(&self) -> Duration {
        self.delivery_timeout
    }

    /// # Subscribe
    ///
    /// Read-only stream of every accepted message, in acceptance order, for
    /// analytics consumers. A subscriber that falls more than `streamBuffer`
    /// messages behind observes `RecvError::Lagged`; it never slows the room.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Message>> {
        self.stream.subscribe()
    }

    fn accept(&self, mut message: Message) -> Arc<Message> {
        let mut last_seq = self.last_seq.lock().unwrap_or_else(PoisonError::into_inner);
        *last_seq += 1;
        message.seq = *last_seq;
        let message = Arc::new(message);
        self.history.push(Arc::clone(&message));
        // No subscribers is fine.
        let _ = self.stream.send(Arc::clone(&message));
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        message
    }

    /// # Broadcast
    ///
    /// Accepts `message` and delivers it to a snapshot of the registry.
    ///
    /// ## Logic:
    /// 1.  Accept: sequence number, history, stream.
    /// 2.  Snapshot the registry. An empty room ends here with an empty report.
    /// 3.  Encode the frame once and deliver it concurrently, one task per peer,
    ///     each bounded by the delivery timeout.
    /// 4.  Evict every identity whose delivery failed.
    pub async fn broadcast(&self, message: Message) -> BroadcastReport {
        let message = self.accept(message);
        self.fan_out(&Frame::from_message(&message), BroadcastReport::new(message.seq))
            .await
    }

    /// Steps 2 to 4 of `broadcast`, shared with unsequenced control frames.
    async fn fan_out(&self, frame: &Frame, mut report: BroadcastReport) -> BroadcastReport {
        let peers = self.registry.snapshot();
        if peers.is_empty() {
            return report;
        }

        let frame = match frame.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode frame for #{}: {}. Skipping delivery.", report.seq, e);
                return report;
            }
        };

        let outcomes = deliver_all(peers, frame, self.delivery_timeout).await;
        for (identity, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    report.delivered.insert(identity);
                }
                Err(failure) => {
                    report.failed.insert(identity, failure);
                }
            }
        }

        self.stats
            .delivered
            .fetch_add(report.delivered.len() as u64, Ordering::Relaxed);
        self.stats
            .failed
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);

        for (identity, failure) in &report.failed {
            self.registry.evict(identity, failure).await;
        }

        report
    }

    /// Broadcasts a chat payload from `sender`.
    pub async fn publish(&self, sender: &str, payload: impl Into<Bytes>) -> BroadcastReport {
        self.broadcast(Message::new(sender, payload)).await
    }

    pub async fn announce_join(&self, identity: &str) -> Option<BroadcastReport> {
        self.announce(MessageKind::Join, identity).await
    }

    pub async fn announce_leave(&self, identity: &str) -> Option<BroadcastReport> {
        self.announce(MessageKind::Leave, identity).await
    }

    async fn announce(&self, kind: MessageKind, identity: &str) -> Option<BroadcastReport> {
        if !self.announce_presence {
            return None;
        }
        Some(self.broadcast(Message::presence(kind, identity)).await)
    }

    /// # Broadcast Members
    ///
    /// Sends the current member list to every member. The frame is not
    /// sequenced, not kept in history and not published to subscribers, but
    /// failed deliveries evict exactly like a chat broadcast.
    pub async fn broadcast_members(&self) -> BroadcastReport {
        let users = self.registry.members();
        self.fan_out(&Frame::user_list(users), BroadcastReport::default())
            .await
    }

    /// `broadcast_members` after a join or leave, when the room is configured
    /// to keep members informed.
    pub async fn announce_members(&self) -> Option<BroadcastReport> {
        if !self.broadcast_user_list {
            return None;
        }
        Some(self.broadcast_members().await)
    }

    /// # Send History
    ///
    /// Answers a history request: the newest `limit` entries, oldest first,
    /// as a single `message_history` frame to one connection. Returns how
    /// many entries it carried. A failure is reported, not evicted; the
    /// session notices a dead peer on its next read.
    pub async fn send_history(
        &self,
        handle: &ConnectionHandle,
        limit: usize,
    ) -> Result<usize, DeliveryFailure> {
        let backlog = self.history.replay_recent(limit);
        let frame = Frame::message_history(backlog.iter().map(|m| m.as_ref()))
            .encode()
            .map_err(|e| DeliveryFailure::Aborted(format!("encode failed: {}", e)))?;
        match tokio::time::timeout(self.delivery_timeout, handle.send(frame)).await {
            Ok(Ok(())) => Ok(backlog.len()),
            Ok(Err(e)) => Err(DeliveryFailure::Send(e)),
            Err(_) => Err(DeliveryFailure::Timeout(self.delivery_timeout)),
        }
    }

    /// # Replay To
    ///
    /// Sends the newest `limit` history entries to a single connection, oldest
    /// first, each bounded by the delivery timeout. Stops at the first failure.
    /// Returns how many entries were sent.
    pub async fn replay_to(
        &self,
        handle: &ConnectionHandle,
        limit: usize,
    ) -> Result<usize, DeliveryFailure> {
        let backlog = self.history.replay_recent(limit);
        let mut sent = 0;
        for message in &backlog {
            let frame = match Frame::from_message(message).encode() {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("Failed to encode history entry #{}: {}", message.seq, e);
                    continue;
                }
            };
            match tokio::time::timeout(self.delivery_timeout, handle.send(frame)).await {
                Ok(Ok(())) => sent += 1,
                Ok(Err(e)) => return Err(DeliveryFailure::Send(e)),
                Err(_) => return Err(DeliveryFailure::Timeout(self.delivery_timeout)),
            }
        }
        Ok(sent)
    }

    pub fn counters(&self) -> DispatchCounters {
        DispatchCounters {
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    pub fn room_stats(&self) -> RoomStats {
        let members = self.registry.members();
        RoomStats {
            member_count: members.len(),
            members,
            history_len: self.history.len(),
            history_capacity: self.history.capacity(),
            counters: self.counters(),
        }
    }
}

/// # Deliver All
///
/// Sends `frame` to every peer concurrently. One task per peer keeps the
/// deliveries independent: a panic inside a transport surfaces as a
/// `JoinError` for that task only and is reported as `Aborted`.
///
/// Dropping the returned future aborts the outstanding deliveries.
pub(crate) async fn deliver_all(
    peers: Vec<(String, ConnectionHandle)>,
    frame: Bytes,
    timeout: Duration,
) -> Vec<(String, Result<(), DeliveryFailure>)> {
    let mut tasks = JoinSet::new();
    let mut owners = HashMap::with_capacity(peers.len());

    for (identity, handle) in peers {
        let frame = frame.clone();
        let task = tasks.spawn(async move {
            match tokio::time::timeout(timeout, handle.send(frame)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(DeliveryFailure::Send(e)),
                Err(_) => Err(DeliveryFailure::Timeout(timeout)),
            }
        });
        owners.insert(task.id(), identity);
    }

    let mut outcomes = Vec::with_capacity(owners.len());
    while let Some(joined) = tasks.join_next_with_id().await {
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, outcome),
            Err(e) => (e.id(), Err(DeliveryFailure::Aborted(e.to_string()))),
        };
        if let Some(identity) = owners.remove(&id) {
            outcomes.push((identity, outcome));
        }
    }
    outcomes
}
