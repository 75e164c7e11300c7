//! # Registry
//!
//! Identity → `ConnectionRecord` map shared by every connection handler, the
//! dispatcher and the heartbeat monitor.
//!
//! Every operation is a short critical section on a `std::sync::Mutex`. No
//! I/O happens while it is held: handles are closed and hooks are invoked
//! after the guard is dropped. `remove` hands the record back to the caller,
//! and whoever receives it is the one (and only one) who closes it.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::connection::{same_connection, ConnectionHandle};
use crate::core::error::RoomError;

pub struct ConnectionRecord {
    pub identity: String,
    pub handle: ConnectionHandle,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl ConnectionRecord {
    /// Closes the handle. Consuming the record makes a second close impossible.
    pub async fn close(self) {
        self.handle.close().await;
    }
}

/// Read-only view of a member, used for user lists and stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub identity: String,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// # Registry Hooks
///
/// Observers of membership changes, for logging or metrics. Called outside
/// the registry lock, after the change is visible.
pub trait RegistryHooks: Send + Sync {
    fn on_connect(&self, _identity: &str, _handle: &ConnectionHandle) {}
    fn on_disconnect(&self, _identity: &str) {}
}

/// Hooks that do nothing.
pub struct NoHooks;

impl RegistryHooks for NoHooks {}

/// Hooks that log joins and leaves.
pub struct LogHooks;

impl RegistryHooks for LogHooks {
    fn on_connect(&self, identity: &str, _handle: &ConnectionHandle) {
        log::info!("Client '{}' registered.", identity);
    }

    fn on_disconnect(&self, identity: &str) {
        log::info!("Client '{}' removed from the registry.", identity);
    }
}

pub struct Registry {
    records: Mutex<HashMap<String, ConnectionRecord>>,
    hooks: Arc<dyn RegistryHooks>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_hooks(Arc::new(NoHooks))
    }

    pub fn with_hooks(hooks: Arc<dyn RegistryHooks>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            hooks,
        }
    }

    // A panic while holding the lock cannot leave the map half-updated
    // (every critical section is a single map call), so poisoning is ignored.
    fn records(&self) -> MutexGuard<'_, HashMap<String, ConnectionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a member. An identity that is already present is rejected and the
    /// existing record stays untouched.
    pub fn register(&self, identity: &str, handle: ConnectionHandle) -> Result<(), RoomError> {
        {
            let mut records = self.records();
            if records.contains_key(identity) {
                return Err(RoomError::DuplicateIdentity(identity.to_string()));
            }
            let now = Utc::now();
            records.insert(
                identity.to_string(),
                ConnectionRecord {
                    identity: identity.to_string(),
                    handle: Arc::clone(&handle),
                    joined_at: now,
                    last_seen_at: now,
                },
            );
        }
        self.hooks.on_connect(identity, &handle);
        Ok(())
    }

    /// Removes and returns the record. The caller must close it. Removing an
    /// absent identity is a no-op.
    pub fn remove(&self, identity: &str) -> Option<ConnectionRecord> {
        let removed = self.records().remove(identity);
        if removed.is_some() {
            self.hooks.on_disconnect(identity);
        }
        removed
    }

    /// Like `remove`, but only if the registered handle is `handle`. Lets a
    /// departing session clean up after itself without evicting a different
    /// connection that holds the same identity.
    pub fn remove_connection(
        &self,
        identity: &str,
        handle: &ConnectionHandle,
    ) -> Option<ConnectionRecord> {
        let removed = {
            let mut records = self.records();
            match records.get(identity) {
                Some(record) if same_connection(&record.handle, handle) => records.remove(identity),
                _ => None,
            }
        };
        if removed.is_some() {
            self.hooks.on_disconnect(identity);
        }
        removed
    }

    /// # Evict
    ///
    /// The single eviction path shared by failed deliveries, failed probes and
    /// ended sessions: remove the record, then close its handle. Returns
    /// whether this call did the eviction.
    ///
    /// `reason` is `Sync` so the returned future stays `Send` and can run on
    /// spawned tasks.
    pub async fn evict(&self, identity: &str, reason: &(dyn Display + Sync)) -> bool {
        match self.remove(identity) {
            Some(record) => {
                log::warn!("Evicting '{}': {}", identity, reason);
                record.close().await;
                true
            }
            None => false,
        }
    }

    /// Eviction guarded by handle identity, see `remove_connection`.
    pub async fn evict_connection(
        &self,
        identity: &str,
        handle: &ConnectionHandle,
        reason: &(dyn Display + Sync),
    ) -> bool {
        match self.remove_connection(identity, handle) {
            Some(record) => {
                log::info!("Client '{}' left: {}", identity, reason);
                record.close().await;
                true
            }
            None => false,
        }
    }

    /// Updates `last_seen_at`. Absent identities are ignored, which covers a
    /// probe that completes after its connection was removed.
    pub fn touch(&self, identity: &str, now: DateTime<Utc>) {
        if let Some(record) = self.records().get_mut(identity) {
            record.last_seen_at = now;
        }
    }

    /// # Snapshot
    ///
    /// Point-in-time copy of the members, ordered by join time then identity.
    /// Iterating it holds no lock, so joins and leaves proceed during a
    /// broadcast.
    pub fn snapshot(&self) -> Vec<(String, ConnectionHandle)> {
        let mut entries: Vec<_> = self
            .records()
            .values()
            .map(|r| (r.joined_at, r.identity.clone(), Arc::clone(&r.handle)))
            .collect();
        entries.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        entries
            .into_iter()
            .map(|(_, identity, handle)| (identity, handle))
            .collect()
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        let mut members: Vec<MemberInfo> = self
            .records()
            .values()
            .map(|r| MemberInfo {
                identity: r.identity.clone(),
                joined_at: r.joined_at,
                last_seen_at: r.last_seen_at,
            })
            .collect();
        members.sort_by(|a, b| (a.joined_at, &a.identity).cmp(&(b.joined_at, &b.identity)));
        members
    }

    pub fn last_seen(&self, identity: &str) -> Option<DateTime<Utc>> {
        self.records().get(identity).map(|r| r.last_seen_at)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.records().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    /// Removes every record. Used by shutdown cleanup; the caller closes them.
    pub fn drain(&self) -> Vec<ConnectionRecord> {
        let drained: Vec<ConnectionRecord> = self.records().drain().map(|(_, r)| r).collect();
        for record in &drained {
            self.hooks.on_disconnect(&record.identity);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::MemoryConnection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHooks {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl RegistryHooks for CountingHooks {
        fn on_connect(&self, _identity: &str, _handle: &ConnectionHandle) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnect(&self, _identity: &str) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn duplicate_identity_keeps_the_first_record() {
        let registry = Registry::new();
        let (first, _p1) = MemoryConnection::handle_pair();
        let (second, _p2) = MemoryConnection::handle_pair();

        registry.register("u1", Arc::clone(&first)).unwrap();
        let err = registry.register("u1", second).unwrap_err();

        assert_eq!(err, RoomError::DuplicateIdentity("u1".to_string()));
        assert_eq!(registry.len(), 1);
        let snapshot = registry.snapshot();
        assert!(same_connection(&snapshot[0].1, &first));
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::new();
        let (handle, _peer) = MemoryConnection::handle_pair();
        registry.register("u1", handle).unwrap();

        assert!(registry.remove("u1").is_some());
        assert!(registry.remove("u1").is_none());
        assert!(registry.remove("never-joined").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn evicted_handles_close_exactly_once() {
        let registry = Registry::new();
        let (handle, peer) = MemoryConnection::handle_pair();
        registry.register("u1", handle).unwrap();

        assert!(registry.evict("u1", &"test").await);
        assert!(!registry.evict("u1", &"test again").await);
        assert_eq!(peer.close_count(), 1);
    }

    #[tokio::test]
    async fn evict_connection_ignores_a_different_handle() {
        let registry = Registry::new();
        let (owner, owner_peer) = MemoryConnection::handle_pair();
        let (impostor, _impostor_peer) = MemoryConnection::handle_pair();
        registry.register("u1", Arc::clone(&owner)).unwrap();

        assert!(!registry.evict_connection("u1", &impostor, &"rejected").await);
        assert!(registry.contains("u1"));
        assert!(registry.evict_connection("u1", &owner, &"left").await);
        assert_eq!(owner_peer.close_count(), 1);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn eviction_futures_can_be_spawned() {
        let registry = Registry::new();
        let (handle, _peer) = MemoryConnection::handle_pair();
        let failure = RoomError::DuplicateIdentity("u1".to_string());

        assert_send(&registry.evict("u1", &failure));
        assert_send(&registry.evict_connection("u1", &handle, &"left"));
    }

    #[test]
    fn touch_updates_present_members_only() {
        let registry = Registry::new();
        let (handle, _peer) = MemoryConnection::handle_pair();
        registry.register("u1", handle).unwrap();

        let later = Utc::now() + chrono::Duration::seconds(60);
        registry.touch("u1", later);
        registry.touch("ghost", later);

        assert_eq!(registry.last_seen("u1"), Some(later));
        assert_eq!(registry.last_seen("ghost"), None);
    }

    #[test]
    fn snapshot_is_detached_from_later_changes() {
        let registry = Registry::new();
        for name in ["a", "b", "c"] {
            let (handle, _peer) = MemoryConnection::handle_pair();
            registry.register(name, handle).unwrap();
        }

        let snapshot = registry.snapshot();
        registry.remove("b");

        let names: Vec<_> = snapshot.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"b"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn hooks_observe_membership_changes() {
        let hooks = Arc::new(CountingHooks::default());
        let registry = Registry::with_hooks(hooks.clone());
        let (h1, _p1) = MemoryConnection::handle_pair();
        let (h2, _p2) = MemoryConnection::handle_pair();
        let (h3, _p3) = MemoryConnection::handle_pair();

        registry.register("a", h1).unwrap();
        registry.register("b", h2).unwrap();
        let _ = registry.register("a", h3);
        registry.remove("a");
        registry.remove("a");
        let drained = registry.drain();

        assert_eq!(drained.len(), 1);
        assert_eq!(hooks.connects.load(Ordering::SeqCst), 2);
        assert_eq!(hooks.disconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn random_register_remove_sequences_never_double_close() {
        let registry = Registry::new();
        let mut peers = Vec::new();
        // Deterministic pseudo-random walk over a small identity space.
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..200 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let identity = format!("u{}", state % 5);
            if state % 3 == 0 {
                registry.evict(&identity, &"walk").await;
            } else {
                let (handle, peer) = MemoryConnection::handle_pair();
                if registry.register(&identity, handle).is_ok() {
                    peers.push(peer);
                }
            }
            assert!(registry.len() <= 5);
        }
        for record in registry.drain() {
            record.close().await;
        }
        assert!(peers.iter().all(|p| p.close_count() == 1));
    }
}
