use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::message::Message;

/// # History Buffer
///
/// Fixed-capacity FIFO of accepted messages, replayed to new members.
///
/// Only the `Dispatcher` pushes, at the moment it accepts a message. Readers
/// get a copy taken under a short lock, so a replay may miss a message pushed
/// during the copy but never duplicates or reorders what it includes.
pub struct HistoryBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<Arc<Message>>>,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<Arc<Message>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends, evicting the oldest entry once the capacity is exceeded.
    pub fn push(&self, message: Arc<Message>) {
        let mut entries = self.entries();
        entries.push_back(message);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Everything retained, oldest first.
    pub fn replay(&self) -> Vec<Arc<Message>> {
        self.entries().iter().cloned().collect()
    }

    /// The newest `limit` entries, oldest first.
    pub fn replay_recent(&self, limit: usize) -> Vec<Arc<Message>> {
        let entries = self.entries();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
