//! Bounded offline send queue.
//!
//! Holds envelopes authored while no session is live, in FIFO order, and
//! drains them on reconnection. The queue is session-scoped and transient:
//! durable retry of message *content* is the store's job, so evicting a
//! queue slot never loses a message that was durably persisted.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use mentorlink_proto::envelope::WireEnvelope;

/// An envelope waiting for a session, with its enqueue instant.
#[derive(Debug, Clone)]
pub struct QueuedEnvelope {
    /// The envelope to transmit on reconnection.
    pub envelope: WireEnvelope,
    /// When the entry was admitted.
    pub queued_at: DateTime<Utc>,
}

/// Bounded FIFO queue with oldest-first eviction.
///
/// Enqueue and drain are each atomic with respect to the other, so
/// user-initiated sends interleave safely with a reconnection-triggered
/// flush.
pub struct OfflineQueue {
    entries: Mutex<VecDeque<QueuedEnvelope>>,
    capacity: usize,
    evicted: std::sync::atomic::AtomicU64,
}

impl OfflineQueue {
    /// Creates a queue admitting at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
            evicted: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Admits an envelope, evicting the oldest entry when full.
    ///
    /// Returns the evicted entry, if any. Eviction is not a failure: a new
    /// entry is always admitted.
    pub fn enqueue(&self, envelope: WireEnvelope) -> Option<QueuedEnvelope> {
        let mut entries = self.entries.lock();
        entries.push_back(QueuedEnvelope {
            envelope,
            queued_at: Utc::now(),
        });
        if entries.len() > self.capacity {
            let evicted = entries.pop_front();
            drop(entries);
            self.evicted
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            evicted
        } else {
            None
        }
    }

    /// Removes and returns every entry in enqueue order.
    pub fn drain_all(&self) -> Vec<QueuedEnvelope> {
        self.entries.lock().drain(..).collect()
    }

    /// Discards all entries, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let dropped = entries.len();
        entries.clear();
        dropped
    }

    /// Number of entries currently queued.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` when no entries are queued.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Total entries evicted over the queue's lifetime.
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(std::sync::atomic::Ordering::Relaxed)
    }
}
