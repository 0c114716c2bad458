//! Ordered pending-batch queue.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::statement::MutationBatch;

/// A batch waiting to be applied to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    /// Monotonic per-queue sequence number.
    pub id: u64,
    /// The batch to apply.
    pub batch: MutationBatch,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    /// When the batch was queued.
    pub created_at: DateTime<Utc>,
}

/// Persisted form of a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueImage {
    /// Id the next pushed entry receives.
    pub next_id: u64,
    /// Queued entries, head first.
    pub entries: Vec<PendingEntry>,
}

/// FIFO of pending entries with oldest-first eviction.
#[derive(Debug)]
pub struct PendingQueue {
    entries: VecDeque<PendingEntry>,
    next_id: u64,
    max_pending: usize,
}

impl PendingQueue {
    /// An empty queue holding at most `max_pending` entries.
    #[must_use]
    pub fn new(max_pending: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            max_pending: max_pending.max(1),
        }
    }

    /// Rebuilds a queue from its persisted image.
    ///
    /// Ids keep increasing past every restored entry even if the image's
    /// `next_id` lags behind.
    #[must_use]
    pub fn restore(image: QueueImage, max_pending: usize) -> Self {
        let highest = image.entries.iter().map(|e| e.id).max().unwrap_or(0);
        let mut queue = Self {
            entries: image.entries.into(),
            next_id: image.next_id.max(highest + 1).max(1),
            max_pending: max_pending.max(1),
        };
        queue.evict_overflow();
        queue
    }

    /// Copy of the queue for persistence.
    #[must_use]
    pub fn image(&self) -> QueueImage {
        QueueImage {
            next_id: self.next_id,
            entries: self.entries.iter().cloned().collect(),
        }
    }

    /// Appends a batch. Returns the new entry and any entries evicted to stay
    /// within `max_pending`, oldest first.
    pub fn push(
        &mut self,
        batch: MutationBatch,
        now: DateTime<Utc>,
    ) -> (PendingEntry, Vec<PendingEntry>) {
        let entry = PendingEntry {
            id: self.next_id,
            batch,
            attempts: 0,
            created_at: now,
        };
        self.next_id += 1;
        self.entries.push_back(entry.clone());
        let evicted = self.evict_overflow();
        (entry, evicted)
    }

    /// The oldest entry, next to be applied.
    #[must_use]
    pub fn head(&self) -> Option<&PendingEntry> {
        self.entries.front()
    }

    /// Removes the head if it is still entry `id`.
    pub fn pop_if_head(&mut self, id: u64) -> Option<PendingEntry> {
        if self.entries.front().map(|e| e.id) == Some(id) {
            self.entries.pop_front()
        } else {
            None
        }
    }

    /// Counts a failed attempt against entry `id`. Returns the new count.
    pub fn record_failure(&mut self, id: u64) -> Option<u32> {
        let entry = self.entries.iter_mut().find(|e| e.id == id)?;
        entry.attempts = entry.attempts.saturating_add(1);
        Some(entry.attempts)
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries, head first.
    pub fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.iter()
    }

    fn evict_overflow(&mut self) -> Vec<PendingEntry> {
        let excess = self.entries.len().saturating_sub(self.max_pending);
        self.entries.drain(..excess).collect()
    }
}
