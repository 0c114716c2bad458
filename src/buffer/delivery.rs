use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};

use crate::bus::Bus;
use crate::config::BufferConfig;
use crate::connectivity::{ConnectivityState, ConnectivityView};
use crate::error::{ExecutionError, SyncError, SyncResult};
use crate::statement::{ChangeNotification, MutationBatch};
use crate::store::StoreClient;

use super::log::{QueueLog, QueueRecord};
use super::queue::{PendingEntry, PendingQueue};
use super::{BatchSink, RetryPolicy};

/// Counters describing the buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Entries waiting for delivery.
    pub depth: usize,
    /// Entries the store accepted.
    pub applied: u64,
    /// Entries dropped after a permanent rejection.
    pub poisoned: u64,
    /// Entries dropped because the queue overflowed.
    pub evicted: u64,
    /// Transient failures since the last success.
    pub consecutive_failures: u32,
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries applied during this cycle.
    pub applied: usize,
    /// Entries dropped after a permanent rejection during this cycle.
    pub poisoned: usize,
    /// The head entry failed transiently and is still queued.
    pub retry_pending: bool,
    /// Nothing was attempted because the store is disconnected.
    pub suspended: bool,
}

/// Ordered at-least-once delivery of batches to the store.
pub struct DeliveryBuffer {
    cfg: BufferConfig,
    store: Arc<dyn StoreClient>,
    connectivity: ConnectivityView,
    queue: Mutex<PendingQueue>,
    drain_lock: Mutex<()>,
    notifications: Bus<ChangeNotification>,
    applied: AtomicU64,
    poisoned: AtomicU64,
    evicted: AtomicU64,
    consecutive_failures: AtomicU32,
    closed: AtomicBool,
    journal: Option<QueueLog>,
}

impl std::fmt::Debug for DeliveryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryBuffer")
            .field("stats", &self.stats())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DeliveryBuffer {
    /// Creates a buffer, restoring queued entries from the configured journal.
    ///
    /// The journal is rewritten to hold only the restored entries and then
    /// appended to by a writer thread.
    ///
    /// # Errors
    /// Fails if the journal exists but cannot be read, or cannot be rewritten.
    pub fn new(
        cfg: BufferConfig,
        store: Arc<dyn StoreClient>,
        connectivity: ConnectivityView,
    ) -> SyncResult<Self> {
        let (queue, journal) = match &cfg.journal_path {
            Some(path) => {
                let queue = match QueueLog::replay(path)? {
                    Some(image) => {
                        let queue = PendingQueue::restore(image, cfg.max_pending);
                        info!(
                            restored = queue.len(),
                            path = %path.display(),
                            "restored pending batches from journal"
                        );
                        queue
                    }
                    None => PendingQueue::new(cfg.max_pending),
                };
                let journal = QueueLog::start(path.clone(), queue.image())?;
                (queue, Some(journal))
            }
            None => (PendingQueue::new(cfg.max_pending), None),
        };

        Ok(Self {
            cfg,
            store,
            connectivity,
            queue: Mutex::new(queue),
            drain_lock: Mutex::new(()),
            notifications: Bus::new(),
            applied: AtomicU64::new(0),
            poisoned: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            journal,
        })
    }

    /// Appends a batch. Never blocks on the store or on the journal.
    ///
    /// # Errors
    /// Fails only after [`close`](Self::close).
    pub fn enqueue(&self, batch: MutationBatch) -> SyncResult<PendingEntry> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Execution(ExecutionError::ShuttingDown {
                component: "delivery_buffer".to_string(),
            }));
        }

        let (entry, evicted) = {
            let mut queue = self.lock_queue()?;
            let (entry, evicted) = queue.push(batch, Utc::now());
            self.record(QueueRecord::Enqueued {
                entry: entry.clone(),
            });
            for dropped in &evicted {
                self.record(QueueRecord::Removed { id: dropped.id });
            }
            (entry, evicted)
        };

        debug!(
            entry = entry.id,
            category = %entry.batch.origin().category,
            deletes = entry.batch.delete_set().len(),
            inserts = entry.batch.insert_set().len(),
            "batch enqueued"
        );
        for dropped in &evicted {
            warn!(
                entry = dropped.id,
                attempts = dropped.attempts,
                max_pending = self.cfg.max_pending,
                "pending queue full, evicted oldest batch"
            );
        }
        self.evicted.fetch_add(evicted.len() as u64, Ordering::Relaxed);
        Ok(entry)
    }

    /// Applies queued batches in order until the queue is empty, the head
    /// fails transiently, or the store is reported disconnected.
    ///
    /// # Errors
    /// Fails if an internal lock is poisoned.
    pub fn drain(&self) -> SyncResult<DrainReport> {
        let _guard = self
            .drain_lock
            .lock()
            .map_err(|_| SyncError::internal("drain lock poisoned"))?;
        let mut report = DrainReport::default();

        loop {
            if self.connectivity.state() == ConnectivityState::Disconnected {
                report.suspended = report.applied == 0 && report.poisoned == 0;
                break;
            }
            let Some(head) = self.lock_queue()?.head().cloned() else {
                break;
            };

            match self.store.update(&head.batch) {
                Ok(()) => {
                    self.remove_head(head.id)?;
                    self.applied.fetch_add(1, Ordering::Relaxed);
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    report.applied += 1;
                    debug!(entry = head.id, attempts = head.attempts, "batch applied");
                    let notification =
                        ChangeNotification::from_origin(head.batch.origin(), head.id, Utc::now());
                    self.notifications.publish(&notification);
                }
                Err(e) if e.is_retryable() => {
                    let attempts = {
                        let mut queue = self.lock_queue()?;
                        let attempts = queue.record_failure(head.id);
                        if let Some(attempts) = attempts {
                            self.record(QueueRecord::Attempted {
                                id: head.id,
                                attempts,
                            });
                        }
                        attempts
                    };
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        entry = head.id,
                        attempts = attempts.unwrap_or(head.attempts),
                        consecutive_failures = failures,
                        error = %e,
                        "batch delivery failed, will retry"
                    );
                    report.retry_pending = true;
                    break;
                }
                Err(e) => {
                    self.remove_head(head.id)?;
                    self.poisoned.fetch_add(1, Ordering::Relaxed);
                    report.poisoned += 1;
                    error!(
                        entry = head.id,
                        attempts = head.attempts,
                        created_at = %head.created_at,
                        category = %head.batch.origin().category,
                        deletes = ?head.batch.delete_set(),
                        inserts = ?head.batch.insert_set(),
                        error = %e,
                        "store rejected batch, dropping it"
                    );
                }
            }

            if self.closed.load(Ordering::Acquire) {
                break;
            }
        }
        Ok(report)
    }

    /// Subscribe to notifications for applied batches.
    pub fn subscribe(&self) -> Receiver<ChangeNotification> {
        self.notifications.subscribe()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            depth: self.depth(),
            applied: self.applied.load(Ordering::Relaxed),
            poisoned: self.poisoned.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }

    /// Number of queued entries.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Copy of the queued entries, head first.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingEntry> {
        self.queue
            .lock()
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stops accepting batches. A drain in progress stops after its current
    /// attempt.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits until every queue change so far is on disk. A no-op without a
    /// journal.
    ///
    /// # Errors
    /// Fails if the journal writer has stopped.
    pub fn flush_journal(&self) -> SyncResult<()> {
        self.journal.as_ref().map_or(Ok(()), QueueLog::flush)
    }

    /// Starts the drain worker. It stops when `shutdown` fires or its sender
    /// is dropped, and logs what is left in the queue.
    ///
    /// # Errors
    /// Fails if the thread cannot be spawned.
    pub fn spawn(self: &Arc<Self>, shutdown: Receiver<()>) -> SyncResult<JoinHandle<()>> {
        let buffer = Arc::clone(self);
        thread::Builder::new()
            .name("ontosync-buffer".to_string())
            .spawn(move || {
                let tick = buffer.cfg.tick();
                let policy = buffer.cfg.retry_policy();
                loop {
                    let delay = match buffer.drain() {
                        Ok(report) if report.retry_pending => buffer.backoff(policy),
                        Ok(_) => tick,
                        Err(e) => {
                            error!(error = %e, "drain cycle failed");
                            tick
                        }
                    };
                    match shutdown.recv_timeout(delay) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                let left = buffer.depth();
                if left > 0 {
                    warn!(pending = left, "delivery buffer stopped with undelivered batches");
                } else {
                    info!("delivery buffer stopped, queue empty");
                }
            })
            .map_err(|e| SyncError::internal(format!("failed to spawn delivery buffer: {e}")))
    }

    fn backoff(&self, policy: RetryPolicy) -> Duration {
        policy.delay_for(self.consecutive_failures.load(Ordering::Relaxed))
    }

    fn remove_head(&self, id: u64) -> SyncResult<()> {
        let mut queue = self.lock_queue()?;
        if queue.pop_if_head(id).is_some() {
            self.record(QueueRecord::Removed { id });
        }
        Ok(())
    }

    fn lock_queue(&self) -> SyncResult<MutexGuard<'_, PendingQueue>> {
        self.queue
            .lock()
            .map_err(|_| SyncError::internal("pending queue lock poisoned"))
    }

    /// Must be called with the queue lock held so records keep queue order.
    fn record(&self, record: QueueRecord) {
        if let Some(journal) = &self.journal {
            journal.record(record);
        }
    }
}

impl BatchSink for DeliveryBuffer {
    fn submit(&self, batch: MutationBatch) -> SyncResult<()> {
        self.enqueue(batch).map(|_| ())
    }
}
