//! Write-behind persistence of the pending queue.
//!
//! Queue mutations are sent as records to a writer thread, which appends them
//! to a [`RecordLog`] and fsyncs once per burst. The caller never waits for
//! disk. When the log grows well past the live queue it is rewritten as a
//! snapshot of the live entries.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::journal::RecordLog;

use super::queue::{PendingEntry, QueueImage};

/// Appended records before a rewrite is considered.
const COMPACT_MIN_RECORDS: usize = 4096;

/// One queue mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum QueueRecord {
    Sequence { next_id: u64 },
    Enqueued { entry: PendingEntry },
    Attempted { id: u64, attempts: u32 },
    Removed { id: u64 },
}

enum LogMsg {
    Record(QueueRecord),
    Flush(Sender<()>),
}

impl std::fmt::Debug for LogMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Record(record) => f.debug_tuple("Record").field(record).finish(),
            Self::Flush(_) => f.write_str("Flush"),
        }
    }
}

/// Mirror of the persisted queue kept by the writer thread.
#[derive(Debug, Default)]
struct Mirror {
    next_id: u64,
    entries: VecDeque<PendingEntry>,
}

impl Mirror {
    fn from_image(image: QueueImage) -> Self {
        Self {
            next_id: image.next_id,
            entries: image.entries.into(),
        }
    }

    fn apply(&mut self, record: &QueueRecord) {
        match record {
            QueueRecord::Sequence { next_id } => self.next_id = self.next_id.max(*next_id),
            QueueRecord::Enqueued { entry } => {
                self.next_id = self.next_id.max(entry.id + 1);
                self.entries.push_back(entry.clone());
            }
            QueueRecord::Attempted { id, attempts } => {
                if let Some(entry) = self.entries.iter_mut().find(|e| e.id == *id) {
                    entry.attempts = *attempts;
                }
            }
            QueueRecord::Removed { id } => {
                if let Some(pos) = self.entries.iter().position(|e| e.id == *id) {
                    self.entries.remove(pos);
                }
            }
        }
    }

    fn snapshot(&self) -> Vec<QueueRecord> {
        std::iter::once(QueueRecord::Sequence {
            next_id: self.next_id,
        })
        .chain(self.entries.iter().map(|entry| QueueRecord::Enqueued {
            entry: entry.clone(),
        }))
        .collect()
    }

    fn into_image(self) -> QueueImage {
        QueueImage {
            next_id: self.next_id,
            entries: self.entries.into(),
        }
    }
}

/// Handle on the queue log writer.
#[derive(Debug)]
pub(crate) struct QueueLog {
    path: PathBuf,
    tx: Option<Sender<LogMsg>>,
    worker: Option<JoinHandle<()>>,
}

impl QueueLog {
    /// Replays the log at `path` into a queue image.
    ///
    /// # Errors
    /// Fails if the log exists but is unreadable or corrupt.
    pub(crate) fn replay(path: &Path) -> SyncResult<Option<QueueImage>> {
        let Some(replay) = RecordLog::<QueueRecord>::read(path)? else {
            return Ok(None);
        };
        if replay.torn_tail {
            warn!(path = %path.display(), "queue log ends in a partial record, ignoring it");
        }
        let mut mirror = Mirror {
            next_id: 1,
            ..Mirror::default()
        };
        for record in &replay.records {
            mirror.apply(record);
        }
        Ok(Some(mirror.into_image()))
    }

    /// Rewrites the log as `image` and starts the writer thread.
    ///
    /// # Errors
    /// Fails if the log cannot be written or the thread cannot be spawned.
    pub(crate) fn start(path: PathBuf, image: QueueImage) -> SyncResult<Self> {
        let mirror = Mirror::from_image(image);
        let log = RecordLog::create(path.clone(), &mirror.snapshot())?;
        let (tx, rx) = unbounded();
        let worker = thread::Builder::new()
            .name("ontosync-queue-log".to_string())
            .spawn(move || write_loop(log, mirror, &rx))
            .map_err(|e| SyncError::internal(format!("failed to spawn queue log writer: {e}")))?;
        Ok(Self {
            path,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Hands a record to the writer. Never blocks.
    pub(crate) fn record(&self, record: QueueRecord) {
        let sent = self
            .tx
            .as_ref()
            .is_some_and(|tx| tx.send(LogMsg::Record(record)).is_ok());
        if !sent {
            warn!(path = %self.path.display(), "queue log writer is gone, record lost");
        }
    }

    /// Waits until every record handed over so far is on disk.
    ///
    /// # Errors
    /// Fails if the writer thread has stopped.
    pub(crate) fn flush(&self) -> SyncResult<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .as_ref()
            .ok_or_else(|| SyncError::disconnected("queue_log"))?
            .send(LogMsg::Flush(ack_tx))
            .map_err(|_| SyncError::disconnected("queue_log"))?;
        ack_rx.recv().map_err(|_| SyncError::disconnected("queue_log"))
    }
}

impl Drop for QueueLog {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(path = %self.path.display(), "queue log writer panicked");
            }
        }
    }
}

fn write_loop(mut log: RecordLog<QueueRecord>, mut mirror: Mirror, rx: &Receiver<LogMsg>) {
    let mut appended = 0usize;
    while let Ok(first) = rx.recv() {
        let mut waiters = Vec::new();
        for msg in std::iter::once(first).chain(rx.try_iter()) {
            match msg {
                LogMsg::Record(record) => {
                    mirror.apply(&record);
                    if let Err(e) = log.append(&record) {
                        warn!(error = %e, "failed to append queue record");
                    }
                    appended += 1;
                }
                LogMsg::Flush(ack) => waiters.push(ack),
            }
        }

        if appended >= COMPACT_MIN_RECORDS && appended > 2 * mirror.entries.len() {
            match RecordLog::create(log.path().to_path_buf(), &mirror.snapshot()) {
                Ok(fresh) => {
                    debug!(appended, live = mirror.entries.len(), "compacted queue log");
                    log = fresh;
                    appended = 0;
                }
                Err(e) => {
                    warn!(error = %e, "failed to compact queue log");
                    if let Err(e) = log.sync() {
                        warn!(error = %e, "failed to sync queue log");
                    }
                }
            }
        } else if let Err(e) = log.sync() {
            warn!(error = %e, "failed to sync queue log");
        }

        for ack in waiters {
            let _ = ack.send(());
        }
    }
    if let Err(e) = log.sync() {
        warn!(error = %e, "failed to sync queue log on close");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::{ChangeCategory, ChangeOrigin, MutationBatch, Statement};
    use chrono::Utc;

    fn entry(id: u64) -> PendingEntry {
        PendingEntry {
            id,
            batch: MutationBatch::builder(ChangeOrigin::new(ChangeCategory::Unknown))
                .insert(Statement::new(format!("<u{id}>"), "ont:hasLabel", "\"x\""))
                .build()
                .unwrap(),
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn replay_applies_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.log");
        {
            let log = QueueLog::start(path.clone(), QueueImage::default()).unwrap();
            log.record(QueueRecord::Enqueued { entry: entry(1) });
            log.record(QueueRecord::Enqueued { entry: entry(2) });
            log.record(QueueRecord::Attempted { id: 1, attempts: 3 });
            log.record(QueueRecord::Removed { id: 1 });
            log.record(QueueRecord::Attempted { id: 2, attempts: 1 });
            log.flush().unwrap();
        }

        let image = QueueLog::replay(&path).unwrap().unwrap();
        assert_eq!(image.next_id, 3);
        assert_eq!(image.entries.len(), 1);
        assert_eq!((image.entries[0].id, image.entries[0].attempts), (2, 1));
    }

    #[test]
    fn compaction_keeps_only_live_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.log");
        let log = QueueLog::start(path.clone(), QueueImage::default()).unwrap();
        let total = COMPACT_MIN_RECORDS as u64;
        for id in 1..=total {
            log.record(QueueRecord::Enqueued { entry: entry(id) });
            log.record(QueueRecord::Removed { id });
        }
        log.record(QueueRecord::Enqueued { entry: entry(total + 1) });
        log.flush().unwrap();
        drop(log);

        let replay = RecordLog::<QueueRecord>::read(&path).unwrap().unwrap();
        assert!(replay.records.len() <= COMPACT_MIN_RECORDS + 2);
        let image = QueueLog::replay(&path).unwrap().unwrap();
        assert_eq!(image.entries.len(), 1);
        assert_eq!(image.entries[0].id, total + 1);
        assert_eq!(image.next_id, total + 2);
    }
}
