//! Where registry snapshots come from.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::error::{ExecutionError, SyncError, SyncResult};

use super::RegistrySnapshot;

fn registry_err(message: impl Into<String>) -> SyncError {
    SyncError::Execution(ExecutionError::Registry {
        message: message.into(),
    })
}

/// Provider of full registry snapshots.
pub trait RegistrySource: Send + Sync {
    /// The current snapshot. Used for the baseline.
    fn fetch(&self) -> SyncResult<RegistrySnapshot>;

    /// Snapshots published after this call.
    fn subscribe(&self) -> Receiver<RegistrySnapshot>;

    /// Starts whatever background work the source needs to publish. The
    /// default does nothing.
    fn watch(&self, _shutdown: Receiver<()>) -> SyncResult<Option<JoinHandle<()>>> {
        Ok(None)
    }
}

/// Source fed programmatically, for embedding and tests.
#[derive(Debug, Default)]
pub struct ChannelRegistrySource {
    current: RwLock<Option<RegistrySnapshot>>,
    updates: Bus<RegistrySnapshot>,
}

impl ChannelRegistrySource {
    /// A source with no snapshot yet; `fetch` fails until one is published.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A source whose `fetch` returns `snapshot` right away.
    #[must_use]
    pub fn with_snapshot(snapshot: RegistrySnapshot) -> Self {
        let source = Self::new();
        if let Ok(mut current) = source.current.write() {
            *current = Some(snapshot);
        }
        source
    }

    /// Replaces the current snapshot and notifies subscribers.
    pub fn publish(&self, snapshot: RegistrySnapshot) {
        if let Ok(mut current) = self.current.write() {
            *current = Some(snapshot.clone());
        }
        self.updates.publish(&snapshot);
    }
}

impl RegistrySource for ChannelRegistrySource {
    fn fetch(&self) -> SyncResult<RegistrySnapshot> {
        self.current
            .read()
            .map_err(|_| SyncError::internal("registry source lock poisoned"))?
            .clone()
            .ok_or_else(|| registry_err("no snapshot published yet"))
    }

    fn subscribe(&self) -> Receiver<RegistrySnapshot> {
        self.updates.subscribe()
    }
}

#[derive(Debug)]
struct FileWatch {
    path: PathBuf,
    poll_interval: Duration,
    updates: Bus<RegistrySnapshot>,
}

impl FileWatch {
    fn read(&self) -> SyncResult<RegistrySnapshot> {
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| registry_err(format!("cannot read {}: {e}", self.path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| registry_err(format!("malformed snapshot {}: {e}", self.path.display())))
    }

    fn modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}

/// Snapshot read from a JSON file and republished whenever the file's
/// modification time changes.
#[derive(Debug, Clone)]
pub struct FileRegistrySource {
    inner: Arc<FileWatch>,
}

impl FileRegistrySource {
    /// A source reading `path` and checking it every `poll_interval`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            inner: Arc::new(FileWatch {
                path: path.into(),
                poll_interval,
                updates: Bus::new(),
            }),
        }
    }

    /// The watched file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl RegistrySource for FileRegistrySource {
    fn fetch(&self) -> SyncResult<RegistrySnapshot> {
        self.inner.read()
    }

    fn subscribe(&self) -> Receiver<RegistrySnapshot> {
        self.inner.updates.subscribe()
    }

    fn watch(&self, shutdown: Receiver<()>) -> SyncResult<Option<JoinHandle<()>>> {
        let watch = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("ontosync-registry-file".to_string())
            .spawn(move || {
                let mut seen = watch.modified();
                loop {
                    match shutdown.recv_timeout(watch.poll_interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let modified = watch.modified();
                    if modified.is_none() || modified == seen {
                        continue;
                    }
                    match watch.read() {
                        Ok(snapshot) => {
                            seen = modified;
                            debug!(
                                path = %watch.path.display(),
                                units = snapshot.len(),
                                "registry file changed"
                            );
                            watch.updates.publish(&snapshot);
                        }
                        Err(e) => warn!(error = %e, "ignoring unreadable registry file"),
                    }
                }
            })
            .map_err(|e| SyncError::internal(format!("failed to spawn registry watcher: {e}")))?;
        Ok(Some(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::UnitRecord;

    #[test]
    fn channel_source_fails_until_published() {
        let source = ChannelRegistrySource::new();
        assert!(source.fetch().is_err());
        let rx = source.subscribe();
        let snapshot =
            RegistrySnapshot::from_units([UnitRecord::new("l1", "Light", "Lamp")]).unwrap();
        source.publish(snapshot.clone());
        assert_eq!(source.fetch().unwrap(), snapshot);
        assert_eq!(rx.try_recv().unwrap(), snapshot);
    }

    #[test]
    fn file_source_reads_unit_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(
            &path,
            r#"{"units": [{"id": "l1", "unit_type": "Light", "label": "Lamp"}]}"#,
        )
        .unwrap();
        let source = FileRegistrySource::new(&path, Duration::from_millis(20));
        let snapshot = source.fetch().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get("l1").unwrap().enabled);
    }

    #[test]
    fn missing_file_is_a_registry_error() {
        let source =
            FileRegistrySource::new("/nonexistent/registry.json", Duration::from_millis(20));
        let err = source.fetch().unwrap_err();
        assert!(matches!(err, SyncError::Execution(ExecutionError::Registry { .. })));
    }
}
