//! Change detector: turns successive registry snapshots into batches.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{never, select, Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::buffer::BatchSink;
use crate::config::DetectorConfig;
use crate::error::{SyncError, SyncResult};
use crate::mapper::Mapper;

use super::{diff, ChangeSet, RegistrySnapshot, RegistrySource, StateObservation};

/// Lifecycle of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DetectorState {
    /// Constructed, not yet started.
    Init = 0,
    /// Waiting for the first snapshot to become available.
    WaitingForSnapshot = 1,
    /// A baseline is established; later snapshots are diffed against it.
    Steady = 2,
}

impl DetectorState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::WaitingForSnapshot,
            2 => Self::Steady,
            _ => Self::Init,
        }
    }
}

/// What applying one snapshot produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotOutcome {
    /// The snapshot was the first one seen.
    pub baseline: bool,
    /// Units new in this snapshot.
    pub added: usize,
    /// Units whose record changed.
    pub updated: usize,
    /// Units no longer present.
    pub removed: usize,
    /// Batches handed to the sink.
    pub enqueued: usize,
    /// Records that failed to map.
    pub failed: usize,
}

/// Detects registry changes and feeds mapped batches to a sink.
pub struct ChangeDetector {
    cfg: DetectorConfig,
    mapper: Mapper,
    sink: Arc<dyn BatchSink>,
    state: AtomicU8,
    current: RwLock<Option<Arc<RegistrySnapshot>>>,
    mapping_failures: AtomicU64,
}

impl std::fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeDetector")
            .field("state", &self.state())
            .field("mapping_failures", &self.mapping_failures())
            .finish_non_exhaustive()
    }
}

impl ChangeDetector {
    /// A detector handing mapped batches to `sink`.
    #[must_use]
    pub fn new(cfg: DetectorConfig, sink: Arc<dyn BatchSink>) -> Self {
        Self {
            cfg,
            mapper: Mapper::new(),
            sink,
            state: AtomicU8::new(DetectorState::Init as u8),
            current: RwLock::new(None),
            mapping_failures: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DetectorState {
        DetectorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The last applied snapshot.
    #[must_use]
    pub fn current(&self) -> Option<Arc<RegistrySnapshot>> {
        self.current.read().ok().and_then(|c| c.clone())
    }

    /// Records that failed to map so far.
    #[must_use]
    pub fn mapping_failures(&self) -> u64 {
        self.mapping_failures.load(Ordering::Relaxed)
    }

    /// Fetches the first snapshot, retrying with backoff until it succeeds
    /// or `shutdown` fires.
    ///
    /// Returns `Ok(None)` if shut down before a baseline was obtained.
    ///
    /// # Errors
    /// Fails if the baseline cannot be handed to the sink.
    pub fn establish_baseline(
        &self,
        source: &dyn RegistrySource,
        shutdown: &Receiver<()>,
    ) -> SyncResult<Option<SnapshotOutcome>> {
        self.state
            .store(DetectorState::WaitingForSnapshot as u8, Ordering::Release);
        let policy = self.cfg.baseline_retry();
        let mut failures = 0u32;

        loop {
            match source.fetch() {
                Ok(snapshot) => return self.apply_snapshot(snapshot).map(Some),
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = policy.delay_for(failures);
                    warn!(
                        error = %e,
                        attempt = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "registry snapshot unavailable"
                    );
                    match shutdown.recv_timeout(delay) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(None),
                    }
                }
            }
        }
    }

    /// Applies a new snapshot.
    ///
    /// The first snapshot is the baseline and every unit in it is treated
    /// as added. Later snapshots are diffed against the previous one.
    ///
    /// # Errors
    /// Fails if the sink refuses a batch. The snapshot still becomes current.
    pub fn apply_snapshot(&self, next: RegistrySnapshot) -> SyncResult<SnapshotOutcome> {
        let next = Arc::new(next);
        let previous = {
            let mut current = self
                .current
                .write()
                .map_err(|_| SyncError::internal("detector snapshot lock poisoned"))?;
            current.replace(Arc::clone(&next))
        };
        self.state.store(DetectorState::Steady as u8, Ordering::Release);

        let baseline = previous.is_none();
        let (changes, previous) = match previous {
            Some(prev) => (diff(&prev, &next), prev),
            None => (ChangeSet::baseline(&next), Arc::new(RegistrySnapshot::empty())),
        };
        let mut outcome = SnapshotOutcome {
            baseline,
            added: changes.added.len(),
            updated: changes.updated.len(),
            removed: changes.removed.len(),
            ..SnapshotOutcome::default()
        };
        if changes.is_empty() {
            debug!(units = next.len(), "registry snapshot unchanged");
            return Ok(outcome);
        }

        let mapped = self.mapper.map_change_set(&changes, &previous);
        outcome.failed = mapped.failed();
        self.mapping_failures
            .fetch_add(outcome.failed as u64, Ordering::Relaxed);

        for batch in mapped.batches {
            self.sink.submit(batch)?;
            outcome.enqueued += 1;
        }

        info!(
            added = outcome.added,
            updated = outcome.updated,
            removed = outcome.removed,
            enqueued = outcome.enqueued,
            failed = outcome.failed,
            "registry changes enqueued"
        );
        Ok(outcome)
    }

    /// Maps and enqueues one state observation, typed by the unit's record in
    /// the current snapshot.
    ///
    /// Returns `Ok(false)` if the observation could not be mapped.
    ///
    /// # Errors
    /// Fails if the sink refuses the batch.
    pub fn observe(&self, observation: &StateObservation) -> SyncResult<bool> {
        let unit_type = self
            .current()
            .and_then(|s| s.get(&observation.unit_id).map(|u| u.unit_type.clone()));

        match self.mapper.map_observation(observation, unit_type.as_deref()) {
            Ok(batch) => {
                self.sink.submit(batch)?;
                Ok(true)
            }
            Err(e) => {
                self.mapping_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    unit = %observation.unit_id,
                    service = %observation.service,
                    error = %e,
                    "dropping unmappable observation"
                );
                Ok(false)
            }
        }
    }

    /// Starts the detector worker: baseline first, then snapshots and
    /// observations as they arrive.
    ///
    /// # Errors
    /// Fails if the thread cannot be spawned.
    pub fn spawn(
        self: &Arc<Self>,
        source: Arc<dyn RegistrySource>,
        observations: Option<Receiver<StateObservation>>,
        shutdown: Receiver<()>,
    ) -> SyncResult<JoinHandle<()>> {
        let detector = Arc::clone(self);
        thread::Builder::new()
            .name("ontosync-detector".to_string())
            .spawn(move || detector.run(source.as_ref(), observations, &shutdown))
            .map_err(|e| SyncError::internal(format!("failed to spawn change detector: {e}")))
    }

    fn run(
        &self,
        source: &dyn RegistrySource,
        observations: Option<Receiver<StateObservation>>,
        shutdown: &Receiver<()>,
    ) {
        // Subscribe before the baseline fetch so no update falls in between.
        let mut snapshots = source.subscribe();
        match self.establish_baseline(source, shutdown) {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => warn!(error = %e, "baseline could not be fully enqueued"),
        }

        let mut observations = observations.unwrap_or_else(never);
        loop {
            let (snapshot_rx, observation_rx) = (snapshots.clone(), observations.clone());
            select! {
                recv(snapshot_rx) -> msg => match msg {
                    Ok(snapshot) => {
                        if let Err(e) = self.apply_snapshot(snapshot) {
                            warn!(error = %e, "registry update could not be fully enqueued");
                        }
                    }
                    Err(_) => snapshots = never(),
                },
                recv(observation_rx) -> msg => match msg {
                    Ok(observation) => {
                        if let Err(e) = self.observe(&observation) {
                            warn!(error = %e, "observation could not be enqueued");
                        }
                    }
                    Err(_) => observations = never(),
                },
                recv(shutdown) -> _ => break,
            }
        }
        debug!("change detector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::registry::{ChannelRegistrySource, ObservationValue, UnitRecord};
    use crate::statement::{ChangeCategory, MutationBatch};

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<MutationBatch>>);

    impl BatchSink for CollectingSink {
        fn submit(&self, batch: MutationBatch) -> SyncResult<()> {
            self.0.lock().unwrap().push(batch);
            Ok(())
        }
    }

    impl CollectingSink {
        fn take(&self) -> Vec<MutationBatch> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    fn snapshot(units: Vec<UnitRecord>) -> RegistrySnapshot {
        RegistrySnapshot::from_units(units).unwrap()
    }

    fn detector() -> (ChangeDetector, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        (ChangeDetector::new(DetectorConfig::default(), sink.clone()), sink)
    }

    #[test]
    fn baseline_enqueues_every_unit_as_added() {
        let (detector, sink) = detector();
        assert_eq!(detector.state(), DetectorState::Init);

        let outcome = detector
            .apply_snapshot(snapshot(vec![
                UnitRecord::new("l1", "Light", "Lamp"),
                UnitRecord::new("d1", "Door", "Front door"),
            ]))
            .unwrap();

        assert!(outcome.baseline);
        assert_eq!(outcome.enqueued, 2);
        assert_eq!(detector.state(), DetectorState::Steady);
        assert!(sink.take().iter().all(MutationBatch::is_insert_only));
    }

    #[test]
    fn later_snapshots_are_diffed() {
        let (detector, sink) = detector();
        detector
            .apply_snapshot(snapshot(vec![
                UnitRecord::new("l1", "Light", "Lamp"),
                UnitRecord::new("d1", "Door", "Front door"),
            ]))
            .unwrap();
        sink.take();

        let outcome = detector
            .apply_snapshot(snapshot(vec![
                UnitRecord::new("l1", "Light", "Desk lamp"),
                UnitRecord::new("w1", "Window", "Kitchen window"),
            ]))
            .unwrap();

        assert!(!outcome.baseline);
        assert_eq!((outcome.added, outcome.updated, outcome.removed), (1, 1, 1));
        assert_eq!(sink.take().len(), 3);

        let unchanged = detector.apply_snapshot((*detector.current().unwrap()).clone()).unwrap();
        assert_eq!(unchanged.enqueued, 0);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn bad_records_are_counted_and_others_still_enqueued() {
        let (detector, sink) = detector();
        let outcome = detector
            .apply_snapshot(snapshot(vec![
                UnitRecord::new("l1", "Light", "Lamp"),
                UnitRecord::new("x1", "not a type", "Broken"),
            ]))
            .unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.enqueued, 1);
        assert_eq!(detector.mapping_failures(), 1);
        assert_eq!(sink.take().len(), 1);
    }

    #[test]
    fn observations_are_typed_from_current_snapshot() {
        let (detector, sink) = detector();
        detector
            .apply_snapshot(snapshot(vec![UnitRecord::new("l1", "Light", "Lamp")]))
            .unwrap();
        sink.take();

        let obs = StateObservation::now("l1", "PowerState", ObservationValue::Bool(true));
        assert!(detector.observe(&obs).unwrap());

        let batches = sink.take();
        let origin = batches[0].origin();
        assert_eq!(origin.category, ChangeCategory::Observation);
        assert!(origin.unit_types.contains("Light"));
        assert!(origin.service_types.contains("PowerState"));
    }

    #[test]
    fn baseline_retries_until_source_has_snapshot() {
        let (detector, sink) = detector();
        let detector = Arc::new(detector);
        let source = Arc::new(ChannelRegistrySource::new());
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);

        let handle = detector.spawn(source.clone(), None, shutdown_rx).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(detector.state(), DetectorState::WaitingForSnapshot);

        source.publish(snapshot(vec![UnitRecord::new("l1", "Light", "Lamp")]));
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while detector.state() != DetectorState::Steady && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(detector.state(), DetectorState::Steady);

        drop(shutdown_tx);
        handle.join().unwrap();
        assert_eq!(sink.take().len(), 1);
    }
}
