//! Wiring of the whole pipeline.
//!
//! `SyncService::start` builds every subsystem from one configuration, spawns
//! their workers and returns a handle owning them. Nothing is global: two
//! services in one process are independent.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::buffer::{BufferStats, DeliveryBuffer};
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityEvent, ConnectivityTracker};
use crate::error::{SyncError, SyncResult};
use crate::mapper::Mapper;
use crate::registry::{ChangeDetector, RegistrySource, StateObservation};
use crate::store::StoreClient;
use crate::trigger::TriggerEngine;

/// What was left when the service stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Batches still queued. They survive in the journal if one is configured.
    pub pending: usize,
    /// Buffer counters at shutdown.
    pub stats: BufferStats,
}

/// A running synchronization service.
#[derive(Debug)]
pub struct SyncService {
    tracker: Arc<ConnectivityTracker>,
    buffer: Arc<DeliveryBuffer>,
    detector: Arc<ChangeDetector>,
    triggers: TriggerEngine,
    shutdown_tx: Option<Sender<()>>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl SyncService {
    /// Builds and starts every subsystem.
    ///
    /// Startup order: the tracker closes any phase left open by a previous
    /// run, then the probe, drain, registry and detector workers start.
    ///
    /// # Errors
    /// Fails on invalid configuration, unreadable journals or if a worker
    /// cannot be spawned.
    pub fn start(
        config: SyncConfig,
        store: Arc<dyn StoreClient>,
        registry: Arc<dyn RegistrySource>,
        observations: Option<Receiver<StateObservation>>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let tracker = Arc::new(ConnectivityTracker::new(
            config.connectivity.clone(),
            Arc::clone(&store),
        )?);
        let phase_events = tracker.subscribe();
        let trigger_events = tracker.subscribe();

        let buffer = Arc::new(DeliveryBuffer::new(
            config.buffer.clone(),
            Arc::clone(&store),
            tracker.view(),
        )?);
        let triggers = TriggerEngine::new(
            config.triggers.clone(),
            Arc::clone(&store),
            tracker.view(),
            buffer.subscribe(),
            trigger_events,
        )?;
        let detector = Arc::new(ChangeDetector::new(config.detector.clone(), buffer.clone()));

        let mut service = Self {
            tracker,
            buffer,
            detector,
            triggers,
            shutdown_tx: Some(shutdown_tx),
            workers: Vec::new(),
        };

        let recorder = spawn_phase_recorder(
            Arc::clone(&service.buffer),
            phase_events,
            shutdown_rx.clone(),
        )?;
        service.workers.push(("phase-recorder", recorder));

        service.tracker.recover()?;

        let probe = service.tracker.spawn(shutdown_rx.clone())?;
        service.workers.push(("connectivity", probe));
        let drain = service.buffer.spawn(shutdown_rx.clone())?;
        service.workers.push(("buffer", drain));
        if let Some(watch) = registry.watch(shutdown_rx.clone())? {
            service.workers.push(("registry-watch", watch));
        }
        let detect = service.detector.spawn(registry, observations, shutdown_rx)?;
        service.workers.push(("detector", detect));

        info!(
            query_endpoint = %config.store.query_endpoint,
            update_endpoint = %config.store.update_endpoint,
            "sync service started"
        );
        Ok(service)
    }

    /// The delivery buffer.
    #[must_use]
    pub fn buffer(&self) -> &DeliveryBuffer {
        &self.buffer
    }

    /// The connectivity tracker.
    #[must_use]
    pub fn tracker(&self) -> &ConnectivityTracker {
        &self.tracker
    }

    /// The change detector.
    #[must_use]
    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    /// Trigger registration and activation streams.
    #[must_use]
    pub const fn triggers(&self) -> &TriggerEngine {
        &self.triggers
    }

    /// Stops every worker and reports what is left in the queue.
    ///
    /// The buffer stops accepting batches first; a delivery in flight is
    /// allowed to finish.
    pub fn shutdown(mut self) -> ShutdownReport {
        self.stop()
    }

    fn stop(&mut self) -> ShutdownReport {
        self.buffer.close();
        drop(self.shutdown_tx.take());
        for (name, handle) in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!(worker = name, "worker panicked");
            }
        }
        self.triggers.shutdown();
        if let Err(e) = self.buffer.flush_journal() {
            warn!(error = %e, "pending queue journal was not flushed");
        }

        let stats = self.buffer.stats();
        if stats.depth > 0 {
            warn!(pending = stats.depth, "sync service stopped with undelivered batches");
        }
        info!(
            applied = stats.applied,
            poisoned = stats.poisoned,
            evicted = stats.evicted,
            "sync service stopped"
        );
        ShutdownReport {
            pending: stats.depth,
            stats,
        }
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        if self.shutdown_tx.is_some() {
            self.stop();
        }
    }
}

/// Turns phase events into phase batches on the buffer.
fn spawn_phase_recorder(
    buffer: Arc<DeliveryBuffer>,
    events: Receiver<ConnectivityEvent>,
    shutdown: Receiver<()>,
) -> SyncResult<JoinHandle<()>> {
    thread::Builder::new()
        .name("ontosync-phase-recorder".to_string())
        .spawn(move || {
            let mapper = Mapper::new();
            loop {
                select! {
                    recv(events) -> msg => {
                        let Ok(event) = msg else { break };
                        let Some(phase) = event.phase() else { continue };
                        match mapper.map_phase(phase) {
                            Ok(batch) => {
                                if let Err(e) = buffer.enqueue(batch) {
                                    debug!(error = %e, "phase batch not enqueued");
                                }
                            }
                            Err(e) => {
                                warn!(
                                    phase = %phase.phase_id,
                                    error = %e,
                                    "phase could not be mapped"
                                );
                            }
                        }
                    }
                    recv(shutdown) -> _ => break,
                }
            }
        })
        .map_err(|e| SyncError::internal(format!("failed to spawn phase recorder: {e}")))
}
