//! Probe loop and phase bookkeeping.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::config::ConnectivityConfig;
use crate::error::{SyncError, SyncResult};
use crate::journal::Journal;
use crate::store::StoreClient;

use super::{
    ConnectionPhase, ConnectivityEvent, ConnectivityState, ConnectivityView, PhaseHistory,
};

/// Tracks store reachability as a sequence of connection phases.
pub struct ConnectivityTracker {
    cfg: ConnectivityConfig,
    store: Arc<dyn StoreClient>,
    view: ConnectivityView,
    history: Mutex<PhaseHistory>,
    events: Bus<ConnectivityEvent>,
    journal: Option<Journal<PhaseHistory>>,
}

impl std::fmt::Debug for ConnectivityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityTracker")
            .field("state", &self.view.state())
            .field("journal", &self.journal.as_ref().map(Journal::path))
            .finish_non_exhaustive()
    }
}

impl ConnectivityTracker {
    /// Creates a tracker, loading the phase history from the configured
    /// journal if there is one.
    ///
    /// A phase left open by a previous run stays open until [`recover`] is
    /// called, so subscribers can attach first and see it close.
    ///
    /// # Errors
    /// Fails if the journal exists but cannot be read.
    ///
    /// [`recover`]: Self::recover
    pub fn new(cfg: ConnectivityConfig, store: Arc<dyn StoreClient>) -> SyncResult<Self> {
        let journal = cfg.journal_path.as_ref().map(Journal::new);
        let mut history = match &journal {
            Some(j) => j.load()?.unwrap_or_default(),
            None => PhaseHistory::default(),
        };
        history.set_retention(Some(cfg.history_limit));

        Ok(Self {
            cfg,
            store,
            view: ConnectivityView::new(),
            history: Mutex::new(history),
            events: Bus::new(),
            journal,
        })
    }

    /// Read handle on the current state.
    #[must_use]
    pub fn view(&self) -> ConnectivityView {
        self.view.clone()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectivityState {
        self.view.state()
    }

    /// Subscribe to connectivity events.
    pub fn subscribe(&self) -> Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the retained phases, oldest first.
    #[must_use]
    pub fn phases(&self) -> Vec<ConnectionPhase> {
        self.history.lock().map(|h| h.phases().to_vec()).unwrap_or_default()
    }

    /// Closes a phase left open by a previous run at its last known refresh.
    ///
    /// # Errors
    /// Fails if the history lock is poisoned.
    pub fn recover(&self) -> SyncResult<Option<ConnectionPhase>> {
        let closed = {
            let mut history = self.lock_history()?;
            let closed = history.close();
            if closed.is_some() {
                self.persist(&history);
            }
            closed
        };
        if let Some(phase) = &closed {
            info!(
                phase = %phase.phase_id,
                last_seen = %phase.last_seen,
                "closed stale connection phase"
            );
            self.events.publish(&ConnectivityEvent::PhaseClosed(phase.clone()));
        }
        Ok(closed)
    }

    /// Runs one probe against the store and records the outcome.
    ///
    /// # Errors
    /// Fails if the history lock is poisoned.
    pub fn probe_once(&self) -> SyncResult<Vec<ConnectivityEvent>> {
        let ok = match self.store.probe() {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "store probe failed");
                false
            }
        };
        self.record_probe(ok, Utc::now())
    }

    /// Applies one probe outcome observed at `now`.
    ///
    /// Gaps are decided by failed probes: a failure disconnects once the last
    /// success is older than the tolerance. A success only ends the open
    /// phase when no probe at all was recorded for longer than the tolerance
    /// plus one probe interval, as happens when the process was suspended.
    ///
    /// # Errors
    /// Fails if the history lock is poisoned.
    pub fn record_probe(
        &self,
        ok: bool,
        now: DateTime<Utc>,
    ) -> SyncResult<Vec<ConnectivityEvent>> {
        let tolerance = millis(self.cfg.tolerance_ms);
        let stale_after = tolerance + millis(self.cfg.probe_interval_ms);
        let mut events = Vec::new();
        {
            let mut history = self.lock_history()?;
            let current = self.view.state();
            let silence = history
                .open_phase()
                .map(|p| now.signed_duration_since(p.last_seen));

            if ok {
                let stale = current == ConnectivityState::Disconnected
                    || silence.is_some_and(|s| s > stale_after);
                if stale {
                    if let Some(closed) = history.close() {
                        events.push(ConnectivityEvent::PhaseClosed(closed));
                    }
                }
                events.push(history.record_success(now).into());
                if current != ConnectivityState::Connected {
                    self.view.set(ConnectivityState::Connected);
                    events.push(ConnectivityEvent::StateChanged {
                        from: current,
                        to: ConnectivityState::Connected,
                    });
                }
            } else {
                let gap = !silence.is_some_and(|s| s <= tolerance);
                match current {
                    ConnectivityState::Unknown => {
                        self.view.set(ConnectivityState::Disconnected);
                        events.push(ConnectivityEvent::StateChanged {
                            from: current,
                            to: ConnectivityState::Disconnected,
                        });
                    }
                    ConnectivityState::Connected if gap => {
                        if let Some(closed) = history.close() {
                            events.push(ConnectivityEvent::PhaseClosed(closed));
                        }
                        self.view.set(ConnectivityState::Disconnected);
                        events.push(ConnectivityEvent::StateChanged {
                            from: current,
                            to: ConnectivityState::Disconnected,
                        });
                    }
                    ConnectivityState::Connected | ConnectivityState::Disconnected => {}
                }
            }

            if !events.is_empty() {
                self.persist(&history);
            }
        }

        for event in &events {
            log_event(event);
            self.events.publish(event);
        }
        Ok(events)
    }

    /// Starts the probe loop. It stops when `shutdown` fires or its sender is
    /// dropped.
    ///
    /// # Errors
    /// Fails if the thread cannot be spawned.
    pub fn spawn(self: &Arc<Self>, shutdown: Receiver<()>) -> SyncResult<JoinHandle<()>> {
        let tracker = Arc::clone(self);
        thread::Builder::new()
            .name("ontosync-connectivity".to_string())
            .spawn(move || {
                let interval = tracker.cfg.probe_interval();
                loop {
                    if let Err(e) = tracker.probe_once() {
                        warn!(error = %e, "connectivity probe could not be recorded");
                    }
                    match shutdown.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("connectivity tracker stopped");
            })
            .map_err(|e| SyncError::internal(format!("failed to spawn connectivity tracker: {e}")))
    }

    fn lock_history(&self) -> SyncResult<MutexGuard<'_, PhaseHistory>> {
        self.history
            .lock()
            .map_err(|_| SyncError::internal("connectivity history lock poisoned"))
    }

    fn persist(&self, history: &PhaseHistory) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.store(history) {
                warn!(
                    error = %e,
                    path = %journal.path().display(),
                    "failed to persist phase history"
                );
            }
        }
    }
}

fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

fn log_event(event: &ConnectivityEvent) {
    match event {
        ConnectivityEvent::StateChanged { from, to } => {
            info!(%from, %to, "connectivity changed");
        }
        ConnectivityEvent::PhaseOpened(p) => {
            info!(phase = %p.phase_id, first_seen = %p.first_seen, "connection phase opened");
        }
        ConnectivityEvent::PhaseClosed(p) => {
            info!(phase = %p.phase_id, last_seen = %p.last_seen, "connection phase closed");
        }
        ConnectivityEvent::PhaseExtended(p) => {
            debug!(phase = %p.phase_id, last_seen = %p.last_seen, "connection phase extended");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn tracker(interval_ms: u64, tolerance_ms: u64) -> ConnectivityTracker {
        let cfg = ConnectivityConfig {
            probe_interval_ms: interval_ms,
            tolerance_ms,
            ..ConnectivityConfig::default()
        };
        ConnectivityTracker::new(cfg, Arc::new(InMemoryStore::new())).unwrap()
    }

    fn run(tracker: &ConnectivityTracker, outcomes: &[bool]) -> Vec<ConnectivityEvent> {
        outcomes
            .iter()
            .enumerate()
            .flat_map(|(i, ok)| tracker.record_probe(*ok, t(i as i64)).unwrap())
            .collect()
    }

    fn count(events: &[ConnectivityEvent], pred: fn(&ConnectivityEvent) -> bool) -> usize {
        events.iter().filter(|e| pred(e)).count()
    }

    #[test]
    fn gap_beyond_tolerance_closes_and_reopens() {
        let tracker = tracker(1_000, 2_000);
        let events = run(&tracker, &[true, true, false, false, false, true]);

        assert_eq!(count(&events, |e| matches!(e, ConnectivityEvent::PhaseClosed(_))), 1);
        assert_eq!(count(&events, |e| matches!(e, ConnectivityEvent::PhaseOpened(_))), 2);

        let phases = tracker.phases();
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].last_seen, t(1));
        assert!(!phases[0].open);
        assert_eq!(phases[1].first_seen, t(5));
        assert_eq!(tracker.state(), ConnectivityState::Connected);
    }

    #[test]
    fn gap_within_tolerance_keeps_one_phase() {
        let tracker = tracker(1_000, 3_000);
        let events = run(&tracker, &[true, true, false, false, false, true]);

        assert_eq!(count(&events, |e| matches!(e, ConnectivityEvent::PhaseClosed(_))), 0);
        let phases = tracker.phases();
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].first_seen, t(0));
        assert_eq!(phases[0].last_seen, t(5));
        assert!(!events.iter().any(|e| matches!(
            e,
            ConnectivityEvent::StateChanged { to: ConnectivityState::Disconnected, .. }
        )));
    }

    #[test]
    fn success_after_suspension_closes_stale_phase() {
        let tracker = tracker(1_000, 3_000);
        tracker.record_probe(true, t(0)).unwrap();
        let events = tracker.record_probe(true, t(10)).unwrap();

        assert!(matches!(
            events[0],
            ConnectivityEvent::PhaseClosed(ref p) if p.last_seen == t(0)
        ));
        assert!(matches!(
            events[1],
            ConnectivityEvent::PhaseOpened(ref p) if p.first_seen == t(10)
        ));
        assert_eq!(tracker.phases().len(), 2);
    }

    #[test]
    fn failed_first_probe_disconnects_without_phase() {
        let tracker = tracker(1_000, 2_000);
        let events = run(&tracker, &[false]);
        assert_eq!(
            events,
            vec![ConnectivityEvent::StateChanged {
                from: ConnectivityState::Unknown,
                to: ConnectivityState::Disconnected,
            }]
        );
        assert!(tracker.phases().is_empty());
    }

    #[test]
    fn subscribers_see_published_events() {
        let tracker = tracker(1_000, 2_000);
        let rx = tracker.subscribe();
        tracker.record_probe(true, t(0)).unwrap();
        let received: Vec<_> = rx.try_iter().collect();
        assert!(matches!(received[0], ConnectivityEvent::PhaseOpened(_)));
        assert!(matches!(
            received[1],
            ConnectivityEvent::StateChanged { to: ConnectivityState::Connected, .. }
        ));
    }

    #[test]
    fn probe_once_uses_store_reachability() {
        let store = Arc::new(InMemoryStore::new());
        let tracker =
            ConnectivityTracker::new(ConnectivityConfig::default(), store.clone()).unwrap();
        tracker.probe_once().unwrap();
        assert!(tracker.view().is_connected());

        store.set_reachable(false);
        tracker.probe_once().unwrap();
        assert!(tracker.view().is_connected(), "one failure is inside the tolerance");
    }
}
