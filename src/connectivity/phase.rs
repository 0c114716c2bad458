//! Connection phases: maximal intervals of continuous store reachability.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseId(Uuid);

impl PhaseId {
    /// Create a new random phase id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for PhaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One interval of continuous reachability.
///
/// While `open`, `last_seen` is the most recent successful probe and keeps
/// moving. Once closed the phase never changes again.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPhase {
    /// Stable id of the phase.
    pub phase_id: PhaseId,
    /// First successful probe of the phase.
    pub first_seen: DateTime<Utc>,
    /// Latest successful probe of the phase.
    pub last_seen: DateTime<Utc>,
    /// Whether the phase is still running.
    pub open: bool,
}

impl ConnectionPhase {
    /// Length of the interval observed so far.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.last_seen - self.first_seen
    }
}

/// Result of recording a successful probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseTransition {
    /// No phase was open; a new one starts at the probe time.
    Opened(ConnectionPhase),
    /// The open phase now extends to the probe time.
    Extended(ConnectionPhase),
}

impl PhaseTransition {
    /// The phase after the transition.
    #[must_use]
    pub const fn phase(&self) -> &ConnectionPhase {
        match self {
            Self::Opened(p) | Self::Extended(p) => p,
        }
    }
}

/// Ordered phase history with at most one open phase (always the last).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseHistory {
    phases: Vec<ConnectionPhase>,
    #[serde(default)]
    retain_closed: Option<usize>,
}

impl PhaseHistory {
    /// An empty history that keeps at most `retain_closed` closed phases.
    #[must_use]
    pub fn with_retention(retain_closed: usize) -> Self {
        Self {
            phases: Vec::new(),
            retain_closed: Some(retain_closed.max(1)),
        }
    }

    /// Changes the retention limit and trims accordingly.
    pub fn set_retention(&mut self, retain_closed: Option<usize>) {
        self.retain_closed = retain_closed.map(|n| n.max(1));
        self.trim();
    }

    /// Opens a phase at `now`, or extends the open one.
    ///
    /// `last_seen` never moves backwards, so a clock step back cannot break
    /// `first_seen <= last_seen`.
    pub fn record_success(&mut self, now: DateTime<Utc>) -> PhaseTransition {
        if let Some(open) = self.phases.last_mut().filter(|p| p.open) {
            if now > open.last_seen {
                open.last_seen = now;
            }
            return PhaseTransition::Extended(open.clone());
        }

        let phase = ConnectionPhase {
            phase_id: PhaseId::new(),
            first_seen: now,
            last_seen: now,
            open: true,
        };
        self.phases.push(phase.clone());
        PhaseTransition::Opened(phase)
    }

    /// Closes the open phase at its last successful refresh.
    ///
    /// Returns `None` when no phase is open.
    pub fn close(&mut self) -> Option<ConnectionPhase> {
        let open = self.phases.last_mut().filter(|p| p.open)?;
        open.open = false;
        let closed = open.clone();
        self.trim();
        Some(closed)
    }

    /// The currently open phase, if any.
    #[must_use]
    pub fn open_phase(&self) -> Option<&ConnectionPhase> {
        self.phases.last().filter(|p| p.open)
    }

    /// All retained phases, oldest first.
    #[must_use]
    pub fn phases(&self) -> &[ConnectionPhase] {
        &self.phases
    }

    /// Closed phases, oldest first.
    pub fn closed(&self) -> impl Iterator<Item = &ConnectionPhase> {
        self.phases.iter().filter(|p| !p.open)
    }

    fn trim(&mut self) {
        let Some(limit) = self.retain_closed else {
            return;
        };
        let closed = self.phases.iter().filter(|p| !p.open).count();
        if closed > limit {
            let excess = closed - limit;
            let mut dropped = 0;
            self.phases.retain(|p| {
                if !p.open && dropped < excess {
                    dropped += 1;
                    false
                } else {
                    true
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn success_opens_then_extends() {
        let mut h = PhaseHistory::default();
        let first = h.record_success(t(0));
        assert!(matches!(first, PhaseTransition::Opened(_)));
        let second = h.record_success(t(5));
        let PhaseTransition::Extended(p) = second else {
            panic!("expected extension");
        };
        assert_eq!(p.first_seen, t(0));
        assert_eq!(p.last_seen, t(5));
        assert_eq!(h.phases().len(), 1);
    }

    #[test]
    fn close_fixes_last_seen_and_next_success_opens_new_phase() {
        let mut h = PhaseHistory::default();
        h.record_success(t(0));
        h.record_success(t(1));
        let closed = h.close().unwrap();
        assert!(!closed.open);
        assert_eq!(closed.last_seen, t(1));
        assert!(h.close().is_none(), "a phase is closed exactly once");

        let reopened = h.record_success(t(10));
        assert!(matches!(reopened, PhaseTransition::Opened(_)));
        assert_ne!(reopened.phase().phase_id, closed.phase_id);
        assert_eq!(h.closed().count(), 1);
        assert_eq!(h.open_phase().unwrap().first_seen, t(10));
    }

    #[test]
    fn last_seen_never_moves_backwards() {
        let mut h = PhaseHistory::default();
        h.record_success(t(10));
        h.record_success(t(3));
        let open = h.open_phase().unwrap();
        assert!(open.first_seen <= open.last_seen);
        assert_eq!(open.last_seen, t(10));
    }

    #[test]
    fn retention_drops_oldest_closed_phases() {
        let mut h = PhaseHistory::with_retention(2);
        for i in 0..4 {
            h.record_success(t(i * 10));
            h.close();
        }
        h.record_success(t(100));
        assert_eq!(h.closed().count(), 2);
        assert_eq!(h.closed().next().unwrap().first_seen, t(20));
        assert!(h.open_phase().is_some());
    }
}
