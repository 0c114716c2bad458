//! Store reachability tracking.
//!
//! The tracker probes the store at a fixed interval and keeps a history of
//! connection phases: maximal periods during which probes kept succeeding with
//! no silence longer than the configured tolerance. Other subsystems read the
//! current state through a lock-free [`ConnectivityView`].

mod phase;
mod tracker;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use phase::{ConnectionPhase, PhaseHistory, PhaseId, PhaseTransition};
pub use tracker::ConnectivityTracker;

/// Published link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectivityState {
    /// No probe has completed yet.
    Unknown = 0,
    /// At least one probe succeeded within the tolerance.
    Connected = 1,
    /// The store has been unreachable for longer than the tolerance.
    Disconnected = 2,
}

impl ConnectivityState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connected,
            2 => Self::Disconnected,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Shared read handle on the tracker's state.
#[derive(Debug, Clone)]
pub struct ConnectivityView(Arc<AtomicU8>);

impl Default for ConnectivityView {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectivityState::Unknown as u8)))
    }
}

impl ConnectivityView {
    /// A view starting in [`ConnectivityState::Unknown`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Whether the store is currently reachable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectivityState::Connected
    }

    /// Stores `state` and returns the previous one.
    pub(crate) fn set(&self, state: ConnectivityState) -> ConnectivityState {
        ConnectivityState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }
}

/// Events published by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// The tracker moved between states.
    StateChanged {
        /// State before the probe.
        from: ConnectivityState,
        /// State after the probe.
        to: ConnectivityState,
    },
    /// A new phase began with a successful probe.
    PhaseOpened(ConnectionPhase),
    /// A successful probe refreshed the open phase.
    PhaseExtended(ConnectionPhase),
    /// The open phase ended.
    PhaseClosed(ConnectionPhase),
}

impl ConnectivityEvent {
    /// The phase carried by a phase event.
    #[must_use]
    pub const fn phase(&self) -> Option<&ConnectionPhase> {
        match self {
            Self::PhaseOpened(p) | Self::PhaseExtended(p) | Self::PhaseClosed(p) => Some(p),
            Self::StateChanged { .. } => None,
        }
    }
}

impl From<PhaseTransition> for ConnectivityEvent {
    fn from(transition: PhaseTransition) -> Self {
        match transition {
            PhaseTransition::Opened(p) => Self::PhaseOpened(p),
            PhaseTransition::Extended(p) => Self::PhaseExtended(p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_clones_share_state() {
        let view = ConnectivityView::new();
        let reader = view.clone();
        assert_eq!(reader.state(), ConnectivityState::Unknown);
        assert_eq!(view.set(ConnectivityState::Connected), ConnectivityState::Unknown);
        assert!(reader.is_connected());
    }
}
