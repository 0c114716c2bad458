//! Trigger registrations, interests and activation edges.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::statement::{ChangeCategory, ChangeNotification};

/// Unique identifier for a registered trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(Uuid);

impl TriggerId {
    /// A fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TriggerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for an activation stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// A fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Which change notifications re-evaluate a trigger.
///
/// A notification matches if it shares at least one category, unit type or
/// service type with the interest. An empty interest matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interest {
    /// Change categories of interest.
    #[serde(default)]
    pub categories: BTreeSet<ChangeCategory>,
    /// Unit types of interest.
    #[serde(default)]
    pub unit_types: BTreeSet<String>,
    /// Service types of interest.
    #[serde(default)]
    pub service_types: BTreeSet<String>,
}

impl Interest {
    /// An interest matching nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a change category.
    #[must_use]
    pub fn category(mut self, category: ChangeCategory) -> Self {
        self.categories.insert(category);
        self
    }

    /// Adds a unit type.
    #[must_use]
    pub fn unit_type(mut self, unit_type: impl Into<String>) -> Self {
        self.unit_types.insert(unit_type.into());
        self
    }

    /// Adds a service type.
    #[must_use]
    pub fn service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_types.insert(service_type.into());
        self
    }

    /// Whether no category, unit type or service type is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.unit_types.is_empty() && self.service_types.is_empty()
    }

    /// Whether `notification` touches anything this interest names.
    #[must_use]
    pub fn matches(&self, notification: &ChangeNotification) -> bool {
        self.categories.contains(&notification.category)
            || !self.unit_types.is_disjoint(&notification.unit_types)
            || !self.service_types.is_disjoint(&notification.service_types)
    }
}

/// Last known result of a trigger's query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    /// Not evaluated since registration or since the store was last reachable.
    #[default]
    Unknown,
    /// The last evaluation returned true.
    Active,
    /// The last evaluation returned false.
    Deactive,
}

impl ActivationState {
    /// State after an evaluation returning `result`.
    #[must_use]
    pub const fn after(result: bool) -> Self {
        if result {
            Self::Active
        } else {
            Self::Deactive
        }
    }
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Active => "active",
            Self::Deactive => "deactive",
        };
        f.write_str(s)
    }
}

/// A registered trigger and its current activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRegistration {
    /// Trigger id.
    pub id: TriggerId,
    /// Unique label.
    pub label: String,
    /// Boolean query evaluated against the store.
    pub query: String,
    /// Changes that cause re-evaluation.
    pub interest: Interest,
    /// Current activation state.
    pub state: ActivationState,
    /// When the trigger was registered.
    pub registered_at: DateTime<Utc>,
}

/// Returned by a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerHandle {
    /// Trigger id.
    pub id: TriggerId,
    /// Unique label.
    pub label: String,
}

/// An activation edge of one trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationChange {
    /// Trigger that changed.
    pub trigger_id: TriggerId,
    /// Its label.
    pub label: String,
    /// State before the evaluation.
    pub previous: ActivationState,
    /// State after the evaluation.
    pub current: ActivationState,
    /// When the change was observed.
    pub at: DateTime<Utc>,
}
