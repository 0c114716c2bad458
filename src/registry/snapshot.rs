//! Registry snapshots and snapshot diffing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// How a unit relates to a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServicePattern {
    /// The unit reports state for the service.
    #[default]
    Provider,
    /// The unit consumes the service.
    Consumer,
    /// The unit accepts commands for the service.
    Operation,
}

/// A service offered or used by a unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Service type name, such as `Switch`.
    pub service_type: String,
    /// How the unit relates to the service.
    #[serde(default)]
    pub pattern: ServicePattern,
}

impl ServiceDescriptor {
    /// A provider descriptor for `service_type`.
    #[must_use]
    pub fn provider(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            pattern: ServicePattern::Provider,
        }
    }
}

/// One unit as the registry currently describes it.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub id: String,
    pub unit_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_location_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_descriptors: Vec<ServiceDescriptor>,
    /// Tiles joined by a connection unit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tile_ids: Vec<String>,
}

const fn default_enabled() -> bool {
    true
}

impl UnitRecord {
    /// A minimal enabled record.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        unit_type: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            unit_type: unit_type.into(),
            enabled: true,
            label: label.into(),
            parent_location_id: None,
            child_ids: Vec::new(),
            service_descriptors: Vec::new(),
            tile_ids: Vec::new(),
        }
    }

    /// Sets the parent location.
    #[must_use]
    pub fn in_location(mut self, location_id: impl Into<String>) -> Self {
        self.parent_location_id = Some(location_id.into());
        self
    }

    /// Adds a child unit.
    #[must_use]
    pub fn with_child(mut self, child_id: impl Into<String>) -> Self {
        self.child_ids.push(child_id.into());
        self
    }

    /// Adds a service descriptor.
    #[must_use]
    pub fn with_service(mut self, descriptor: ServiceDescriptor) -> Self {
        self.service_descriptors.push(descriptor);
        self
    }

    /// Adds a connected tile.
    #[must_use]
    pub fn with_tile(mut self, tile_id: impl Into<String>) -> Self {
        self.tile_ids.push(tile_id.into());
        self
    }

    /// Sets the enabled flag.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// An immutable view of the whole registry at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SnapshotDocument", into = "SnapshotDocument")]
pub struct RegistrySnapshot {
    units: BTreeMap<String, UnitRecord>,
    taken_at: DateTime<Utc>,
}

/// Wire form of a snapshot: a plain list of units.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotDocument {
    units: Vec<UnitRecord>,
    #[serde(default = "Utc::now")]
    taken_at: DateTime<Utc>,
}

impl TryFrom<SnapshotDocument> for RegistrySnapshot {
    type Error = ValidationError;

    fn try_from(doc: SnapshotDocument) -> Result<Self, Self::Error> {
        let mut snapshot = Self::from_units(doc.units)?;
        snapshot.taken_at = doc.taken_at;
        Ok(snapshot)
    }
}

impl From<RegistrySnapshot> for SnapshotDocument {
    fn from(snapshot: RegistrySnapshot) -> Self {
        Self {
            units: snapshot.units.into_values().collect(),
            taken_at: snapshot.taken_at,
        }
    }
}

impl RegistrySnapshot {
    /// An empty snapshot.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            units: BTreeMap::new(),
            taken_at: Utc::now(),
        }
    }

    /// Builds a snapshot from a list of records.
    ///
    /// # Errors
    /// - `EmptyField` if a record has an empty id
    /// - `DuplicateUnitId` if two records share an id
    pub fn from_units(
        units: impl IntoIterator<Item = UnitRecord>,
    ) -> Result<Self, ValidationError> {
        let mut map = BTreeMap::new();
        for unit in units {
            if unit.id.trim().is_empty() {
                return Err(ValidationError::EmptyField {
                    field: "unit.id".to_string(),
                });
            }
            if map.contains_key(&unit.id) {
                return Err(ValidationError::DuplicateUnitId { id: unit.id });
            }
            map.insert(unit.id.clone(), unit);
        }
        Ok(Self {
            units: map,
            taken_at: Utc::now(),
        })
    }

    /// The record for unit `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&UnitRecord> {
        self.units.get(id)
    }

    /// Units in id order.
    pub fn units(&self) -> impl Iterator<Item = &UnitRecord> {
        self.units.values()
    }

    /// Number of units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the snapshot holds no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// When the snapshot was taken.
    #[must_use]
    pub const fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

/// Classified differences between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Units present only in the newer snapshot.
    pub added: Vec<UnitRecord>,
    /// Units present in both snapshots with a different record.
    pub updated: Vec<UnitRecord>,
    /// Ids of units no longer present.
    pub removed: Vec<String>,
}

impl ChangeSet {
    /// Every unit of `snapshot` as an addition.
    #[must_use]
    pub fn baseline(snapshot: &RegistrySnapshot) -> Self {
        Self {
            added: snapshot.units().cloned().collect(),
            updated: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Number of classified units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }
}

/// Diffs two snapshots keyed by unit id.
///
/// A unit present in both with any differing field is reported as updated in
/// full.
#[must_use]
pub fn diff(old: &RegistrySnapshot, new: &RegistrySnapshot) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for (id, record) in &new.units {
        match old.units.get(id) {
            None => changes.added.push(record.clone()),
            Some(previous) if previous != record => changes.updated.push(record.clone()),
            Some(_) => {}
        }
    }

    changes.removed = old
        .units
        .keys()
        .filter(|id| !new.units.contains_key(*id))
        .cloned()
        .collect();

    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light(id: &str, label: &str) -> UnitRecord {
        UnitRecord::new(id, "Light", label).with_service(ServiceDescriptor::provider("PowerState"))
    }

    #[test]
    fn diff_classifies_added_updated_removed() {
        let old =
            RegistrySnapshot::from_units([light("a", "A"), light("b", "B"), light("c", "C")])
                .unwrap();
        let new = RegistrySnapshot::from_units([
            light("a", "A"),
            light("b", "B renamed"),
            light("d", "D"),
        ])
        .unwrap();

        let changes = diff(&old, &new);
        assert_eq!(changes.added.iter().map(|u| u.id.as_str()).collect::<Vec<_>>(), ["d"]);
        assert_eq!(changes.updated.iter().map(|u| u.id.as_str()).collect::<Vec<_>>(), ["b"]);
        assert_eq!(changes.removed, ["c"]);
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn any_field_change_marks_whole_record_updated() {
        let old = RegistrySnapshot::from_units([light("a", "A")]).unwrap();
        let new = RegistrySnapshot::from_units([light("a", "A").enabled(false)]).unwrap();
        let changes = diff(&old, &new);
        assert_eq!(changes.updated.len(), 1);
        assert!(!changes.updated[0].enabled);
    }

    #[test]
    fn identical_snapshots_have_no_changes() {
        let a = RegistrySnapshot::from_units([light("a", "A")]).unwrap();
        let b = RegistrySnapshot::from_units([light("a", "A")]).unwrap();
        assert!(diff(&a, &b).is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = RegistrySnapshot::from_units([light("a", "A"), light("a", "A2")]).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateUnitId { id: "a".to_string() });
    }

    #[test]
    fn snapshot_deserializes_from_unit_list() {
        let json = r#"{
            "units": [
                {"id": "loc", "unit_type": "Location", "label": "Home", "child_ids": ["l1"]},
                {"id": "l1", "unit_type": "Light", "label": "Lamp", "parent_location_id": "loc",
                 "service_descriptors": [{"service_type": "PowerState"}]}
            ]
        }"#;
        let snapshot: RegistrySnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.len(), 2);
        let lamp = snapshot.get("l1").unwrap();
        assert!(lamp.enabled);
        assert_eq!(lamp.service_descriptors[0].pattern, ServicePattern::Provider);

        let bad = r#"{"units": [{"id": "x", "unit_type": "A"}, {"id": "x", "unit_type": "B"}]}"#;
        assert!(serde_json::from_str::<RegistrySnapshot>(bad).is_err());
    }
}
