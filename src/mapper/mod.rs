//! Mapping of registry records, observations and connection phases into
//! mutation batches.
//!
//! Mapping is pure: the same input always yields the same batch. Updates and
//! removals delete by pattern (wildcard object per predicate) so that applying
//! the same batch twice leaves the store in the same state.

pub mod vocab;

use regex::Regex;
use tracing::warn;

use crate::connectivity::ConnectionPhase;
use crate::error::MappingError;
use crate::registry::{
    ChangeSet, RegistrySnapshot, ServicePattern, StateObservation, UnitRecord,
};
use crate::statement::{ChangeCategory, ChangeOrigin, MutationBatch, Statement, Term};

use vocab::{
    CONNECTION_TYPE, CONNECTS_TILE, HAS_CHILD, HAS_CONNECTION, HAS_CONSUMER_SERVICE,
    HAS_LABEL, HAS_OPERATION_SERVICE, HAS_PROVIDER_SERVICE, IS_ENABLED, IS_LOCATED_IN,
    LOCATION_TYPE, RDF_TYPE,
};

/// Predicates a unit owns as subject. Updates and removals clear all of them.
const UNIT_PREDICATES: [&str; 9] = [
    RDF_TYPE,
    HAS_LABEL,
    IS_ENABLED,
    IS_LOCATED_IN,
    HAS_CHILD,
    CONNECTS_TILE,
    HAS_PROVIDER_SERVICE,
    HAS_CONSUMER_SERVICE,
    HAS_OPERATION_SERVICE,
];

/// Predicates pointing at a unit from elsewhere, cleared on removal.
const INBOUND_PREDICATES: [&str; 2] = [HAS_CHILD, HAS_CONNECTION];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitKind {
    Location,
    Connection,
    Device,
}

impl UnitKind {
    fn of(unit_type: &str) -> Self {
        match unit_type {
            LOCATION_TYPE => Self::Location,
            CONNECTION_TYPE => Self::Connection,
            _ => Self::Device,
        }
    }
}

/// Batches produced for one change set plus the aggregated failures.
#[derive(Debug, Clone, Default)]
pub struct MappingOutcome {
    /// Batches in mapping order.
    pub batches: Vec<MutationBatch>,
    /// `MappingError::Aggregate` when at least one record failed.
    pub failure: Option<MappingError>,
}

impl MappingOutcome {
    /// Number of records that failed to map.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failure.as_ref().map_or(0, MappingError::failure_count)
    }
}

/// Maps domain entities into mutation batches.
#[derive(Debug, Clone)]
pub struct Mapper {
    type_name: Regex,
}

impl Default for Mapper {
    fn default() -> Self {
        Self::new()
    }
}

impl Mapper {
    /// A mapper with the unit type naming rules compiled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            type_name: Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("static regex is valid"),
        }
    }

    /// Maps every record of a change set.
    ///
    /// A record that fails to map does not stop the others; all failures are
    /// collected into one `MappingError::Aggregate`. `previous` is the
    /// snapshot the change set was diffed from, used to type removals.
    #[must_use]
    pub fn map_change_set(
        &self,
        changes: &ChangeSet,
        previous: &RegistrySnapshot,
    ) -> MappingOutcome {
        let mut outcome = MappingOutcome::default();
        let mut failures = Vec::new();

        let results = changes
            .added
            .iter()
            .map(|u| self.map_added(u))
            .chain(changes.updated.iter().map(|u| self.map_updated(u)))
            .chain(
                changes
                    .removed
                    .iter()
                    .map(|id| self.map_removed(id, previous.get(id))),
            );

        for result in results {
            match result {
                Ok(batch) => outcome.batches.push(batch),
                Err(err) => failures.push(err),
            }
        }

        if !failures.is_empty() {
            let err = MappingError::Aggregate { failures };
            warn!(
                failed = err.failure_count(),
                mapped = outcome.batches.len(),
                error = %err,
                "change set partially mapped"
            );
            outcome.failure = Some(err);
        }
        outcome
    }

    /// Insert-only batch for a unit that is new to the store.
    ///
    /// # Errors
    /// Fails if the unit id or type cannot be expressed as statements.
    pub fn map_added(&self, unit: &UnitRecord) -> Result<MutationBatch, MappingError> {
        let inserts = self.unit_statements(unit)?;
        MutationBatch::builder(self.unit_origin(unit))
            .insert_all(inserts)
            .build()
            .map_err(|e| invalid(&unit.id, &e))
    }

    /// Full-replace batch for a unit whose record changed.
    ///
    /// # Errors
    /// Fails if the unit id or type cannot be expressed as statements.
    pub fn map_updated(&self, unit: &UnitRecord) -> Result<MutationBatch, MappingError> {
        let inserts = self.unit_statements(unit)?;
        let subject = vocab::unit_iri(&unit.id);

        let mut builder = MutationBatch::builder(self.unit_origin(unit)).delete_all(
            UNIT_PREDICATES
                .iter()
                .map(|p| Statement::any_object(subject.clone(), *p)),
        );
        if UnitKind::of(&unit.unit_type) == UnitKind::Connection {
            builder = builder.delete(Statement::any_subject(HAS_CONNECTION, subject.clone()));
        }

        builder
            .insert_all(inserts)
            .build()
            .map_err(|e| invalid(&unit.id, &e))
    }

    /// Delete-only batch for a unit that left the registry.
    ///
    /// # Errors
    /// `InvalidUnitId` if the id cannot be used as an IRI.
    pub fn map_removed(
        &self,
        unit_id: &str,
        previous: Option<&UnitRecord>,
    ) -> Result<MutationBatch, MappingError> {
        if !vocab::is_iri_safe(unit_id) {
            return Err(MappingError::InvalidUnitId {
                unit_id: unit_id.to_string(),
            });
        }
        let subject = vocab::unit_iri(unit_id);

        let origin = previous.map_or_else(
            || ChangeOrigin::new(ChangeCategory::Unknown),
            |unit| self.unit_origin(unit),
        );

        MutationBatch::builder(origin)
            .delete_all(
                UNIT_PREDICATES
                    .iter()
                    .map(|p| Statement::any_object(subject.clone(), *p)),
            )
            .delete_all(
                INBOUND_PREDICATES
                    .iter()
                    .map(|p| Statement::any_subject(*p, subject.clone())),
            )
            .build()
            .map_err(|e| invalid(unit_id, &e))
    }

    /// Insert-only batch recording one state observation.
    ///
    /// The observation node id is a hash of unit, service and timestamp, so a
    /// redelivered observation lands on the same node.
    pub fn map_observation(
        &self,
        observation: &StateObservation,
        unit_type: Option<&str>,
    ) -> Result<MutationBatch, MappingError> {
        if !vocab::is_iri_safe(&observation.unit_id) {
            return Err(MappingError::InvalidUnitId {
                unit_id: observation.unit_id.clone(),
            });
        }
        if !self.type_name.is_match(&observation.service) {
            return Err(MappingError::UnsupportedServiceType {
                unit_id: observation.unit_id.clone(),
                service_type: observation.service.clone(),
            });
        }

        let key = observation_key(observation);
        let node = vocab::observation_iri(&key);
        let value = &observation.value;

        let mut origin = ChangeOrigin::new(ChangeCategory::Observation)
            .with_service_types([observation.service.clone()]);
        if let Some(t) = unit_type {
            origin = origin.with_unit_type(t);
        }

        MutationBatch::builder(origin)
            .insert(Statement::new(node.clone(), RDF_TYPE, vocab::OBSERVATION))
            .insert(Statement::new(
                node.clone(),
                vocab::HAS_UNIT,
                vocab::unit_iri(&observation.unit_id),
            ))
            .insert(Statement::new(
                node.clone(),
                HAS_PROVIDER_SERVICE,
                vocab::ont(&observation.service),
            ))
            .insert(Statement::new(
                node.clone(),
                vocab::HAS_STATE_VALUE,
                Term::typed(&value.lexical(), value.datatype()),
            ))
            .insert(Statement::new(
                node,
                vocab::HAS_TIMESTAMP,
                Term::date_time(observation.timestamp),
            ))
            .build()
            .map_err(|e| invalid(&observation.unit_id, &e))
    }

    /// Full-replace batch for a connection phase node.
    ///
    /// # Errors
    /// Fails only if the phase node yields no statements.
    pub fn map_phase(&self, phase: &ConnectionPhase) -> Result<MutationBatch, MappingError> {
        let node = vocab::phase_iri(&phase.phase_id.to_string());
        MutationBatch::builder(ChangeOrigin::new(ChangeCategory::Connectivity))
            .delete(Statement::any_object(node.clone(), vocab::HAS_FIRST_CONNECTION))
            .delete(Statement::any_object(node.clone(), vocab::HAS_LAST_CONNECTION))
            .delete(Statement::any_object(node.clone(), vocab::IS_OPEN))
            .insert(Statement::new(node.clone(), RDF_TYPE, vocab::CONNECTION_PHASE))
            .insert(Statement::new(
                node.clone(),
                vocab::HAS_FIRST_CONNECTION,
                Term::date_time(phase.first_seen),
            ))
            .insert(Statement::new(
                node.clone(),
                vocab::HAS_LAST_CONNECTION,
                Term::date_time(phase.last_seen),
            ))
            .insert(Statement::new(node, vocab::IS_OPEN, Term::boolean(phase.open)))
            .build()
            .map_err(|e| invalid(&phase.phase_id.to_string(), &e))
    }

    fn unit_origin(&self, unit: &UnitRecord) -> ChangeOrigin {
        ChangeOrigin::new(ChangeCategory::Unknown)
            .with_unit_type(unit.unit_type.clone())
            .with_service_types(
                unit.service_descriptors
                    .iter()
                    .map(|d| d.service_type.clone()),
            )
    }

    fn unit_statements(&self, unit: &UnitRecord) -> Result<Vec<Statement>, MappingError> {
        if !vocab::is_iri_safe(&unit.id) {
            return Err(MappingError::InvalidUnitId {
                unit_id: unit.id.clone(),
            });
        }
        if !self.type_name.is_match(&unit.unit_type) {
            return Err(MappingError::UnsupportedUnitType {
                unit_id: unit.id.clone(),
                unit_type: unit.unit_type.clone(),
            });
        }

        let subject = vocab::unit_iri(&unit.id);
        let mut out = vec![
            Statement::new(subject.clone(), RDF_TYPE, vocab::ont(&unit.unit_type)),
            Statement::new(subject.clone(), HAS_LABEL, Term::literal(&unit.label)),
            Statement::new(subject.clone(), IS_ENABLED, Term::boolean(unit.enabled)),
        ];

        if let Some(parent) = &unit.parent_location_id {
            out.push(Statement::new(
                subject.clone(),
                IS_LOCATED_IN,
                related_iri(&unit.id, parent)?,
            ));
        }

        match UnitKind::of(&unit.unit_type) {
            UnitKind::Location => {
                for child in &unit.child_ids {
                    out.push(Statement::new(
                        subject.clone(),
                        HAS_CHILD,
                        related_iri(&unit.id, child)?,
                    ));
                }
            }
            UnitKind::Connection => {
                for tile in &unit.tile_ids {
                    let tile_iri = related_iri(&unit.id, tile)?;
                    out.push(Statement::new(subject.clone(), CONNECTS_TILE, tile_iri.clone()));
                    out.push(Statement::new(tile_iri, HAS_CONNECTION, subject.clone()));
                }
            }
            UnitKind::Device => {}
        }

        for descriptor in &unit.service_descriptors {
            if !self.type_name.is_match(&descriptor.service_type) {
                return Err(MappingError::UnsupportedServiceType {
                    unit_id: unit.id.clone(),
                    service_type: descriptor.service_type.clone(),
                });
            }
            let predicate = match descriptor.pattern {
                ServicePattern::Provider => HAS_PROVIDER_SERVICE,
                ServicePattern::Consumer => HAS_CONSUMER_SERVICE,
                ServicePattern::Operation => HAS_OPERATION_SERVICE,
            };
            let st =
                Statement::new(subject.clone(), predicate, vocab::ont(&descriptor.service_type));
            if !out.contains(&st) {
                out.push(st);
            }
        }

        Ok(out)
    }
}

fn related_iri(unit_id: &str, other: &str) -> Result<String, MappingError> {
    if vocab::is_iri_safe(other) {
        Ok(vocab::unit_iri(other))
    } else {
        Err(MappingError::InvalidRecord {
            unit_id: unit_id.to_string(),
            reason: format!("related unit id '{other}' cannot be used as an IRI"),
        })
    }
}

fn invalid(unit_id: &str, err: &crate::error::ValidationError) -> MappingError {
    MappingError::InvalidRecord {
        unit_id: unit_id.to_string(),
        reason: err.to_string(),
    }
}

fn observation_key(observation: &StateObservation) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(observation.unit_id.as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(observation.service.as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(
        observation
            .timestamp
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_le_bytes()
            .as_slice(),
    );
    let hex = hasher.finalize().to_hex();
    hex.as_str()[..32].to_string()
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::connectivity::PhaseHistory;
    use crate::registry::{diff, ObservationValue, ServiceDescriptor};

    fn lamp() -> UnitRecord {
        UnitRecord::new("l1", "Light", "Desk lamp")
            .in_location("kitchen")
            .with_service(ServiceDescriptor::provider("PowerState"))
            .with_service(ServiceDescriptor {
                service_type: "PowerState".to_string(),
                pattern: ServicePattern::Operation,
            })
    }

    fn subject_of(batch: &MutationBatch) -> String {
        batch.insert_set()[0].subject.clone().unwrap()
    }

    #[test]
    fn added_unit_has_type_label_and_enabled_flag() {
        let batch = Mapper::new().map_added(&lamp()).unwrap();
        assert!(batch.is_insert_only());
        let s = subject_of(&batch);
        let inserts = batch.insert_set();
        assert!(inserts.contains(&Statement::new(s.clone(), RDF_TYPE, "ont:Light")));
        assert!(inserts.contains(&Statement::new(s.clone(), HAS_LABEL, "\"Desk lamp\"")));
        assert!(inserts.contains(&Statement::new(s.clone(), IS_ENABLED, Term::boolean(true))));
        assert!(inserts.contains(&Statement::new(
            s.clone(),
            IS_LOCATED_IN,
            vocab::unit_iri("kitchen")
        )));
        assert!(inserts.contains(&Statement::new(
            s.clone(),
            HAS_OPERATION_SERVICE,
            "ont:PowerState"
        )));

        let origin = batch.origin();
        assert_eq!(origin.category, ChangeCategory::Unknown);
        assert!(origin.unit_types.contains("Light"));
        assert!(origin.service_types.contains("PowerState"));
    }

    #[test]
    fn location_and_connection_add_relations() {
        let mapper = Mapper::new();
        let location = UnitRecord::new("kitchen", LOCATION_TYPE, "Kitchen")
            .with_child("l1")
            .with_child("l2");
        let batch = mapper.map_added(&location).unwrap();
        let children: Vec<_> = batch
            .insert_set()
            .iter()
            .filter(|s| s.predicate == HAS_CHILD)
            .collect();
        assert_eq!(children.len(), 2);

        let door = UnitRecord::new("door", CONNECTION_TYPE, "Door")
            .with_tile("kitchen")
            .with_tile("hall");
        let batch = mapper.map_added(&door).unwrap();
        let door_iri = vocab::unit_iri("door");
        assert!(batch.insert_set().contains(&Statement::new(
            door_iri.clone(),
            CONNECTS_TILE,
            vocab::unit_iri("hall")
        )));
        assert!(batch.insert_set().contains(&Statement::new(
            vocab::unit_iri("hall"),
            HAS_CONNECTION,
            door_iri
        )));
    }

    #[test]
    fn updated_unit_deletes_every_owned_predicate_by_wildcard() {
        let batch = Mapper::new().map_updated(&lamp()).unwrap();
        let s = vocab::unit_iri("l1");
        for p in UNIT_PREDICATES {
            assert!(batch.delete_set().contains(&Statement::any_object(s.clone(), p)), "{p}");
        }
        assert!(batch.delete_set().iter().all(|st| st.object.is_none()));
        assert!(batch.implicit_where().is_some());
    }

    #[test]
    fn removed_unit_is_delete_only_with_inbound_patterns() {
        let batch = Mapper::new().map_removed("l1", Some(&lamp())).unwrap();
        assert!(batch.insert_set().is_empty());
        let s = vocab::unit_iri("l1");
        assert!(batch.delete_set().contains(&Statement::any_subject(HAS_CHILD, s.clone())));
        assert!(batch.delete_set().contains(&Statement::any_object(s, HAS_LABEL)));
        assert!(batch.origin().unit_types.contains("Light"));

        let untyped = Mapper::new().map_removed("ghost", None).unwrap();
        assert!(untyped.origin().unit_types.is_empty());
    }

    #[test]
    fn change_set_failures_are_aggregated_not_fatal() {
        let old = RegistrySnapshot::from_units([UnitRecord::new("gone", "Light", "x")]).unwrap();
        let new = RegistrySnapshot::from_units([
            UnitRecord::new("ok", "Light", "fine"),
            UnitRecord::new("bad-type", "", "no type"),
            UnitRecord::new("bad id", "Light", "space in id"),
        ])
        .unwrap();
        let changes = diff(&old, &new);
        let outcome = Mapper::new().map_change_set(&changes, &old);

        // "ok" added plus "gone" removed.
        assert_eq!(outcome.batches.len(), 2);
        assert_eq!(outcome.failed(), 2);
        let Some(MappingError::Aggregate { failures }) = outcome.failure else {
            panic!("expected aggregate failure");
        };
        assert!(failures.iter().any(|f| matches!(
            f,
            MappingError::UnsupportedUnitType { unit_id, .. } if unit_id == "bad-type"
        )));
        assert!(failures
            .iter()
            .any(|f| matches!(f, MappingError::InvalidUnitId { unit_id } if unit_id == "bad id")));
    }

    #[test]
    fn mapping_is_deterministic() {
        let mapper = Mapper::new();
        assert_eq!(mapper.map_updated(&lamp()).unwrap(), mapper.map_updated(&lamp()).unwrap());
    }

    #[test]
    fn observation_is_insert_only_with_stable_node() {
        let mapper = Mapper::new();
        let obs = StateObservation {
            unit_id: "l1".to_string(),
            service: "PowerState".to_string(),
            value: ObservationValue::Text("ON".to_string()),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let a = mapper.map_observation(&obs, Some("Light")).unwrap();
        let b = mapper.map_observation(&obs, Some("Light")).unwrap();
        assert!(a.is_insert_only());
        assert_eq!(a, b);
        assert_eq!(a.origin().category, ChangeCategory::Observation);
        assert!(a.origin().service_types.contains("PowerState"));
        assert!(a
            .insert_set()
            .iter()
            .any(|s| s.predicate == vocab::HAS_STATE_VALUE
                && s.object.as_deref() == Some("\"ON\"^^xsd:string")));

        let bad = StateObservation {
            service: "power state".to_string(),
            ..obs
        };
        assert!(matches!(
            mapper.map_observation(&bad, None),
            Err(MappingError::UnsupportedServiceType { .. })
        ));
    }

    #[test]
    fn phase_batch_replaces_last_connection() {
        let mut history = PhaseHistory::default();
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let phase = history.record_success(now).phase().clone();
        let batch = Mapper::new().map_phase(&phase).unwrap();
        assert_eq!(batch.origin().category, ChangeCategory::Connectivity);
        assert_eq!(batch.delete_set().len(), 3);
        assert!(batch
            .insert_set()
            .iter()
            .any(|s| s.predicate == vocab::IS_OPEN
                && s.object.as_deref() == Some("\"true\"^^xsd:boolean")));
    }
}
