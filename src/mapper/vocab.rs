//! Ontology vocabulary and IRI minting.

/// Namespace of ontology classes and properties (`ont:` prefix).
pub const ONTOLOGY_NS: &str = "https://ontosync.dev/ontology#";
/// Namespace for XSD datatypes (`xsd:` prefix).
pub const XSD_NS: &str = "http://www.w3.org/2001/XMLSchema#";

const UNIT_NS: &str = "https://ontosync.dev/unit/";
const OBSERVATION_NS: &str = "https://ontosync.dev/observation/";
const PHASE_NS: &str = "https://ontosync.dev/phase/";

/// `rdf:type`, written in its Turtle shorthand.
pub const RDF_TYPE: &str = "a";
/// Human-readable unit name.
pub const HAS_LABEL: &str = "ont:hasLabel";
/// Whether the unit is enabled in the registry.
pub const IS_ENABLED: &str = "ont:isEnabled";
/// Unit to its parent location.
pub const IS_LOCATED_IN: &str = "ont:isLocatedIn";
/// Location to a contained unit.
pub const HAS_CHILD: &str = "ont:hasChild";
/// Connection to a tile it joins.
pub const CONNECTS_TILE: &str = "ont:connectsTile";
/// Tile to a connection touching it.
pub const HAS_CONNECTION: &str = "ont:hasConnection";
/// Unit to a service it provides.
pub const HAS_PROVIDER_SERVICE: &str = "ont:hasProviderService";
/// Unit to a service it consumes.
pub const HAS_CONSUMER_SERVICE: &str = "ont:hasConsumerService";
/// Unit to a service it accepts commands for.
pub const HAS_OPERATION_SERVICE: &str = "ont:hasOperationService";

/// Class of state observations.
pub const OBSERVATION: &str = "ont:Observation";
/// Observation to the observed unit.
pub const HAS_UNIT: &str = "ont:hasUnit";
/// Typed observed value.
pub const HAS_STATE_VALUE: &str = "ont:hasStateValue";
/// When an observation was taken.
pub const HAS_TIMESTAMP: &str = "ont:hasTimeStamp";

/// Class of connection phases.
pub const CONNECTION_PHASE: &str = "ont:ConnectionPhase";
/// First successful probe of a phase.
pub const HAS_FIRST_CONNECTION: &str = "ont:hasFirstConnection";
/// Latest successful probe of a phase.
pub const HAS_LAST_CONNECTION: &str = "ont:hasLastConnection";
/// Whether a phase is still running.
pub const IS_OPEN: &str = "ont:isOpen";

/// Unit type naming a location (owns child units).
pub const LOCATION_TYPE: &str = "Location";
/// Unit type naming a connection between tiles.
pub const CONNECTION_TYPE: &str = "Connection";

/// `PREFIX` header for every request sent to the store.
#[must_use]
pub fn prefixes() -> String {
    format!("PREFIX ont: <{ONTOLOGY_NS}>\nPREFIX xsd: <{XSD_NS}>\n")
}

/// Prefixed name of an ontology class or service.
#[must_use]
pub fn ont(local: &str) -> String {
    format!("ont:{local}")
}

/// IRI term of a registry unit.
#[must_use]
pub fn unit_iri(id: &str) -> String {
    format!("<{UNIT_NS}{id}>")
}

/// IRI term of an observation node.
#[must_use]
pub fn observation_iri(key: &str) -> String {
    format!("<{OBSERVATION_NS}{key}>")
}

/// IRI term of a connection phase node.
#[must_use]
pub fn phase_iri(id: &str) -> String {
    format!("<{PHASE_NS}{id}>")
}

/// True if `id` can be appended to a namespace without escaping.
#[must_use]
pub fn is_iri_safe(id: &str) -> bool {
    !id.is_empty()
        && id.chars().all(|c| {
            !c.is_whitespace()
                && !c.is_control()
                && !matches!(c, '<' | '>' | '"' | '{' | '}' | '|' | '^' | '`' | '\\')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iri_safety() {
        assert!(is_iri_safe("light-1"));
        assert!(is_iri_safe("floor/1/room:2"));
        assert!(!is_iri_safe(""));
        assert!(!is_iri_safe("a b"));
        assert!(!is_iri_safe("a>b"));
    }

    #[test]
    fn unit_iri_is_bracketed() {
        assert_eq!(unit_iri("l1"), "<https://ontosync.dev/unit/l1>");
        assert!(prefixes().contains("PREFIX ont:"));
    }
}
