//! State observations reported for live units.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A typed state value as extracted from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ObservationValue {
    /// `xsd:boolean` value.
    Bool(bool),
    /// `xsd:long` value.
    Int(i64),
    /// `xsd:double` value.
    Float(f64),
    /// `xsd:string` value.
    Text(String),
}

impl ObservationValue {
    /// The XSD datatype the value is stored under.
    #[must_use]
    pub const fn datatype(&self) -> &'static str {
        match self {
            Self::Bool(_) => "xsd:boolean",
            Self::Int(_) => "xsd:long",
            Self::Float(_) => "xsd:double",
            Self::Text(_) => "xsd:string",
        }
    }

    /// Lexical form of the value.
    #[must_use]
    pub fn lexical(&self) -> String {
        match self {
            Self::Bool(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => {
                if v.is_nan() {
                    "NaN".to_string()
                } else if v.is_infinite() {
                    if v.is_sign_positive() { "INF" } else { "-INF" }.to_string()
                } else {
                    format!("{v:?}")
                }
            }
            Self::Text(v) => v.clone(),
        }
    }
}

/// A field-level value change of one unit's provider service.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateObservation {
    /// Unit the value was read from.
    pub unit_id: String,
    /// Service type that produced the value.
    pub service: String,
    /// The observed value.
    pub value: ObservationValue,
    /// When the value was observed.
    pub timestamp: DateTime<Utc>,
}

impl StateObservation {
    /// An observation stamped with the current time.
    #[must_use]
    pub fn now(
        unit_id: impl Into<String>,
        service: impl Into<String>,
        value: ObservationValue,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            service: service.into(),
            value,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexical_forms() {
        assert_eq!(ObservationValue::Bool(true).lexical(), "true");
        assert_eq!(ObservationValue::Int(-3).lexical(), "-3");
        assert_eq!(ObservationValue::Float(0.5).lexical(), "0.5");
        assert_eq!(ObservationValue::Float(2.0).lexical(), "2.0");
        assert_eq!(ObservationValue::Float(f64::INFINITY).lexical(), "INF");
        assert_eq!(ObservationValue::Text("on".to_string()).datatype(), "xsd:string");
    }
}
