//! Error types for ontosync.
//!
//! Errors are strongly typed using thiserror and split along the lines the
//! pipeline cares about: invariant violations rejected at the call boundary,
//! per-record mapping failures, store transport failures (transient or
//! permanent), and runtime execution failures.

use thiserror::Error;

/// Invariant violations rejected synchronously at a public boundary.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Required field '{field}' is empty")]
    EmptyField { field: String },

    #[error("Predicate cannot be empty")]
    EmptyPredicate,

    #[error("Insert statement for predicate '{predicate}' contains a wildcard")]
    WildcardInInsert { predicate: String },

    #[error(
        "Delete pattern for predicate '{predicate}' has a wildcard but the batch sets an explicit \
         where clause; name the variable instead"
    )]
    WildcardWithWhereClause { predicate: String },

    #[error("Mutation batch has neither deletions nor insertions")]
    EmptyBatch,

    #[error("Duplicate unit id in snapshot: {id}")]
    DuplicateUnitId { id: String },

    #[error("Trigger label '{label}' is already registered")]
    DuplicateTriggerLabel { label: String },

    #[error("Trigger label '{label}' is not registered")]
    UnknownTrigger { label: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

/// Failures turning a registry record or observation into statements.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("Unit '{unit_id}' has unsupported type '{unit_type}'")]
    UnsupportedUnitType { unit_id: String, unit_type: String },

    #[error("Unit id '{unit_id}' cannot be used as an IRI")]
    InvalidUnitId { unit_id: String },

    #[error("Unit '{unit_id}' has unsupported service type '{service_type}'")]
    UnsupportedServiceType { unit_id: String, service_type: String },

    #[error("Unit '{unit_id}': {reason}")]
    InvalidRecord { unit_id: String, reason: String },

    /// All failures collected while mapping one change set.
    #[error("{} record(s) failed to map", failures.len())]
    Aggregate { failures: Vec<MappingError> },
}

impl MappingError {
    /// Number of individual record failures represented by this error.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        match self {
            Self::Aggregate { failures } => failures.iter().map(Self::failure_count).sum(),
            _ => 1,
        }
    }
}

/// Transport errors talking to the remote store.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Request timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The store refused the request (4xx).
    #[error("Store rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The store failed to process the request (5xx).
    #[error("Store error (status {status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Invalid store response: {message}")]
    InvalidResponse { message: String },
}

impl TransportError {
    /// Classify an HTTP status code that is not a success.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (400..500).contains(&status) {
            Self::Rejected { status, message }
        } else {
            Self::ServerError { status, message }
        }
    }

    /// Returns true if retrying the same request may succeed later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::Timeout { .. } | Self::ServerError { .. }
        )
    }

    /// Returns true if the store will never accept this request.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }
}

/// Execution errors raised by the running subsystems.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("Channel disconnected: {path}")]
    Disconnected { path: String },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Component '{component}' is shutting down")]
    ShuttingDown { component: String },

    #[error("Journal error: {message}")]
    Journal { message: String },

    #[error("Registry source error: {message}")]
    Registry { message: String },
}

/// Top-level error type for ontosync.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SyncError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for a disconnected channel error.
    #[must_use]
    pub fn disconnected(path: &str) -> Self {
        Self::Execution(ExecutionError::Disconnected {
            path: path.to_string(),
        })
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a mapping error.
    #[must_use]
    pub const fn is_mapping(&self) -> bool {
        matches!(self, Self::Mapping(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::Execution(e) => matches!(e, ExecutionError::Timeout { .. }),
            Self::Validation(_) | Self::Mapping(_) | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for ontosync operations.
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_follows_response_class() {
        assert!(matches!(
            TransportError::from_status(400, "bad"),
            TransportError::Rejected { status: 400, .. }
        ));
        assert!(matches!(
            TransportError::from_status(404, "missing"),
            TransportError::Rejected { .. }
        ));
        assert!(matches!(
            TransportError::from_status(503, "down"),
            TransportError::ServerError { status: 503, .. }
        ));
    }

    #[test]
    fn transient_and_permanent_are_complementary() {
        let transient = [
            TransportError::ConnectionFailed {
                message: "refused".to_string(),
            },
            TransportError::Timeout { duration_ms: 10 },
            TransportError::from_status(502, "gateway"),
        ];
        for err in transient {
            assert!(err.is_retryable(), "{err}");
            assert!(!err.is_permanent(), "{err}");
        }

        let permanent = [
            TransportError::from_status(400, "parse error"),
            TransportError::InvalidResponse {
                message: "not json".to_string(),
            },
        ];
        for err in permanent {
            assert!(err.is_permanent(), "{err}");
        }
    }

    #[test]
    fn aggregate_mapping_error_counts_nested_failures() {
        let err = MappingError::Aggregate {
            failures: vec![
                MappingError::UnsupportedUnitType {
                    unit_id: "a".to_string(),
                    unit_type: "".to_string(),
                },
                MappingError::InvalidUnitId {
                    unit_id: "b c".to_string(),
                },
            ],
        };
        assert_eq!(err.failure_count(), 2);
        assert!(err.to_string().contains("2 record(s)"));
    }

    #[test]
    fn sync_error_conversions() {
        let err: SyncError = ValidationError::DuplicateTriggerLabel {
            label: "t".to_string(),
        }
        .into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());

        let err: SyncError = TransportError::Timeout { duration_ms: 5 }.into();
        assert!(err.is_transport());
        assert!(err.is_retryable());

        let err = SyncError::disconnected("trigger_control");
        assert!(err.to_string().contains("trigger_control"));
    }
}
