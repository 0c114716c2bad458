//! Remote store transport.
//!
//! The store is an opaque request/response service. Responses are classified
//! the same way everywhere: success, permanent rejection (4xx), or transient
//! failure (5xx, connection errors, timeouts). See
//! [`TransportError::is_retryable`].

#[cfg(feature = "transport-http")]
mod http;
mod memory;
pub mod sparql;

use std::collections::BTreeMap;

use crate::error::TransportError;
use crate::statement::MutationBatch;

#[cfg(feature = "transport-http")]
pub use http::HttpStore;
pub use memory::InMemoryStore;

/// One solution of a select query: variable name to lexical value.
pub type Row = BTreeMap<String, String>;

/// Query used to check reachability when none is configured.
pub const DEFAULT_PROBE_QUERY: &str = "ASK { ?s ?p ?o }";

/// Client contract for the remote triple store.
///
/// Implementations must be safe to call from several worker threads.
pub trait StoreClient: Send + Sync {
    /// Apply a mutation batch atomically.
    fn update(&self, batch: &MutationBatch) -> Result<(), TransportError>;

    /// Evaluate a boolean query.
    fn ask(&self, query: &str) -> Result<bool, TransportError>;

    /// Evaluate a select query.
    fn select(&self, query: &str) -> Result<Vec<Row>, TransportError>;

    /// Check that the store answers at all.
    fn probe(&self) -> Result<(), TransportError> {
        self.ask(DEFAULT_PROBE_QUERY).map(|_| ())
    }
}
