//! # ontosync - registry to knowledge-base synchronization
//!
//! ontosync keeps a remote semantic triple store consistent with the live state
//! of a device/unit registry and lets consumers react to delivered changes
//! without polling the store.
//!
//! ## Pipeline
//!
//! - **Change detection**: successive registry snapshots are diffed by unit id
//!   and mapped into [`MutationBatch`]es.
//! - **Delivery**: batches are queued in order and applied by a background
//!   worker with retry and backoff. Transient store failures never drop a
//!   batch; permanent rejections are logged and skipped.
//! - **Connectivity**: a probe loop records connection phases with gap
//!   tolerance and pauses delivery while the store is unreachable.
//! - **Triggers**: registered boolean queries are re-evaluated when a
//!   relevant change is confirmed delivered, and activation edges are
//!   streamed to observers.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ontosync::{ChannelRegistrySource, InMemoryStore, Interest, SyncConfig, SyncService};
//!
//! let store = Arc::new(InMemoryStore::new());
//! let registry = Arc::new(ChannelRegistrySource::new());
//! let service = SyncService::start(SyncConfig::default(), store, registry, None)?;
//!
//! service.triggers().register(
//!     "living-room-lit",
//!     "ASK { ?l a ont:Light ; ont:isLocatedIn <https://ontosync.dev/unit/living> }",
//!     Interest::new().unit_type("Light"),
//! )?;
//! let activations = service.triggers().subscribe()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod bus;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod journal;
pub mod mapper;
pub mod registry;
pub mod service;
pub mod statement;
pub mod store;
pub mod trigger;

pub use buffer::{BatchSink, BufferStats, DeliveryBuffer, DrainReport, PendingEntry, RetryPolicy};
pub use config::{
    BufferConfig, ConnectivityConfig, DetectorConfig, StoreConfig, SyncConfig, TriggerConfig,
};
pub use connectivity::{
    ConnectionPhase, ConnectivityEvent, ConnectivityState, ConnectivityTracker, ConnectivityView,
    PhaseId,
};
pub use error::{
    ExecutionError, MappingError, SyncError, SyncResult, TransportError, ValidationError,
};
pub use mapper::{Mapper, MappingOutcome};
pub use registry::{
    diff, ChangeDetector, ChangeSet, ChannelRegistrySource, FileRegistrySource, ObservationValue,
    RegistrySnapshot, RegistrySource, ServiceDescriptor, ServicePattern, StateObservation,
    UnitRecord,
};
pub use service::{ShutdownReport, SyncService};
pub use statement::{
    ChangeCategory, ChangeNotification, ChangeOrigin, MutationBatch, Statement, Term,
};
#[cfg(feature = "transport-http")]
pub use store::HttpStore;
pub use store::{InMemoryStore, Row, StoreClient};
pub use trigger::{
    ActivationChange, ActivationState, ActivationStream, Interest, TriggerEngine, TriggerHandle,
    TriggerId, TriggerRegistration,
};
