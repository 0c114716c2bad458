//! Registry side of the pipeline: snapshots, observations, sources and the
//! change detector.

mod detector;
mod observation;
mod snapshot;
mod source;

pub use detector::{ChangeDetector, DetectorState, SnapshotOutcome};
pub use observation::{ObservationValue, StateObservation};
pub use snapshot::{
    diff, ChangeSet, RegistrySnapshot, ServiceDescriptor, ServicePattern, UnitRecord,
};
pub use source::{ChannelRegistrySource, FileRegistrySource, RegistrySource};
