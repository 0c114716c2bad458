//! Resilient delivery of mutation batches.
//!
//! Batches are queued in arrival order and applied to the store one at a time
//! by a background worker. A batch leaves the queue only when the store
//! accepted it or rejected it permanently; transient failures keep it at the
//! head and back the worker off.

mod delivery;
mod log;
mod queue;
mod retry;

pub use delivery::{BufferStats, DeliveryBuffer, DrainReport};
pub use queue::{PendingEntry, PendingQueue, QueueImage};
pub use retry::RetryPolicy;

use crate::error::SyncResult;
use crate::statement::MutationBatch;

/// Destination for mapped batches.
pub trait BatchSink: Send + Sync {
    /// Hand over a batch for eventual delivery.
    fn submit(&self, batch: MutationBatch) -> SyncResult<()>;
}
