//! Registered boolean queries re-evaluated on delivered changes.

mod engine;
mod set;
mod stream;
mod types;

pub use engine::TriggerEngine;
pub use stream::ActivationStream;
pub use types::{
    ActivationChange, ActivationState, Interest, SubscriptionId, TriggerHandle, TriggerId,
    TriggerRegistration,
};
