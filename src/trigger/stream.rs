use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::{ExecutionError, SyncError, SyncResult};

use super::engine::ControlMsg;
use super::types::{ActivationChange, SubscriptionId};

/// A stream of activation changes.
///
/// Dropping the stream unsubscribes it.
#[derive(Debug)]
pub struct ActivationStream {
    subscription_id: SubscriptionId,
    rx: Receiver<ActivationChange>,
    control_tx: Sender<ControlMsg>,
    unsubscribed: AtomicBool,
}

impl ActivationStream {
    pub(crate) fn new(
        subscription_id: SubscriptionId,
        rx: Receiver<ActivationChange>,
        control_tx: Sender<ControlMsg>,
    ) -> Self {
        Self {
            subscription_id,
            rx,
            control_tx,
            unsubscribed: AtomicBool::new(false),
        }
    }

    /// Id of this subscription.
    #[must_use]
    pub const fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Stops delivery to this stream. Non-blocking and idempotent.
    pub fn unsubscribe(&self) {
        if self.unsubscribed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.control_tx.try_send(ControlMsg::Unsubscribe {
            subscription_id: self.subscription_id,
        });
    }

    /// Receive the next change (blocking).
    ///
    /// # Errors
    /// `Disconnected` once the trigger engine has stopped.
    pub fn recv(&self) -> SyncResult<ActivationChange> {
        self.rx.recv().map_err(|_| SyncError::disconnected("activation_stream"))
    }

    /// Receive the next change with a timeout.
    ///
    /// # Errors
    /// `Timeout` if nothing arrives in time, `Disconnected` once the trigger
    /// engine has stopped.
    pub fn recv_timeout(&self, timeout: Duration) -> SyncResult<ActivationChange> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => SyncError::Execution(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => SyncError::disconnected("activation_stream"),
        })
    }

    /// The next change if one is already waiting.
    ///
    /// # Errors
    /// `Disconnected` once the trigger engine has stopped.
    pub fn try_recv(&self) -> SyncResult<Option<ActivationChange>> {
        match self.rx.try_recv() {
            Ok(change) => Ok(Some(change)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SyncError::disconnected("activation_stream")),
        }
    }
}

impl Drop for ActivationStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
