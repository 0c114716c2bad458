//! Trigger engine worker.
//!
//! The worker owns the trigger table. Registrations arrive over a bounded
//! control channel and are acknowledged on a reply channel; change
//! notifications and connectivity events arrive on their own channels. All
//! store queries run on the worker thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender};
use tracing::{debug, info};

use crate::config::TriggerConfig;
use crate::connectivity::{ConnectivityEvent, ConnectivityState, ConnectivityView};
use crate::error::{SyncError, SyncResult, ValidationError};
use crate::statement::ChangeNotification;
use crate::store::StoreClient;

use super::set::TriggerSet;
use super::stream::ActivationStream;
use super::types::{
    ActivationChange, ActivationState, Interest, SubscriptionId, TriggerHandle, TriggerId,
    TriggerRegistration,
};

#[derive(Debug)]
pub(crate) enum ControlMsg {
    Register {
        registration: TriggerRegistration,
        reply: Sender<SyncResult<()>>,
    },
    Deregister {
        label: String,
        reply: Sender<SyncResult<()>>,
    },
    List {
        reply: Sender<Vec<TriggerRegistration>>,
    },
    Subscribe {
        subscription_id: SubscriptionId,
        tx: Sender<ActivationChange>,
        reply: Sender<()>,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
    },
    /// Replies once every input already queued has been handled.
    Sync {
        reply: Sender<()>,
    },
    Shutdown,
}

/// Evaluates registered triggers and publishes activation changes.
#[derive(Debug)]
pub struct TriggerEngine {
    control_tx: Sender<ControlMsg>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TriggerEngine {
    /// Starts the engine worker.
    ///
    /// # Errors
    /// Fails if the worker thread cannot be spawned.
    pub fn new(
        cfg: TriggerConfig,
        store: Arc<dyn StoreClient>,
        connectivity: ConnectivityView,
        notifications: Receiver<ChangeNotification>,
        connectivity_events: Receiver<ConnectivityEvent>,
    ) -> SyncResult<Self> {
        let (control_tx, control_rx) = bounded::<ControlMsg>(cfg.control_queue_capacity.max(1));
        let worker = Worker {
            cfg,
            store,
            connectivity,
            triggers: TriggerSet::default(),
            subscribers: HashMap::new(),
        };
        let join = thread::Builder::new()
            .name("ontosync-triggers".to_string())
            .spawn(move || worker.run(&control_rx, notifications, connectivity_events))
            .map_err(|e| SyncError::internal(format!("failed to spawn trigger engine: {e}")))?;

        Ok(Self {
            control_tx,
            join: Mutex::new(Some(join)),
        })
    }

    /// Registers a trigger.
    ///
    /// # Errors
    /// - `EmptyField` for an empty label or query
    /// - `DuplicateTriggerLabel` if the label is taken
    pub fn register(
        &self,
        label: impl Into<String>,
        query: impl Into<String>,
        interest: Interest,
    ) -> SyncResult<TriggerHandle> {
        let label = label.into();
        let query = query.into();
        if label.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "label".to_string(),
            }
            .into());
        }
        if query.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "query".to_string(),
            }
            .into());
        }

        let registration = TriggerRegistration {
            id: TriggerId::new(),
            label,
            query,
            interest,
            state: ActivationState::Unknown,
            registered_at: Utc::now(),
        };
        let handle = TriggerHandle {
            id: registration.id,
            label: registration.label.clone(),
        };
        self.request(|reply| ControlMsg::Register { registration, reply })??;
        Ok(handle)
    }

    /// Removes a trigger.
    ///
    /// # Errors
    /// `UnknownTrigger` if no trigger has this label.
    pub fn deregister(&self, label: &str) -> SyncResult<()> {
        self.request(|reply| ControlMsg::Deregister {
            label: label.to_string(),
            reply,
        })?
    }

    /// Current registrations ordered by label.
    ///
    /// # Errors
    /// `Disconnected` if the engine worker has stopped.
    pub fn registrations(&self) -> SyncResult<Vec<TriggerRegistration>> {
        self.request(|reply| ControlMsg::List { reply })
    }

    /// Activation state of the trigger with `label`, if registered.
    ///
    /// # Errors
    /// `Disconnected` if the engine worker has stopped.
    pub fn activation_state(&self, label: &str) -> SyncResult<Option<ActivationState>> {
        Ok(self
            .registrations()?
            .into_iter()
            .find(|t| t.label == label)
            .map(|t| t.state))
    }

    /// Opens a stream of activation changes published from now on.
    ///
    /// # Errors
    /// `Disconnected` if the engine worker has stopped.
    pub fn subscribe(&self) -> SyncResult<ActivationStream> {
        let subscription_id = SubscriptionId::new();
        let (tx, rx) = unbounded();
        self.request(|reply| ControlMsg::Subscribe {
            subscription_id,
            tx,
            reply,
        })?;
        Ok(ActivationStream::new(subscription_id, rx, self.control_tx.clone()))
    }

    /// Waits until every notification and connectivity event queued before
    /// this call has been handled.
    ///
    /// # Errors
    /// `Disconnected` if the engine worker has stopped.
    pub fn sync(&self) -> SyncResult<()> {
        self.request(|reply| ControlMsg::Sync { reply })
    }

    /// Stops the worker and waits for it to exit.
    pub fn shutdown(&self) {
        let _ = self.control_tx.send(ControlMsg::Shutdown);
        if let Ok(mut guard) = self.join.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }

    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> ControlMsg) -> SyncResult<T> {
        let (reply_tx, reply_rx) = bounded::<T>(1);
        self.control_tx
            .send(build(reply_tx))
            .map_err(|_| SyncError::disconnected("trigger_control"))?;
        reply_rx
            .recv()
            .map_err(|_| SyncError::disconnected("trigger_control"))
    }
}

impl Drop for TriggerEngine {
    fn drop(&mut self) {
        // Streams may outlive the engine and hold control senders, so ask the
        // worker to stop instead of waiting for the channel to close.
        let _ = self.control_tx.try_send(ControlMsg::Shutdown);
    }
}

struct Worker {
    cfg: TriggerConfig,
    store: Arc<dyn StoreClient>,
    connectivity: ConnectivityView,
    triggers: TriggerSet,
    subscribers: HashMap<SubscriptionId, Sender<ActivationChange>>,
}

impl Worker {
    fn run(
        mut self,
        control_rx: &Receiver<ControlMsg>,
        notifications: Receiver<ChangeNotification>,
        connectivity_events: Receiver<ConnectivityEvent>,
    ) {
        let mut notifications = notifications;
        let mut connectivity_events = connectivity_events;

        loop {
            let (notification_rx, event_rx) = (notifications.clone(), connectivity_events.clone());
            select! {
                recv(control_rx) -> msg => match msg {
                    Ok(ControlMsg::Shutdown) | Err(_) => break,
                    Ok(ControlMsg::Sync { reply }) => {
                        for event in connectivity_events.try_iter().collect::<Vec<_>>() {
                            self.on_connectivity(&event);
                        }
                        for notification in notifications.try_iter().collect::<Vec<_>>() {
                            self.on_notification(&notification);
                        }
                        let _ = reply.send(());
                    }
                    Ok(msg) => self.on_control(msg),
                },
                recv(event_rx) -> msg => match msg {
                    Ok(event) => self.on_connectivity(&event),
                    Err(_) => connectivity_events = never(),
                },
                recv(notification_rx) -> msg => match msg {
                    Ok(notification) => self.on_notification(&notification),
                    Err(_) => notifications = never(),
                },
            }
        }
        debug!(triggers = self.triggers.len(), "trigger engine stopped");
    }

    fn on_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Register { registration, reply } => {
                let label = registration.label.clone();
                let result = self.triggers.register(registration).map_err(SyncError::from);
                let registered = result.is_ok();
                let _ = reply.send(result);
                if registered {
                    info!(trigger = %label, "trigger registered");
                    if self.cfg.evaluate_on_register && self.connectivity.is_connected() {
                        let change = self.triggers.evaluate(&label, self.store.as_ref());
                        self.publish(change);
                    }
                }
            }
            ControlMsg::Deregister { label, reply } => {
                let result = self.triggers.deregister(&label).map(|_| ()).map_err(SyncError::from);
                if result.is_ok() {
                    info!(trigger = %label, "trigger deregistered");
                }
                let _ = reply.send(result);
            }
            ControlMsg::List { reply } => {
                let _ = reply.send(self.triggers.registrations());
            }
            ControlMsg::Subscribe {
                subscription_id,
                tx,
                reply,
            } => {
                self.subscribers.insert(subscription_id, tx);
                let _ = reply.send(());
            }
            ControlMsg::Unsubscribe { subscription_id } => {
                self.subscribers.remove(&subscription_id);
            }
            ControlMsg::Sync { reply } => {
                let _ = reply.send(());
            }
            ControlMsg::Shutdown => {}
        }
    }

    fn on_notification(&mut self, notification: &ChangeNotification) {
        if !self.connectivity.is_connected() {
            debug!(
                entry = notification.entry_id,
                "store not connected, skipping trigger evaluation"
            );
            return;
        }
        let changes = self.triggers.on_notification(notification, self.store.as_ref());
        self.publish(changes);
    }

    fn on_connectivity(&mut self, event: &ConnectivityEvent) {
        match event {
            ConnectivityEvent::StateChanged {
                to: ConnectivityState::Connected,
                ..
            } => {
                let changes = self.triggers.evaluate_all(self.store.as_ref());
                self.publish(changes);
            }
            ConnectivityEvent::StateChanged {
                to: ConnectivityState::Disconnected | ConnectivityState::Unknown,
                ..
            } => {
                let changes = self.triggers.reset_all();
                self.publish(changes);
            }
            ConnectivityEvent::PhaseOpened(_)
            | ConnectivityEvent::PhaseExtended(_)
            | ConnectivityEvent::PhaseClosed(_) => {}
        }
    }

    fn publish(&mut self, changes: impl IntoIterator<Item = ActivationChange>) {
        for change in changes {
            info!(
                trigger = %change.label,
                from = %change.previous,
                to = %change.current,
                "trigger activation changed"
            );
            self.subscribers.retain(|_, tx| tx.send(change.clone()).is_ok());
        }
    }
}
