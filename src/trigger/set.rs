//! Trigger table and edge-triggered evaluation.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::ValidationError;
use crate::statement::ChangeNotification;
use crate::store::StoreClient;

use super::types::{ActivationChange, ActivationState, TriggerRegistration};

/// Registered triggers keyed by label.
#[derive(Debug, Default)]
pub(crate) struct TriggerSet {
    triggers: BTreeMap<String, TriggerRegistration>,
}

impl TriggerSet {
    pub(crate) fn register(
        &mut self,
        registration: TriggerRegistration,
    ) -> Result<(), ValidationError> {
        if self.triggers.contains_key(&registration.label) {
            return Err(ValidationError::DuplicateTriggerLabel {
                label: registration.label,
            });
        }
        self.triggers.insert(registration.label.clone(), registration);
        Ok(())
    }

    pub(crate) fn deregister(
        &mut self,
        label: &str,
    ) -> Result<TriggerRegistration, ValidationError> {
        self.triggers
            .remove(label)
            .ok_or_else(|| ValidationError::UnknownTrigger {
                label: label.to_string(),
            })
    }

    pub(crate) fn registrations(&self) -> Vec<TriggerRegistration> {
        self.triggers.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.triggers.len()
    }

    /// Re-evaluates the triggers interested in `notification`.
    pub(crate) fn on_notification(
        &mut self,
        notification: &ChangeNotification,
        store: &dyn StoreClient,
    ) -> Vec<ActivationChange> {
        let labels: Vec<String> = self
            .triggers
            .values()
            .filter(|t| t.interest.matches(notification))
            .map(|t| t.label.clone())
            .collect();
        labels
            .iter()
            .filter_map(|label| self.evaluate(label, store))
            .collect()
    }

    /// Re-evaluates every trigger.
    pub(crate) fn evaluate_all(&mut self, store: &dyn StoreClient) -> Vec<ActivationChange> {
        let labels: Vec<String> = self.triggers.keys().cloned().collect();
        labels
            .iter()
            .filter_map(|label| self.evaluate(label, store))
            .collect()
    }

    /// Puts every trigger back to `Unknown`, reporting those that changed.
    pub(crate) fn reset_all(&mut self) -> Vec<ActivationChange> {
        let now = Utc::now();
        self.triggers
            .values_mut()
            .filter(|t| t.state != ActivationState::Unknown)
            .map(|t| {
                let previous = std::mem::replace(&mut t.state, ActivationState::Unknown);
                ActivationChange {
                    trigger_id: t.id,
                    label: t.label.clone(),
                    previous,
                    current: ActivationState::Unknown,
                    at: now,
                }
            })
            .collect()
    }

    /// Asks the trigger's query and records the result.
    ///
    /// Returns a change only when the state actually moved. A failed ask
    /// leaves the state as it was.
    pub(crate) fn evaluate(
        &mut self,
        label: &str,
        store: &dyn StoreClient,
    ) -> Option<ActivationChange> {
        let trigger = self.triggers.get_mut(label)?;
        let result = match store.ask(&trigger.query) {
            Ok(result) => result,
            Err(e) => {
                warn!(trigger = %trigger.label, error = %e, "trigger evaluation failed");
                return None;
            }
        };

        let next = ActivationState::after(result);
        if next == trigger.state {
            debug!(trigger = %trigger.label, state = %next, "trigger unchanged");
            return None;
        }
        let previous = std::mem::replace(&mut trigger.state, next);
        Some(ActivationChange {
            trigger_id: trigger.id,
            label: trigger.label.clone(),
            previous,
            current: next,
            at: Utc::now(),
        })
    }
}
