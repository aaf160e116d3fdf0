//! Ephemeral editor state shared by everyone editing a workflow.
//!
//! Pinned outputs, disabled steps, step locks and the webhook test
//! listener live here rather than in the draft: they are never persisted
//! with it and carry no version of their own. The session mutates this
//! state in place for each accepted operation and rebroadcasts it whole.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::operation::{DisableMode, Operation, OperationKind};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Advisory edit lock on a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLock {
    pub user_id: String,
    pub acquired_at: u64,
}

/// An active "listen for test webhook" request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookTest {
    pub step_id: String,
    pub started_by: String,
    pub started_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EditorState {
    #[serde(default)]
    pub pinned_outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub disabled_steps: BTreeSet<String>,
    #[serde(default)]
    pub disabled_mode: BTreeMap<String, DisableMode>,
    #[serde(default)]
    pub step_locks: BTreeMap<String, StepLock>,
    #[serde(default)]
    pub webhook_test: Option<WebhookTest>,
}

/// Outcome of a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock was free and is now held by the requester.
    Acquired { acquired_at: u64 },
    /// The requester already held it since `acquired_at`.
    AlreadyHeld { acquired_at: u64 },
    /// Someone else holds it.
    Conflict { locked_by: String },
}

impl EditorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_disabled(&self, step_id: &str) -> bool {
        self.disabled_steps.contains(step_id)
    }

    pub fn lock_holder(&self, step_id: &str) -> Option<&str> {
        self.step_locks.get(step_id).map(|l| l.user_id.as_str())
    }

    /// Apply the editor-state side effect of an accepted operation.
    /// Returns whether anything changed.
    pub fn apply_effect(&mut self, op: &Operation) -> bool {
        match &op.kind {
            OperationKind::PinStepOutput(pin) => {
                let previous = self.pinned_outputs.insert(pin.step_id.clone(), pin.data.clone());
                previous.as_ref() != Some(&pin.data)
            }
            OperationKind::UnpinStepOutput(r) => self.pinned_outputs.remove(&r.step_id).is_some(),
            OperationKind::DisableStep(d) => {
                let added = self.disabled_steps.insert(d.step_id.clone());
                let previous = self.disabled_mode.insert(d.step_id.clone(), d.mode);
                added || previous != Some(d.mode)
            }
            OperationKind::EnableStep(r) => {
                let removed = self.disabled_steps.remove(&r.step_id);
                let mode_removed = self.disabled_mode.remove(&r.step_id).is_some();
                removed || mode_removed
            }
            OperationKind::RemoveStep(r) => self.forget_step(&r.step_id),
            _ => false,
        }
    }

    /// Drop everything that refers to a step that no longer exists.
    pub fn forget_step(&mut self, step_id: &str) -> bool {
        let mut changed = self.pinned_outputs.remove(step_id).is_some();
        changed |= self.disabled_steps.remove(step_id);
        changed |= self.disabled_mode.remove(step_id).is_some();
        changed |= self.step_locks.remove(step_id).is_some();
        if self.webhook_test.as_ref().is_some_and(|t| t.step_id == step_id) {
            self.webhook_test = None;
            changed = true;
        }
        changed
    }

    /// Grant `step_id` to `user_id` unless another user holds it.
    pub fn acquire_lock(&mut self, step_id: &str, user_id: &str, now: u64) -> LockOutcome {
        match self.step_locks.get(step_id) {
            Some(lock) if lock.user_id == user_id => LockOutcome::AlreadyHeld {
                acquired_at: lock.acquired_at,
            },
            Some(lock) => LockOutcome::Conflict {
                locked_by: lock.user_id.clone(),
            },
            None => {
                self.step_locks.insert(
                    step_id.to_string(),
                    StepLock {
                        user_id: user_id.to_string(),
                        acquired_at: now,
                    },
                );
                LockOutcome::Acquired { acquired_at: now }
            }
        }
    }

    /// Release `step_id` if `user_id` holds it. Returns whether it was released.
    pub fn release_lock(&mut self, step_id: &str, user_id: &str) -> bool {
        if self.lock_holder(step_id) == Some(user_id) {
            self.step_locks.remove(step_id);
            true
        } else {
            false
        }
    }

    /// Release every lock held by `user_id`, returning the freed step ids.
    pub fn release_user_locks(&mut self, user_id: &str) -> Vec<String> {
        let freed: Vec<String> = self
            .step_locks
            .iter()
            .filter(|(_, lock)| lock.user_id == user_id)
            .map(|(step_id, _)| step_id.clone())
            .collect();
        for step_id in &freed {
            self.step_locks.remove(step_id);
        }
        freed
    }
}
