//! Live execution status board.
//!
//! The engine emits step lifecycle events at least once, in order within
//! one step but with no ordering across steps. `ExecutionProjector` folds
//! them into a `step_id -> StepExecutionState` map that never regresses:
//!
//! ```text
//! pending ─► queued ─► running ─► completed | failed
//!    └─────────────────────────► skipped
//! ```
//!
//! An event only fills the fields it carries, and the first terminal state
//! owns the terminal fields. Switching to a newer execution is the only way
//! the map is cleared.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::broadcast::{RoomManager, Topic};
use crate::protocol::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Progress rank. Terminal states share the top rank, so a late
    /// `running` never overwrites `completed`.
    pub fn rank(self) -> u8 {
        match self {
            StepStatus::Pending => 0,
            StepStatus::Queued => 1,
            StepStatus::Running => 2,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }
}

/// Projected state of one step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepExecutionState {
    pub status: StepStatus,
    #[serde(default)]
    pub queued_at: Option<u64>,
    #[serde(default)]
    pub started_at: Option<u64>,
    #[serde(default)]
    pub completed_at: Option<u64>,
    /// Milliseconds.
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub input_data: Option<Value>,
    #[serde(default)]
    pub output_data: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    fn rank(self) -> u8 {
        match self {
            ExecutionStatus::Pending => 0,
            ExecutionStatus::Running => 1,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: Uuid,
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub started_at: Option<u64>,
    #[serde(default)]
    pub finished_at: Option<u64>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl ExecutionSummary {
    fn new(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            workflow_id: None,
            status: ExecutionStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Lifecycle event emitted by the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    StepQueued {
        execution_id: Uuid,
        step_id: String,
        #[serde(default)]
        queued_at: Option<u64>,
    },
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        #[serde(default)]
        input_data: Option<Value>,
        #[serde(default)]
        started_at: Option<u64>,
    },
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        #[serde(default)]
        output_data: Option<Value>,
        #[serde(default)]
        completed_at: Option<u64>,
        #[serde(default)]
        duration: Option<u64>,
    },
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        #[serde(default)]
        error: Option<Value>,
        #[serde(default)]
        completed_at: Option<u64>,
        #[serde(default)]
        duration: Option<u64>,
    },
    StepSkipped { execution_id: Uuid, step_id: String },
    ExecutionStarted {
        execution_id: Uuid,
        #[serde(default)]
        workflow_id: Option<Uuid>,
        #[serde(default)]
        started_at: Option<u64>,
    },
    ExecutionUpdated { execution_id: Uuid, status: ExecutionStatus },
    ExecutionCompleted {
        execution_id: Uuid,
        #[serde(default)]
        finished_at: Option<u64>,
    },
    ExecutionFailed {
        execution_id: Uuid,
        #[serde(default)]
        finished_at: Option<u64>,
        #[serde(default)]
        error: Option<Value>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> Uuid {
        match self {
            ExecutionEvent::StepQueued { execution_id, .. }
            | ExecutionEvent::StepStarted { execution_id, .. }
            | ExecutionEvent::StepCompleted { execution_id, .. }
            | ExecutionEvent::StepFailed { execution_id, .. }
            | ExecutionEvent::StepSkipped { execution_id, .. }
            | ExecutionEvent::ExecutionStarted { execution_id, .. }
            | ExecutionEvent::ExecutionUpdated { execution_id, .. }
            | ExecutionEvent::ExecutionCompleted { execution_id, .. }
            | ExecutionEvent::ExecutionFailed { execution_id, .. } => *execution_id,
        }
    }

    pub fn step_id(&self) -> Option<&str> {
        match self {
            ExecutionEvent::StepQueued { step_id, .. }
            | ExecutionEvent::StepStarted { step_id, .. }
            | ExecutionEvent::StepCompleted { step_id, .. }
            | ExecutionEvent::StepFailed { step_id, .. }
            | ExecutionEvent::StepSkipped { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}

/// Queryable state of an execution, used to re-derive the board after a
/// reconnect since missed events are never replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub summary: ExecutionSummary,
    #[serde(default)]
    pub steps: BTreeMap<String, StepExecutionState>,
}

/// Folds execution events into a per-step status map.
#[derive(Debug, Clone, Default)]
pub struct ExecutionProjector {
    summary: Option<ExecutionSummary>,
    steps: BTreeMap<String, StepExecutionState>,
}

impl ExecutionProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Projector bound to `execution_id`.
    pub fn for_execution(execution_id: Uuid) -> Self {
        let mut projector = Self::new();
        projector.select_execution(execution_id);
        projector
    }

    pub fn execution_id(&self) -> Option<Uuid> {
        self.summary.as_ref().map(|s| s.execution_id)
    }

    /// Switch to `execution_id`, clearing everything projected so far.
    pub fn select_execution(&mut self, execution_id: Uuid) {
        log::debug!("Projector switched to execution {execution_id}");
        self.summary = Some(ExecutionSummary::new(execution_id));
        self.steps.clear();
    }

    /// Replace the projection with a snapshot.
    pub fn load_snapshot(&mut self, snapshot: ExecutionSnapshot) {
        self.summary = Some(snapshot.summary);
        self.steps = snapshot.steps;
    }

    /// Fold one event. Returns whether the projection changed.
    pub fn apply(&mut self, event: &ExecutionEvent) -> bool {
        let execution_id = event.execution_id();
        match self.execution_id() {
            None => self.select_execution(execution_id),
            Some(current) if current != execution_id => {
                if let ExecutionEvent::ExecutionStarted { started_at, .. } = event {
                    if self.started_before(*started_at) {
                        log::debug!("Ignoring redelivered start of {execution_id}, watching {current}");
                        return false;
                    }
                    self.select_execution(execution_id);
                } else {
                    log::trace!("Ignoring event for execution {execution_id}, watching {current}");
                    return false;
                }
            }
            Some(_) => {}
        }

        match event {
            ExecutionEvent::StepQueued { step_id, queued_at, .. } => self.update_step(step_id, |s| {
                let mut changed = advance(&mut s.status, StepStatus::Queued);
                changed |= merge(&mut s.queued_at, queued_at);
                changed
            }),
            ExecutionEvent::StepStarted {
                step_id,
                input_data,
                started_at,
                ..
            } => self.update_step(step_id, |s| {
                let mut changed = advance(&mut s.status, StepStatus::Running);
                changed |= merge(&mut s.started_at, started_at);
                changed |= merge(&mut s.input_data, input_data);
                changed
            }),
            ExecutionEvent::StepCompleted {
                step_id,
                output_data,
                completed_at,
                duration,
                ..
            } => self.update_step(step_id, |s| {
                let mut changed = advance(&mut s.status, StepStatus::Completed);
                if s.status != StepStatus::Completed {
                    return changed;
                }
                changed |= merge(&mut s.completed_at, completed_at);
                changed |= merge(&mut s.output_data, output_data);
                changed |= merge_duration(s, duration);
                changed
            }),
            ExecutionEvent::StepFailed {
                step_id,
                error,
                completed_at,
                duration,
                ..
            } => self.update_step(step_id, |s| {
                let mut changed = advance(&mut s.status, StepStatus::Failed);
                if s.status != StepStatus::Failed {
                    return changed;
                }
                changed |= merge(&mut s.completed_at, completed_at);
                changed |= merge(&mut s.error, error);
                changed |= merge_duration(s, duration);
                changed
            }),
            ExecutionEvent::StepSkipped { step_id, .. } => {
                self.update_step(step_id, |s| advance(&mut s.status, StepStatus::Skipped))
            }
            ExecutionEvent::ExecutionStarted {
                workflow_id, started_at, ..
            } => self.update_summary(|s| {
                let mut changed = advance_execution(&mut s.status, ExecutionStatus::Running);
                changed |= merge(&mut s.workflow_id, workflow_id);
                changed |= merge(&mut s.started_at, started_at);
                changed
            }),
            ExecutionEvent::ExecutionUpdated { status, .. } => {
                self.update_summary(|s| advance_execution(&mut s.status, *status))
            }
            ExecutionEvent::ExecutionCompleted { finished_at, .. } => self.update_summary(|s| {
                let mut changed = advance_execution(&mut s.status, ExecutionStatus::Completed);
                changed |= merge(&mut s.finished_at, finished_at);
                changed
            }),
            ExecutionEvent::ExecutionFailed { finished_at, error, .. } => self.update_summary(|s| {
                let mut changed = advance_execution(&mut s.status, ExecutionStatus::Failed);
                changed |= merge(&mut s.finished_at, finished_at);
                changed |= merge(&mut s.error, error);
                changed
            }),
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepExecutionState> {
        self.steps.get(step_id)
    }

    pub fn steps(&self) -> &BTreeMap<String, StepExecutionState> {
        &self.steps
    }

    pub fn summary(&self) -> Option<&ExecutionSummary> {
        self.summary.as_ref()
    }

    /// Steps currently in `status`.
    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.values().filter(|s| s.status == status).count()
    }

    /// Whether `started_at` predates the execution being watched.
    fn started_before(&self, started_at: Option<u64>) -> bool {
        let current = self.summary.as_ref().and_then(|s| s.started_at);
        matches!((started_at, current), (Some(incoming), Some(current)) if incoming < current)
    }

    fn update_step(&mut self, step_id: &str, f: impl FnOnce(&mut StepExecutionState) -> bool) -> bool {
        let created = !self.steps.contains_key(step_id);
        let state = self.steps.entry(step_id.to_string()).or_default();
        f(state) || created
    }

    fn update_summary(&mut self, f: impl FnOnce(&mut ExecutionSummary) -> bool) -> bool {
        self.summary.as_mut().is_some_and(f)
    }
}

/// Move forward only. Among terminal states the first one wins.
fn advance(current: &mut StepStatus, next: StepStatus) -> bool {
    if next.rank() > current.rank() {
        *current = next;
        true
    } else {
        false
    }
}

fn advance_execution(current: &mut ExecutionStatus, next: ExecutionStatus) -> bool {
    if next.rank() > current.rank() {
        *current = next;
        true
    } else {
        false
    }
}

/// Overwrite only with a present value.
fn merge<T: Clone + PartialEq>(slot: &mut Option<T>, incoming: &Option<T>) -> bool {
    match incoming {
        Some(value) if slot.as_ref() != Some(value) => {
            *slot = Some(value.clone());
            true
        }
        _ => false,
    }
}

fn merge_duration(state: &mut StepExecutionState, duration: &Option<u64>) -> bool {
    if duration.is_some() {
        return merge(&mut state.duration, duration);
    }
    match (state.duration, state.started_at, state.completed_at) {
        (None, Some(start), Some(end)) => {
            state.duration = Some(end.saturating_sub(start));
            true
        }
        _ => false,
    }
}

/// Server-side entry point for engine events: fans them out to whoever
/// watches the execution.
#[derive(Clone)]
pub struct ExecutionPublisher {
    rooms: Arc<RoomManager>,
}

impl ExecutionPublisher {
    pub fn new(rooms: Arc<RoomManager>) -> Self {
        Self { rooms }
    }

    /// Publish to the execution's topic. Returns how many watchers got it;
    /// with no watchers the event is dropped.
    pub async fn publish(&self, event: ExecutionEvent) -> usize {
        let topic = Topic::Execution(event.execution_id());
        match self.rooms.get(topic).await {
            Some(group) => group.publish(ServerMessage::Execution { event }),
            None => {
                log::trace!("No watchers on {topic}, dropping event");
                0
            }
        }
    }
}
