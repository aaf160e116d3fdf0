//! Client-side copy of a workflow draft.
//!
//! ```text
//!            confirmed draft @ seq          (what the server said)
//!   view  =        +  pending operations    (optimistic local edits)
//! ```
//!
//! Broadcasts are applied to the confirmed draft in sequence order, own
//! operations included. Duplicates (`seq <= local seq`) are ignored. A gap
//! asks the server to catch us up. A failed apply or a rejected local edit
//! throws the replica away and asks for a full sync; the replica never
//! tries to repair itself.

use flowdraft_core::{
    apply_in_place, ApplyError, EditorState, Operation, OperationKind, StepLock, WorkflowDraft,
};

use crate::session::SyncState;

/// What the owner of a replica must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaAction {
    None,
    /// Send `request_sync` with `Replica::sync_request()`.
    RequestSync,
}

#[derive(Debug, Clone)]
pub struct Replica {
    user_id: String,
    /// `None` until the first full sync, and after a discard.
    confirmed: Option<WorkflowDraft>,
    confirmed_state: EditorState,
    seq: u64,
    view: WorkflowDraft,
    view_state: EditorState,
    pending: Vec<Operation>,
    next_client_seq: u64,
    awaiting_sync: bool,
    resyncs: u64,
}

impl Replica {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            confirmed: None,
            confirmed_state: EditorState::new(),
            seq: 0,
            view: WorkflowDraft::new(),
            view_state: EditorState::new(),
            pending: Vec::new(),
            next_client_seq: 1,
            awaiting_sync: true,
            resyncs: 0,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The draft as the user sees it, local edits included.
    pub fn draft(&self) -> &WorkflowDraft {
        &self.view
    }

    /// The last draft confirmed by the server.
    pub fn confirmed_draft(&self) -> Option<&WorkflowDraft> {
        self.confirmed.as_ref()
    }

    pub fn editor_state(&self) -> &EditorState {
        &self.view_state
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Local edits not yet confirmed.
    pub fn pending(&self) -> &[Operation] {
        &self.pending
    }

    pub fn is_synced(&self) -> bool {
        !self.awaiting_sync && self.confirmed.is_some()
    }

    /// Times the replica was thrown away.
    pub fn resync_count(&self) -> u64 {
        self.resyncs
    }

    /// `known_seq` for the next `request_sync`. `None` asks for a full sync.
    pub fn sync_request(&self) -> Option<u64> {
        self.confirmed.as_ref().map(|_| self.seq)
    }

    /// Build a local edit and echo it into the view. The returned
    /// operation still has to be sent to the server.
    pub fn propose(&mut self, kind: OperationKind) -> Result<Operation, ApplyError> {
        let op = Operation::new(self.user_id.clone(), kind).with_client_seq(self.next_client_seq);
        apply_in_place(&mut self.view, &op.kind)?;
        self.next_client_seq += 1;
        self.view_state.apply_effect(&op);
        self.pending.push(op.clone());
        Ok(op)
    }

    /// Put an already-built local edit back on top of the view, e.g. one
    /// queued while offline.
    pub fn resubmit(&mut self, op: Operation) -> Result<(), ApplyError> {
        apply_in_place(&mut self.view, &op.kind)?;
        self.view_state.apply_effect(&op);
        self.pending.push(op);
        Ok(())
    }

    /// Fold an `operation_applied` broadcast.
    pub fn handle_operation_applied(&mut self, op: &Operation) -> ReplicaAction {
        if self.awaiting_sync {
            // The coming sync state supersedes it.
            return ReplicaAction::None;
        }
        let Some(seq) = op.seq else {
            log::warn!("Ignoring unsequenced broadcast {}", op.id);
            return ReplicaAction::None;
        };

        if seq <= self.seq {
            log::trace!("Duplicate broadcast seq {seq}");
            self.pending.retain(|p| p.id != op.id);
            return ReplicaAction::None;
        }
        if seq > self.seq + 1 {
            log::debug!("Gap: have seq {}, got {seq}", self.seq);
            self.awaiting_sync = true;
            return ReplicaAction::RequestSync;
        }

        let Some(confirmed) = self.confirmed.as_mut() else {
            return self.request_full_sync();
        };
        if let Err(e) = apply_in_place(confirmed, &op.kind) {
            log::warn!("Replica diverged at seq {seq}: {e}");
            return self.discard();
        }
        self.seq = seq;
        self.confirmed_state.apply_effect(op);
        self.pending.retain(|p| p.id != op.id);
        self.rebase();
        ReplicaAction::None
    }

    /// The server refused operation `op_id`.
    pub fn handle_rejected(&mut self, op_id: &str) -> ReplicaAction {
        if self.pending.iter().any(|p| p.id == op_id) {
            log::debug!("Local operation {op_id} rejected, resyncing");
            self.discard()
        } else {
            ReplicaAction::None
        }
    }

    pub fn apply_sync_state(&mut self, state: SyncState) -> ReplicaAction {
        match state {
            SyncState::FullSync {
                draft,
                editor_state,
                seq,
            } => {
                self.confirmed = Some(draft);
                self.confirmed_state = editor_state;
                self.seq = seq;
                // Whatever was in flight is either in this state already,
                // still on its way as a broadcast, or rejected.
                self.pending.clear();
                self.awaiting_sync = false;
                self.rebase();
                ReplicaAction::None
            }
            SyncState::Incremental {
                seq,
                operations,
                editor_state,
            } => {
                let Some(confirmed) = self.confirmed.as_mut() else {
                    return self.request_full_sync();
                };
                for op in &operations {
                    let Some(op_seq) = op.seq else {
                        return self.discard();
                    };
                    if op_seq <= self.seq {
                        continue;
                    }
                    if op_seq != self.seq + 1 || apply_in_place(confirmed, &op.kind).is_err() {
                        log::warn!("Incremental sync does not apply on seq {}", self.seq);
                        return self.discard();
                    }
                    self.seq = op_seq;
                    self.pending.retain(|p| p.id != op.id);
                }
                if self.seq != seq {
                    return self.discard();
                }
                self.confirmed_state = editor_state;
                self.awaiting_sync = false;
                self.rebase();
                ReplicaAction::None
            }
            SyncState::UpToDate { seq, editor_state } => {
                if self.confirmed.is_none() || seq != self.seq {
                    return self.discard();
                }
                self.confirmed_state = editor_state;
                self.awaiting_sync = false;
                self.rebase_state();
                ReplicaAction::None
            }
        }
    }

    pub fn handle_editor_state(&mut self, state: EditorState) {
        self.confirmed_state = state;
        self.rebase_state();
    }

    pub fn handle_lock_acquired(&mut self, step_id: &str, user_id: &str, acquired_at: u64) {
        self.confirmed_state.step_locks.insert(
            step_id.to_string(),
            StepLock {
                user_id: user_id.to_string(),
                acquired_at,
            },
        );
        self.rebase_state();
    }

    pub fn handle_lock_released(&mut self, step_id: &str) {
        self.confirmed_state.step_locks.remove(step_id);
        self.rebase_state();
    }

    /// Throw away all local state and ask for a full sync.
    pub fn discard(&mut self) -> ReplicaAction {
        self.confirmed = None;
        self.confirmed_state = EditorState::new();
        self.view = WorkflowDraft::new();
        self.view_state = EditorState::new();
        self.pending.clear();
        self.resyncs += 1;
        self.request_full_sync()
    }

    fn request_full_sync(&mut self) -> ReplicaAction {
        self.awaiting_sync = true;
        ReplicaAction::RequestSync
    }

    /// Recompute the view from the confirmed draft plus pending edits.
    /// Edits that no longer apply are dropped.
    fn rebase(&mut self) {
        let mut view = self.confirmed.clone().unwrap_or_default();
        let mut state = self.confirmed_state.clone();
        self.pending.retain(|op| match apply_in_place(&mut view, &op.kind) {
            Ok(()) => {
                state.apply_effect(op);
                true
            }
            Err(e) => {
                log::debug!("Dropping local operation {}: {e}", op.id);
                false
            }
        });
        self.view = view;
        self.view_state = state;
    }

    fn rebase_state(&mut self) {
        let mut state = self.confirmed_state.clone();
        for op in &self.pending {
            state.apply_effect(op);
        }
        self.view_state = state;
    }
}
