//! The authoritative edit session of one workflow.
//!
//! ```text
//!  SessionHandle ──┐                          ┌──► operation_applied
//!  SessionHandle ──┼──► mpsc ──► EditSession ─┼──► editor_state_updated
//!  SessionHandle ──┘   (one      (single      └──► lock_acquired / lock_released
//!                      queue)     writer)            (workflow topic)
//!                                   │
//!                                   ├── append_operation ──► DraftStore log
//!                                   └── persist ──► snapshot + compact
//! ```
//!
//! Every mutation and lock request for a workflow goes through one task,
//! which gives a total order per workflow without any locking on the
//! draft itself. Different workflows run in independent tasks.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval_at, Instant, Interval};
use uuid::Uuid;

use flowdraft_core::{
    apply_in_place, now_millis, ApplyError, EditorState, LockOutcome, Operation, OperationError, RawOperation,
    WebhookTest, WorkflowDraft,
};

use crate::broadcast::{BroadcastGroup, RoomManager, Topic};
use crate::protocol::ServerMessage;
use crate::storage::{DraftSnapshot, DraftStore, StoreError};

/// Tuning for edit sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pending requests a session queues before callers wait.
    pub mailbox_capacity: usize,
    /// Accepted operations kept in memory for incremental sync.
    pub history_limit: usize,
    /// Seconds between background flushes of a dirty draft. 0 disables.
    pub persist_interval_secs: u64,
    /// Append each accepted operation to the store's log.
    pub log_operations: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            history_limit: 1000,
            persist_interval_secs: 30,
            log_operations: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Rejected(#[from] OperationError),

    #[error("step {step_id} is locked by {locked_by}")]
    LockConflict { step_id: String, locked_by: String },

    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("session closed")]
    Closed,
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Rejected(e) => e.code(),
            SessionError::LockConflict { .. } => "lock_conflict",
            SessionError::Persistence(_) => "persistence_error",
            SessionError::Closed => "session_closed",
        }
    }
}

impl From<ApplyError> for SessionError {
    fn from(e: ApplyError) -> Self {
        SessionError::Rejected(e.into())
    }
}

/// What a (re)joining replica needs to catch up.
///
/// `FullSync` is always safe. `Incremental` and `UpToDate` assume the
/// replica holds a valid draft at the `known_seq` it reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncState {
    FullSync {
        draft: WorkflowDraft,
        editor_state: EditorState,
        seq: u64,
    },
    /// Operations after the replica's `known_seq`, up to `seq`.
    Incremental {
        seq: u64,
        operations: Vec<Operation>,
        editor_state: EditorState,
    },
    UpToDate { seq: u64, editor_state: EditorState },
}

impl SyncState {
    pub fn seq(&self) -> u64 {
        match self {
            SyncState::FullSync { seq, .. } | SyncState::Incremental { seq, .. } | SyncState::UpToDate { seq, .. } => {
                *seq
            }
        }
    }

    pub fn editor_state(&self) -> &EditorState {
        match self {
            SyncState::FullSync { editor_state, .. }
            | SyncState::Incremental { editor_state, .. }
            | SyncState::UpToDate { editor_state, .. } => editor_state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PersistOutcome {
    Persisted { seq: u64 },
    /// Nothing changed since the last flush.
    Noop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub seq: u64,
    pub persisted_seq: u64,
    pub operations_applied: u64,
    pub operations_rejected: u64,
    pub history_len: usize,
    pub locks_held: usize,
    pub dirty: bool,
}

type Reply<T> = oneshot::Sender<T>;

enum SessionCommand {
    Apply {
        op: Operation,
        reply: Reply<Result<Operation, SessionError>>,
    },
    Sync {
        known_seq: Option<u64>,
        reply: Reply<SyncState>,
    },
    AcquireLock {
        step_id: String,
        user_id: String,
        reply: Reply<LockOutcome>,
    },
    ReleaseLock {
        step_id: String,
        user_id: String,
        reply: Reply<bool>,
    },
    ReleaseUserLocks {
        user_id: String,
        reply: Reply<Vec<String>>,
    },
    StartWebhookTest {
        step_id: String,
        user_id: String,
        reply: Reply<Result<(), SessionError>>,
    },
    StopWebhookTest {
        user_id: String,
        reply: Reply<bool>,
    },
    Persist {
        reply: Option<Reply<Result<PersistOutcome, SessionError>>>,
    },
    Snapshot {
        reply: Reply<(DraftSnapshot, EditorState)>,
    },
    Stats {
        reply: Reply<SessionStats>,
    },
    Shutdown {
        reply: Reply<Result<PersistOutcome, SessionError>>,
    },
}

/// Cloneable request/response handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    workflow_id: Uuid,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Validate, apply and broadcast an operation. Returns it stamped
    /// with its sequence number. Rejections are returned here only.
    pub async fn apply_operation(&self, op: Operation) -> Result<Operation, SessionError> {
        self.request(|reply| SessionCommand::Apply { op, reply }).await?
    }

    /// Like `apply_operation`, for an operation still in wire shape.
    pub async fn apply_raw(&self, raw: RawOperation) -> Result<Operation, SessionError> {
        let op = Operation::try_from(raw).map_err(OperationError::from)?;
        self.apply_operation(op).await
    }

    pub async fn get_sync_state(&self, known_seq: Option<u64>) -> Result<SyncState, SessionError> {
        self.request(|reply| SessionCommand::Sync { known_seq, reply }).await
    }

    /// Grant the lock unless another user holds it. Re-acquiring your own
    /// lock succeeds with `AlreadyHeld` and broadcasts nothing.
    pub async fn acquire_step_lock(
        &self,
        step_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<LockOutcome, SessionError> {
        let step_id = step_id.into();
        let outcome = self
            .request(|reply| SessionCommand::AcquireLock {
                step_id: step_id.clone(),
                user_id: user_id.into(),
                reply,
            })
            .await?;
        match outcome {
            LockOutcome::Conflict { locked_by } => Err(SessionError::LockConflict { step_id, locked_by }),
            granted => Ok(granted),
        }
    }

    /// Release a lock held by `user_id`. Returns whether anything was released.
    pub async fn release_step_lock(
        &self,
        step_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<bool, SessionError> {
        self.request(|reply| SessionCommand::ReleaseLock {
            step_id: step_id.into(),
            user_id: user_id.into(),
            reply,
        })
        .await
    }

    /// Release every lock of `user_id`, returning the freed step ids.
    pub async fn release_user_locks(&self, user_id: impl Into<String>) -> Result<Vec<String>, SessionError> {
        self.request(|reply| SessionCommand::ReleaseUserLocks {
            user_id: user_id.into(),
            reply,
        })
        .await
    }

    pub async fn start_webhook_test(
        &self,
        step_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::StartWebhookTest {
            step_id: step_id.into(),
            user_id: user_id.into(),
            reply,
        })
        .await?
    }

    /// Returns whether a test was running.
    pub async fn stop_webhook_test(&self, user_id: impl Into<String>) -> Result<bool, SessionError> {
        self.request(|reply| SessionCommand::StopWebhookTest {
            user_id: user_id.into(),
            reply,
        })
        .await
    }

    /// Queue a flush without waiting for it.
    pub async fn persist(&self) -> Result<(), SessionError> {
        self.tx
            .send(SessionCommand::Persist { reply: None })
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Flush and wait for the outcome.
    pub async fn persist_sync(&self) -> Result<PersistOutcome, SessionError> {
        self.request(|reply| SessionCommand::Persist { reply: Some(reply) }).await?
    }

    /// Current draft with its sequence number, and the editor state.
    pub async fn snapshot(&self) -> Result<(DraftSnapshot, EditorState), SessionError> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        self.request(|reply| SessionCommand::Stats { reply }).await
    }

    /// Flush and stop the session.
    pub async fn shutdown(&self) -> Result<PersistOutcome, SessionError> {
        self.request(|reply| SessionCommand::Shutdown { reply }).await?
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

/// The single writer behind a `SessionHandle`.
struct EditSession {
    workflow_id: Uuid,
    draft: WorkflowDraft,
    editor_state: EditorState,
    seq: u64,
    /// Contiguous tail of accepted operations ending at `seq`.
    history: VecDeque<Operation>,
    dirty: bool,
    /// An append failed since the last snapshot, so replay would stop early.
    log_broken: bool,
    persisted_seq: u64,
    operations_applied: u64,
    operations_rejected: u64,
    store: Arc<dyn DraftStore>,
    group: Arc<BroadcastGroup>,
    config: SessionConfig,
}

impl EditSession {
    /// Rebuild the draft from its snapshot plus the logged operations
    /// after it. Replay stops at the first gap or failing operation.
    fn load(
        workflow_id: Uuid,
        store: Arc<dyn DraftStore>,
        group: Arc<BroadcastGroup>,
        config: SessionConfig,
    ) -> Result<Self, StoreError> {
        let (draft, snapshot_seq) = match store.load_draft(workflow_id)? {
            Some(snapshot) => (snapshot.draft, snapshot.seq),
            None => (WorkflowDraft::new(), 0),
        };

        let mut session = Self {
            workflow_id,
            draft,
            editor_state: EditorState::new(),
            seq: snapshot_seq,
            history: VecDeque::new(),
            dirty: false,
            log_broken: false,
            persisted_seq: snapshot_seq,
            operations_applied: 0,
            operations_rejected: 0,
            store,
            group,
            config,
        };

        let logged = session.store.load_operations_since(workflow_id, snapshot_seq)?;
        let mut replayed = 0;
        for op in logged {
            if op.seq != Some(session.seq + 1) {
                log::warn!(
                    "Workflow {workflow_id}: operation log gap after seq {} (found {:?})",
                    session.seq,
                    op.seq
                );
                break;
            }
            if let Err(e) = apply_in_place(&mut session.draft, &op.kind) {
                log::warn!("Workflow {workflow_id}: replay stopped at seq {}: {e}", session.seq + 1);
                break;
            }
            session.seq += 1;
            session.remember(op);
            replayed += 1;
        }
        session.dirty = session.seq > snapshot_seq;

        log::info!(
            "Loaded workflow {workflow_id} at seq {} ({replayed} operations replayed)",
            session.seq
        );
        Ok(session)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        let mut ticker = (self.config.persist_interval_secs > 0).then(|| {
            let period = Duration::from_secs(self.config.persist_interval_secs);
            interval_at(Instant::now() + period, period)
        });

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(SessionCommand::Shutdown { reply }) => match self.persist() {
                        Ok(outcome) => {
                            let _ = reply.send(Ok(outcome));
                            log::info!("Session {} stopped at seq {}", self.workflow_id, self.seq);
                            return;
                        }
                        Err(e) => {
                            // Keep serving so the flush can be retried.
                            log::error!("Stop of {} aborted at seq {}: {e}", self.workflow_id, self.seq);
                            let _ = reply.send(Err(e));
                        }
                    },
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = tick(&mut ticker) => {
                    if let Err(e) = self.persist() {
                        log::warn!("Periodic persist of {} failed: {e}", self.workflow_id);
                    }
                }
            }
        }

        // Every handle dropped.
        if let Err(e) = self.persist() {
            log::error!("Final persist of {} failed: {e}", self.workflow_id);
        }
        log::info!("Session {} closed at seq {}", self.workflow_id, self.seq);
    }

    fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Apply { op, reply } => {
                let _ = reply.send(self.apply(op));
            }
            SessionCommand::Sync { known_seq, reply } => {
                let _ = reply.send(self.sync_state(known_seq));
            }
            SessionCommand::AcquireLock { step_id, user_id, reply } => {
                let outcome = self.editor_state.acquire_lock(&step_id, &user_id, now_millis());
                if let LockOutcome::Acquired { acquired_at } = outcome {
                    log::debug!("Lock on {step_id} granted to {user_id}");
                    self.group.publish(ServerMessage::LockAcquired {
                        step_id,
                        user_id,
                        acquired_at,
                    });
                }
                let _ = reply.send(outcome);
            }
            SessionCommand::ReleaseLock { step_id, user_id, reply } => {
                let released = self.editor_state.release_lock(&step_id, &user_id);
                if released {
                    log::debug!("Lock on {step_id} released by {user_id}");
                    self.group.publish(ServerMessage::LockReleased { step_id });
                }
                let _ = reply.send(released);
            }
            SessionCommand::ReleaseUserLocks { user_id, reply } => {
                let freed = self.editor_state.release_user_locks(&user_id);
                for step_id in &freed {
                    self.group.publish(ServerMessage::LockReleased {
                        step_id: step_id.clone(),
                    });
                }
                if !freed.is_empty() {
                    log::info!("Released {} locks held by {user_id}", freed.len());
                }
                let _ = reply.send(freed);
            }
            SessionCommand::StartWebhookTest { step_id, user_id, reply } => {
                let result = if self.draft.has_step(&step_id) {
                    self.editor_state.webhook_test = Some(WebhookTest {
                        step_id,
                        started_by: user_id,
                        started_at: now_millis(),
                    });
                    self.publish_editor_state();
                    Ok(())
                } else {
                    Err(ApplyError::StepNotFound(step_id).into())
                };
                let _ = reply.send(result);
            }
            SessionCommand::StopWebhookTest { user_id, reply } => {
                let stopped = self.editor_state.webhook_test.take().is_some();
                if stopped {
                    log::debug!("Webhook test stopped by {user_id}");
                    self.publish_editor_state();
                }
                let _ = reply.send(stopped);
            }
            SessionCommand::Persist { reply } => {
                let outcome = self.persist();
                match reply {
                    Some(reply) => {
                        let _ = reply.send(outcome);
                    }
                    None => {
                        if let Err(e) = outcome {
                            log::warn!("Persist of {} failed: {e}", self.workflow_id);
                        }
                    }
                }
            }
            SessionCommand::Snapshot { reply } => {
                let snapshot = DraftSnapshot {
                    draft: self.draft.clone(),
                    seq: self.seq,
                };
                let _ = reply.send((snapshot, self.editor_state.clone()));
            }
            SessionCommand::Stats { reply } => {
                let _ = reply.send(SessionStats {
                    seq: self.seq,
                    persisted_seq: self.persisted_seq,
                    operations_applied: self.operations_applied,
                    operations_rejected: self.operations_rejected,
                    history_len: self.history.len(),
                    locks_held: self.editor_state.step_locks.len(),
                    dirty: self.dirty,
                });
            }
            // Handled by the run loop.
            SessionCommand::Shutdown { reply } => {
                let _ = reply.send(self.persist());
            }
        }
    }

    fn apply(&mut self, op: Operation) -> Result<Operation, SessionError> {
        let result = op
            .kind
            .validate()
            .map_err(OperationError::from)
            .and_then(|()| apply_in_place(&mut self.draft, &op.kind).map_err(OperationError::from));
        if let Err(e) = result {
            self.operations_rejected += 1;
            log::debug!("Rejected {} {} from {}: {e}", op.op_type().as_str(), op.id, op.user_id);
            return Err(e.into());
        }

        self.seq += 1;
        let applied = op.sequenced(self.seq);
        let state_changed = self.editor_state.apply_effect(&applied);
        self.dirty = true;
        self.operations_applied += 1;
        self.remember(applied.clone());

        if self.config.log_operations {
            if let Err(e) = self.store.append_operation(self.workflow_id, &applied) {
                log::warn!("Failed to log seq {} of {}: {e}", self.seq, self.workflow_id);
                self.log_broken = true;
            }
        }
        // Snapshot past the hole so a restart never replays up to it and stops.
        if self.log_broken {
            if let Err(e) = self.persist() {
                log::warn!("Snapshot of {} after a log failure failed: {e}", self.workflow_id);
            }
        }

        log::debug!("Applied {} as seq {} on {}", applied.op_type().as_str(), self.seq, self.workflow_id);
        self.group.publish(ServerMessage::OperationApplied {
            operation: applied.clone(),
        });
        if state_changed {
            self.publish_editor_state();
        }
        Ok(applied)
    }

    fn sync_state(&self, known_seq: Option<u64>) -> SyncState {
        match known_seq {
            Some(known) if known == self.seq => SyncState::UpToDate {
                seq: self.seq,
                editor_state: self.editor_state.clone(),
            },
            Some(known) if known < self.seq && self.history_covers(known) => SyncState::Incremental {
                seq: self.seq,
                operations: self
                    .history
                    .iter()
                    .filter(|op| op.seq.is_some_and(|s| s > known))
                    .cloned()
                    .collect(),
                editor_state: self.editor_state.clone(),
            },
            _ => SyncState::FullSync {
                draft: self.draft.clone(),
                editor_state: self.editor_state.clone(),
                seq: self.seq,
            },
        }
    }

    /// Whether history holds every operation after `known`.
    fn history_covers(&self, known: u64) -> bool {
        self.history
            .front()
            .and_then(|op| op.seq)
            .is_some_and(|oldest| oldest <= known + 1)
    }

    fn persist(&mut self) -> Result<PersistOutcome, SessionError> {
        if !self.dirty {
            return Ok(PersistOutcome::Noop);
        }
        let snapshot = DraftSnapshot {
            draft: self.draft.clone(),
            seq: self.seq,
        };
        let meta = self.store.save_draft(self.workflow_id, &snapshot)?;
        self.dirty = false;
        self.log_broken = false;
        self.persisted_seq = self.seq;

        match self.store.compact_operations(self.workflow_id, self.seq) {
            Ok(removed) => log::debug!("Compacted {removed} logged operations of {}", self.workflow_id),
            Err(e) => log::warn!("Compaction of {} failed: {e}", self.workflow_id),
        }
        log::info!(
            "Persisted {} at seq {} ({} bytes, {} compressed)",
            self.workflow_id,
            self.seq,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(PersistOutcome::Persisted { seq: self.seq })
    }

    fn remember(&mut self, op: Operation) {
        self.history.push_back(op);
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
    }

    fn publish_editor_state(&self) {
        self.group.publish(ServerMessage::EditorStateUpdated {
            state: self.editor_state.clone(),
        });
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Starts, finds and stops sessions, one per workflow.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
    rooms: Arc<RoomManager>,
    store: Arc<dyn DraftStore>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(rooms: Arc<RoomManager>, store: Arc<dyn DraftStore>, config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            rooms,
            store,
            config,
        }
    }

    /// Handle to the workflow's session, loading it from the store and
    /// starting it if needed.
    pub async fn get_or_start(&self, workflow_id: Uuid) -> Result<SessionHandle, SessionError> {
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(&workflow_id).filter(|h| !h.is_closed()) {
                return Ok(handle.clone());
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(&workflow_id).filter(|h| !h.is_closed()) {
            return Ok(handle.clone());
        }

        let group = self.rooms.get_or_create(Topic::Workflow(workflow_id)).await;
        let session = EditSession::load(workflow_id, self.store.clone(), group, self.config.clone())?;
        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity.max(1));
        tokio::spawn(session.run(rx));

        let handle = SessionHandle { workflow_id, tx };
        sessions.insert(workflow_id, handle.clone());
        log::info!("Started session for workflow {workflow_id}");
        Ok(handle)
    }

    pub async fn get(&self, workflow_id: Uuid) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(&workflow_id)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Flush and stop a session. The registry stays locked until it has
    /// stopped, so a concurrent `get_or_start` loads the flushed draft.
    ///
    /// If the flush fails the session keeps running and stays registered,
    /// so the caller can retry.
    pub async fn stop(&self, workflow_id: Uuid) -> Result<PersistOutcome, SessionError> {
        let mut sessions = self.sessions.write().await;
        let Some(handle) = sessions.remove(&workflow_id) else {
            return Ok(PersistOutcome::Noop);
        };
        match handle.shutdown().await {
            Ok(outcome) => Ok(outcome),
            Err(SessionError::Closed) => Ok(PersistOutcome::Noop),
            Err(e) => {
                sessions.insert(workflow_id, handle);
                Err(e)
            }
        }
    }

    /// Stop every session. Those whose flush fails stay registered.
    pub async fn stop_all(&self) {
        let mut sessions = self.sessions.write().await;
        let running: Vec<_> = sessions.drain().collect();
        for (workflow_id, handle) in running {
            match handle.shutdown().await {
                Ok(_) | Err(SessionError::Closed) => {}
                Err(e) => {
                    log::error!("Failed to stop session {workflow_id}: {e}");
                    sessions.insert(workflow_id, handle);
                }
            }
        }
    }

    pub async fn active_workflows(&self) -> Vec<Uuid> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, h)| !h.is_closed())
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.active_workflows().await.len()
    }

    pub fn store(&self) -> &Arc<dyn DraftStore> {
        &self.store
    }
}
