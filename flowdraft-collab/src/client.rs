//! WebSocket sync client for editors.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Optimistic local edits on a `Replica`, reconciled against broadcasts
//! - Presence that refetches the full list on every diff
//! - A live execution board fed by watched execution events
//! - Offline queue for edits made while disconnected

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use flowdraft_core::{ApplyError, EditorState, Operation, OperationKind, WorkflowDraft};

use crate::presence::{ConnRef, Cursor, PresenceEntry, PresenceView, UserInfo};
use crate::projector::{ExecutionProjector, StepExecutionState};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::replica::{Replica, ReplicaAction};
use crate::session::PersistOutcome;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Socket open, join sent
    Connected,
    /// Connection lost
    Disconnected,
    /// The server accepted the join
    Joined { conn_ref: ConnRef },
    /// The replica caught up to `seq`
    Synced { seq: u64 },
    /// A broadcast operation was applied
    DraftChanged { seq: u64 },
    EditorStateChanged,
    OperationRejected {
        operation_id: String,
        code: String,
        message: String,
    },
    LockAcquired { step_id: String, user_id: String },
    LockReleased { step_id: String },
    LockDenied { step_id: String, locked_by: String },
    /// Fresh flattened presence list
    PresenceChanged(Vec<PresenceEntry>),
    ExecutionUpdated {
        execution_id: Uuid,
        step_id: Option<String>,
    },
    Persisted(PersistOutcome),
    Pong,
    ServerError { code: String, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("local edit does not apply: {0}")]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("offline queue is full")]
    QueueFull,
}

/// Offline queue for edits made while disconnected.
///
/// Queued operations are sent again right after the next join.
pub struct OfflineQueue {
    queue: VecDeque<Operation>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns false when the queue is full.
    pub fn enqueue(&mut self, op: Operation) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(op);
        true
    }

    pub fn drain(&mut self) -> Vec<Operation> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Everything an editor derives from server messages.
pub struct ClientState {
    pub replica: Replica,
    pub presence: PresenceView,
    pub projector: ExecutionProjector,
}

impl ClientState {
    /// State for `user_id`, who is left out of the presence list.
    pub fn new(user_id: &str) -> Self {
        Self {
            replica: Replica::new(user_id),
            presence: PresenceView::excluding(user_id),
            projector: ExecutionProjector::new(),
        }
    }

    /// Fold one server message. Returns the frames to send back and the
    /// events to surface to the application.
    pub fn handle(&mut self, msg: &ServerMessage) -> (Vec<ClientMessage>, Vec<SyncEvent>) {
        let mut followups = Vec::new();
        let mut events = Vec::new();

        match msg {
            ServerMessage::Joined { conn_ref, .. } => {
                events.push(SyncEvent::Joined { conn_ref: *conn_ref });
                followups.push(ClientMessage::ListPresence);
            }
            ServerMessage::SyncState { state } => match self.replica.apply_sync_state(state.clone()) {
                ReplicaAction::RequestSync => followups.push(self.sync_request()),
                ReplicaAction::None => events.push(SyncEvent::Synced {
                    seq: self.replica.seq(),
                }),
            },
            ServerMessage::OperationApplied { operation } => {
                match self.replica.handle_operation_applied(operation) {
                    ReplicaAction::RequestSync => followups.push(self.sync_request()),
                    ReplicaAction::None => events.push(SyncEvent::DraftChanged {
                        seq: self.replica.seq(),
                    }),
                }
            }
            ServerMessage::EditorStateUpdated { state } => {
                self.replica.handle_editor_state(state.clone());
                events.push(SyncEvent::EditorStateChanged);
            }
            ServerMessage::LockAcquired {
                step_id,
                user_id,
                acquired_at,
            } => {
                self.replica.handle_lock_acquired(step_id, user_id, *acquired_at);
                events.push(SyncEvent::LockAcquired {
                    step_id: step_id.clone(),
                    user_id: user_id.clone(),
                });
            }
            ServerMessage::LockReleased { step_id } => {
                self.replica.handle_lock_released(step_id);
                events.push(SyncEvent::LockReleased {
                    step_id: step_id.clone(),
                });
            }
            ServerMessage::OperationRejected {
                operation_id,
                code,
                message,
            } => {
                if self.replica.handle_rejected(operation_id) == ReplicaAction::RequestSync {
                    followups.push(self.sync_request());
                }
                events.push(SyncEvent::OperationRejected {
                    operation_id: operation_id.clone(),
                    code: code.clone(),
                    message: message.clone(),
                });
            }
            ServerMessage::LockDenied { step_id, locked_by } => events.push(SyncEvent::LockDenied {
                step_id: step_id.clone(),
                locked_by: locked_by.clone(),
            }),
            ServerMessage::PresenceDiff { diff } => {
                self.presence.handle_diff(diff);
                followups.push(ClientMessage::ListPresence);
            }
            ServerMessage::PresenceList { users } => {
                let entries = self.presence.apply_list(users).to_vec();
                events.push(SyncEvent::PresenceChanged(entries));
            }
            ServerMessage::WatchingExecution { execution_id } => {
                self.projector.select_execution(*execution_id);
                events.push(SyncEvent::ExecutionUpdated {
                    execution_id: *execution_id,
                    step_id: None,
                });
            }
            ServerMessage::Execution { event } => {
                if self.projector.apply(event) {
                    events.push(SyncEvent::ExecutionUpdated {
                        execution_id: event.execution_id(),
                        step_id: event.step_id().map(str::to_string),
                    });
                }
            }
            ServerMessage::Persisted { outcome } => events.push(SyncEvent::Persisted(*outcome)),
            ServerMessage::Pong => events.push(SyncEvent::Pong),
            ServerMessage::Error { code, message } => {
                log::warn!("Server error {code}: {message}");
                events.push(SyncEvent::ServerError {
                    code: code.clone(),
                    message: message.clone(),
                });
            }
        }

        (followups, events)
    }

    fn sync_request(&self) -> ClientMessage {
        ClientMessage::RequestSync {
            known_seq: self.replica.sync_request(),
        }
    }
}

/// The sync client.
///
/// Owns a WebSocket connection to one workflow, the local replica, the
/// presence view and the execution board.
pub struct SyncClient {
    user: UserInfo,
    workflow_id: Uuid,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    shared: Arc<Mutex<ClientState>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    outgoing_tx: Option<mpsc::Sender<ClientMessage>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(user: UserInfo, workflow_id: Uuid, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let shared = ClientState::new(&user.id);
        Self {
            user,
            workflow_id,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            shared: Arc::new(Mutex::new(shared)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the workflow and replay queued edits.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                log::warn!("Cannot reach {}: {e}", self.server_url);
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match msg.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("Dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        out_tx
            .send(ClientMessage::Join {
                workflow_id: self.workflow_id,
                user: self.user.clone(),
            })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        // Replay offline queue behind the join
        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued operations", queued.len());
            for op in queued {
                out_tx
                    .send(ClientMessage::operation(op))
                    .await
                    .map_err(|_| ProtocolError::ConnectionClosed)?;
            }
        }

        // The reader only holds a weak sender so `disconnect` can close the writer.
        let followup_tx = out_tx.downgrade();
        self.outgoing_tx = Some(out_tx);
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: fold incoming messages into the shared state
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let msg = match ServerMessage::decode(text.as_str()) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("Ignoring bad frame from server: {e}");
                                continue;
                            }
                        };
                        let (followups, events) = shared.lock().await.handle(&msg);
                        if let Some(tx) = followup_tx.upgrade() {
                            for followup in followups {
                                let _ = tx.send(followup).await;
                            }
                        }
                        for event in events {
                            let _ = event_tx.send(event).await;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. Edits made afterwards are queued.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Apply an edit locally and send it, or queue it while offline.
    pub async fn propose(&self, kind: OperationKind) -> Result<Operation, ClientError> {
        let op = self.shared.lock().await.replica.propose(kind)?;

        if self.connection_state().await == ConnectionState::Connected {
            if let Some(tx) = &self.outgoing_tx {
                if tx.send(ClientMessage::operation(op.clone())).await.is_ok() {
                    return Ok(op);
                }
            }
        }
        if !self.offline_queue.lock().await.enqueue(op.clone()) {
            return Err(ClientError::QueueFull);
        }
        log::debug!("Queued operation {} while offline", op.id);
        Ok(op)
    }

    pub async fn acquire_lock(&self, step_id: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(ClientMessage::AcquireLock { step_id: step_id.into() }).await
    }

    pub async fn release_lock(&self, step_id: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(ClientMessage::ReleaseLock { step_id: step_id.into() }).await
    }

    /// Ask the server to catch the replica up.
    pub async fn request_sync(&self) -> Result<(), ProtocolError> {
        let known_seq = self.shared.lock().await.replica.sync_request();
        self.send(ClientMessage::RequestSync { known_seq }).await
    }

    pub async fn update_cursor(&self, x: f64, y: f64) -> Result<(), ProtocolError> {
        self.send(ClientMessage::UpdateCursor {
            cursor: Some(Cursor::new(x, y)),
        })
        .await
    }

    pub async fn update_selection(&self, step_ids: Vec<String>) -> Result<(), ProtocolError> {
        self.send(ClientMessage::UpdateSelection { step_ids }).await
    }

    pub async fn update_focus(&self, step_id: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(ClientMessage::UpdateFocus { step_id: step_id.into() }).await
    }

    pub async fn clear_focus(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::ClearFocus).await
    }

    pub async fn update_dragging(&self, step_ids: Vec<String>) -> Result<(), ProtocolError> {
        self.send(ClientMessage::UpdateDragging { step_ids }).await
    }

    pub async fn list_presence(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::ListPresence).await
    }

    pub async fn watch_execution(&self, execution_id: Uuid) -> Result<(), ProtocolError> {
        self.send(ClientMessage::WatchExecution { execution_id }).await
    }

    pub async fn unwatch_execution(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::UnwatchExecution).await
    }

    pub async fn start_webhook_test(&self, step_id: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(ClientMessage::StartWebhookTest { step_id: step_id.into() }).await
    }

    pub async fn stop_webhook_test(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::StopWebhookTest).await
    }

    pub async fn persist(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Persist).await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping).await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// The draft as this editor sees it.
    pub async fn draft(&self) -> WorkflowDraft {
        self.shared.lock().await.replica.draft().clone()
    }

    pub async fn editor_state(&self) -> EditorState {
        self.shared.lock().await.replica.editor_state().clone()
    }

    pub async fn seq(&self) -> u64 {
        self.shared.lock().await.replica.seq()
    }

    pub async fn pending_count(&self) -> usize {
        self.shared.lock().await.replica.pending().len()
    }

    pub async fn presence(&self) -> Vec<PresenceEntry> {
        self.shared.lock().await.presence.entries().to_vec()
    }

    pub async fn execution_step(&self, step_id: &str) -> Option<StepExecutionState> {
        self.shared.lock().await.projector.step(step_id).cloned()
    }

    pub async fn execution_steps(&self) -> BTreeMap<String, StepExecutionState> {
        self.shared.lock().await.projector.steps().clone()
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx.send(msg).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}
