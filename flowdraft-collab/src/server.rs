//! WebSocket server hosting one edit session per workflow.
//!
//! Architecture:
//! ```text
//! Editor A ──┐                                  ┌── SessionRegistry ── EditSession (workflow)
//!            ├── connection task ── dispatch ───┤                           │
//! Editor B ──┘        ▲                         └── PresenceTracker         ├── DraftStore
//!                     │                                                     │     (RocksDB / memory)
//!                     └──── workflow topic ◄────────────────────────────────┘
//!                     └──── execution topic ◄── ExecutionPublisher ◄── engine
//! ```
//!
//! The first frame of a connection must be `join`. Replies that concern
//! only the requester (rejections, denied locks, sync states) go straight
//! back on its socket. Everything else reaches it through the topics it
//! subscribes to, its own broadcasts included.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use flowdraft_core::LockOutcome;

use crate::broadcast::{BroadcastGroup, RoomManager, Topic};
use crate::presence::{ConnRef, PresenceTracker, UserInfo};
use crate::projector::ExecutionPublisher;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::session::{SessionConfig, SessionError, SessionHandle, SessionRegistry};
use crate::storage::{DraftStore, MemoryDraftStore, RocksDraftStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Connections allowed on one workflow
    pub max_connections_per_workflow: usize,
    /// Broadcast channel capacity per topic
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Free a user's step locks when their last connection closes
    pub release_locks_on_disconnect: bool,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_connections_per_workflow: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
            release_locks_on_disconnect: true,
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid { key: String, value: String, reason: String },
}

impl ServerConfig {
    /// Read `FLOWDRAFT_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let session = SessionConfig {
            mailbox_capacity: parse(&lookup, "FLOWDRAFT_MAILBOX_CAPACITY", defaults.session.mailbox_capacity)?,
            history_limit: parse(&lookup, "FLOWDRAFT_HISTORY_LIMIT", defaults.session.history_limit)?,
            persist_interval_secs: parse(
                &lookup,
                "FLOWDRAFT_PERSIST_INTERVAL_SECS",
                defaults.session.persist_interval_secs,
            )?,
            log_operations: parse(&lookup, "FLOWDRAFT_LOG_OPERATIONS", defaults.session.log_operations)?,
        };

        Ok(Self {
            bind_addr: lookup("FLOWDRAFT_BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_connections_per_workflow: parse(
                &lookup,
                "FLOWDRAFT_MAX_CONNECTIONS_PER_WORKFLOW",
                defaults.max_connections_per_workflow,
            )?,
            broadcast_capacity: parse(&lookup, "FLOWDRAFT_BROADCAST_CAPACITY", defaults.broadcast_capacity)?,
            heartbeat_interval_secs: parse(
                &lookup,
                "FLOWDRAFT_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval_secs,
            )?,
            storage_path: lookup("FLOWDRAFT_STORAGE_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            release_locks_on_disconnect: parse(
                &lookup,
                "FLOWDRAFT_RELEASE_LOCKS_ON_DISCONNECT",
                defaults.release_locks_on_disconnect,
            )?,
            session,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            reason: e.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<tungstenite::Error> for ServerError {
    fn from(e: tungstenite::Error) -> Self {
        ServerError::Protocol(e.into())
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_operations: u64,
    pub lock_conflicts: u64,
    /// Full syncs sent to connections that fell behind their topic.
    pub lagged_resyncs: u64,
    pub active_workflows: usize,
}

/// Everything a connection task needs.
#[derive(Clone)]
struct ServerContext {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    presence: Arc<PresenceTracker>,
    sessions: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

/// The sync server.
pub struct SyncServer {
    ctx: ServerContext,
    shutdown: watch::Sender<bool>,
}

impl SyncServer {
    /// Create a server, opening RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn DraftStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksDraftStore::open(store_config)?)
            }
            None => Arc::new(MemoryDraftStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server on top of an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn DraftStore>) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        let presence = Arc::new(PresenceTracker::new(rooms.clone()));
        let sessions = Arc::new(SessionRegistry::new(rooms.clone(), store, config.session.clone()));
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx: ServerContext {
                config,
                rooms,
                presence,
                sessions,
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
            shutdown,
        }
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryDraftStore::new()))
    }

    /// Accept WebSocket connections until `shutdown` is called.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.ctx.config.bind_addr);

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, ctx).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => break,
            }
        }
        log::info!("Sync server on {} stopped accepting", self.ctx.config.bind_addr);
        Ok(())
    }

    /// Stop accepting connections and flush every session.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.ctx.sessions.stop_all().await;
        log::info!("All sessions stopped");
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.ctx.stats.read().await.clone();
        stats.active_workflows = self.ctx.sessions.session_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.ctx.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    /// Entry point for the execution engine's events.
    pub fn execution_publisher(&self) -> ExecutionPublisher {
        ExecutionPublisher::new(self.ctx.rooms.clone())
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.ctx.sessions
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.ctx.presence
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.ctx.rooms
    }
}

/// A connection that has joined a workflow.
struct Joined {
    workflow_id: Uuid,
    user: UserInfo,
    session: SessionHandle,
    group: Arc<BroadcastGroup>,
}

/// Per-connection state.
struct Peer {
    conn_ref: ConnRef,
    addr: SocketAddr,
    joined: Option<Joined>,
    workflow_rx: Option<Receiver<Arc<ServerMessage>>>,
    watching: Option<(Uuid, Arc<BroadcastGroup>)>,
    execution_rx: Option<Receiver<Arc<ServerMessage>>>,
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: ServerContext) -> Result<(), ServerError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    log::info!("WebSocket connection established from {addr}");
    {
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut peer = Peer {
        conn_ref: ConnRef::new(),
        addr,
        joined: None,
        workflow_rx: None,
        watching: None,
        execution_rx: None,
    };
    let result = serve(ws_stream, &mut peer, &ctx).await;
    cleanup(&mut peer, &ctx).await;

    {
        let mut s = ctx.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    result
}

async fn serve(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    peer: &mut Peer,
    ctx: &ServerContext,
) -> Result<(), ServerError> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let period = Duration::from_secs(ctx.config.heartbeat_interval_secs.max(1));
    let mut heartbeat = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    {
                        let mut s = ctx.stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += text.len() as u64;
                    }
                    let replies = match ClientMessage::decode(text.as_str()) {
                        Ok(msg) => dispatch(peer, ctx, msg).await,
                        Err(e) => {
                            log::warn!("Bad frame from {}: {e}", peer.addr);
                            vec![ServerMessage::error("invalid_frame", e.to_string())]
                        }
                    };
                    for reply in &replies {
                        send(&mut ws_sender, reply).await?;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    send(&mut ws_sender, &ServerMessage::error("invalid_frame", "binary frames are not supported")).await?;
                }
                Some(Ok(Message::Ping(data))) => {
                    ws_sender.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Connection closed from {}", peer.addr);
                    break;
                }
                Some(Err(e)) => {
                    log::warn!("WebSocket error from {}: {e}", peer.addr);
                    break;
                }
                Some(Ok(_)) => {}
            },

            msg = recv_from(&mut peer.workflow_rx) => match msg {
                Ok(msg) => send(&mut ws_sender, &msg).await?,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Connection {} lagged by {skipped} messages, sending full sync", peer.conn_ref);
                    if let Some(reply) = resync_lagged(peer, ctx, skipped).await {
                        send(&mut ws_sender, &reply).await?;
                    }
                }
                Err(RecvError::Closed) => peer.workflow_rx = None,
            },

            msg = recv_from(&mut peer.execution_rx) => match msg {
                Ok(msg) => send(&mut ws_sender, &msg).await?,
                Err(RecvError::Lagged(skipped)) => {
                    // Execution events have no backlog; the viewer reloads a snapshot.
                    if let Some((_, group)) = &peer.watching {
                        group.record_lag(skipped);
                    }
                    log::warn!("Execution watcher {} lagged by {skipped} events", peer.conn_ref);
                }
                Err(RecvError::Closed) => peer.execution_rx = None,
            },

            _ = heartbeat.tick() => {
                ws_sender.send(Message::Ping(Vec::new().into())).await?;
            }
        }
    }
    Ok(())
}

async fn recv_from(rx: &mut Option<Receiver<Arc<ServerMessage>>>) -> Result<Arc<ServerMessage>, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn send<S>(sink: &mut S, msg: &ServerMessage) -> Result<(), ServerError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = msg.encode()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn resync_lagged(peer: &mut Peer, ctx: &ServerContext, skipped: u64) -> Option<ServerMessage> {
    let joined = peer.joined.as_mut()?;
    joined.group.record_lag(skipped);
    ctx.stats.write().await.lagged_resyncs += 1;
    let session = live_session(joined, ctx).await.ok()?;
    match session.get_sync_state(None).await {
        Ok(state) => Some(ServerMessage::SyncState { state }),
        Err(e) => Some(ServerMessage::error(e.code(), e.to_string())),
    }
}

/// The joined workflow's session, restarted if a supervisor stopped it.
async fn live_session(joined: &mut Joined, ctx: &ServerContext) -> Result<SessionHandle, SessionError> {
    if joined.session.is_closed() {
        joined.session = ctx.sessions.get_or_start(joined.workflow_id).await?;
    }
    Ok(joined.session.clone())
}

/// Handle one client frame, returning the replies for this connection only.
async fn dispatch(peer: &mut Peer, ctx: &ServerContext, msg: ClientMessage) -> Vec<ServerMessage> {
    match msg {
        ClientMessage::Ping => return vec![ServerMessage::Pong],
        ClientMessage::Join { workflow_id, user } => return join(peer, ctx, workflow_id, user).await,
        _ => {}
    }

    let conn_ref = peer.conn_ref;
    let Some(joined) = peer.joined.as_mut() else {
        return vec![ServerMessage::error("not_joined", "the first frame must be join")];
    };
    let workflow_id = joined.workflow_id;
    let user_id = joined.user.id.clone();
    let session = match live_session(joined, ctx).await {
        Ok(session) => session,
        Err(e) => return vec![ServerMessage::error(e.code(), e.to_string())],
    };

    match msg {
        ClientMessage::Operation { mut operation } => {
            // The joined identity wins over whatever the frame claims.
            operation.user_id = user_id;
            let operation_id = operation.id.clone();
            match session.apply_raw(operation).await {
                Ok(_) => vec![],
                Err(e) => {
                    ctx.stats.write().await.rejected_operations += 1;
                    log::debug!("Operation {operation_id} rejected: {e}");
                    vec![ServerMessage::OperationRejected {
                        operation_id,
                        code: e.code().to_string(),
                        message: e.to_string(),
                    }]
                }
            }
        }

        ClientMessage::AcquireLock { step_id } => match session.acquire_step_lock(step_id.clone(), user_id.clone()).await {
            Ok(LockOutcome::AlreadyHeld { acquired_at }) => vec![ServerMessage::LockAcquired {
                step_id,
                user_id,
                acquired_at,
            }],
            Ok(_) => vec![],
            Err(SessionError::LockConflict { step_id, locked_by }) => {
                ctx.stats.write().await.lock_conflicts += 1;
                vec![ServerMessage::LockDenied { step_id, locked_by }]
            }
            Err(e) => vec![ServerMessage::error(e.code(), e.to_string())],
        },

        ClientMessage::ReleaseLock { step_id } => match session.release_step_lock(step_id, user_id).await {
            Ok(_) => vec![],
            Err(e) => vec![ServerMessage::error(e.code(), e.to_string())],
        },

        ClientMessage::RequestSync { known_seq } => match session.get_sync_state(known_seq).await {
            Ok(state) => vec![ServerMessage::SyncState { state }],
            Err(e) => vec![ServerMessage::error(e.code(), e.to_string())],
        },

        ClientMessage::UpdateCursor { cursor } => {
            ctx.presence.update_cursor(workflow_id, conn_ref, cursor).await;
            vec![]
        }
        ClientMessage::UpdateSelection { step_ids } => {
            ctx.presence.update_selection(workflow_id, conn_ref, step_ids).await;
            vec![]
        }
        ClientMessage::UpdateFocus { step_id } => {
            ctx.presence.update_focus(workflow_id, conn_ref, step_id).await;
            vec![]
        }
        ClientMessage::ClearFocus => {
            ctx.presence.clear_focus(workflow_id, conn_ref).await;
            vec![]
        }
        ClientMessage::UpdateDragging { step_ids } => {
            ctx.presence.update_dragging(workflow_id, conn_ref, step_ids).await;
            vec![]
        }
        ClientMessage::ListPresence => vec![ServerMessage::PresenceList {
            users: ctx.presence.list_users(workflow_id).await,
        }],

        ClientMessage::WatchExecution { execution_id } => {
            unwatch(peer, ctx).await;
            let group = ctx.rooms.get_or_create(Topic::Execution(execution_id)).await;
            peer.execution_rx = Some(group.add_peer(conn_ref, user_id).await);
            peer.watching = Some((execution_id, group));
            log::debug!("Connection {conn_ref} watching execution {execution_id}");
            vec![ServerMessage::WatchingExecution { execution_id }]
        }
        ClientMessage::UnwatchExecution => {
            unwatch(peer, ctx).await;
            vec![]
        }

        ClientMessage::StartWebhookTest { step_id } => match session.start_webhook_test(step_id, user_id).await {
            Ok(()) => vec![],
            Err(e) => vec![ServerMessage::error(e.code(), e.to_string())],
        },
        ClientMessage::StopWebhookTest => match session.stop_webhook_test(user_id).await {
            Ok(_) => vec![],
            Err(e) => vec![ServerMessage::error(e.code(), e.to_string())],
        },

        ClientMessage::Persist => match session.persist_sync().await {
            Ok(outcome) => vec![ServerMessage::Persisted { outcome }],
            Err(e) => {
                log::error!("Persist of workflow {workflow_id} failed: {e}");
                vec![ServerMessage::error(e.code(), e.to_string())]
            }
        },

        ClientMessage::Ping | ClientMessage::Join { .. } => vec![],
    }
}

async fn join(peer: &mut Peer, ctx: &ServerContext, workflow_id: Uuid, user: UserInfo) -> Vec<ServerMessage> {
    if peer.joined.is_some() {
        return vec![ServerMessage::error("already_joined", "connection already joined a workflow")];
    }
    if user.id.trim().is_empty() {
        return vec![ServerMessage::error("invalid_user", "user id must not be empty")];
    }

    let topic = Topic::Workflow(workflow_id);
    let group = ctx.rooms.get_or_create(topic).await;
    if group.peer_count().await >= ctx.config.max_connections_per_workflow {
        log::warn!("Workflow {workflow_id} is full, refusing {}", user.id);
        return vec![ServerMessage::error("workflow_full", "too many connections on this workflow")];
    }

    // Subscribe before reading the sync state so no broadcast falls in between.
    let rx = group.add_peer(peer.conn_ref, user.id.clone()).await;
    let sync = match ctx.sessions.get_or_start(workflow_id).await {
        Ok(session) => session.get_sync_state(None).await.map(|state| (session, state)),
        Err(e) => Err(e),
    };
    let (session, state) = match sync {
        Ok(ok) => ok,
        Err(e) => {
            log::error!("Cannot open workflow {workflow_id}: {e}");
            group.remove_peer(&peer.conn_ref).await;
            ctx.rooms.remove_if_empty(topic).await;
            return vec![ServerMessage::error(e.code(), e.to_string())];
        }
    };

    ctx.presence.track_user(workflow_id, user.clone(), peer.conn_ref).await;
    log::info!("{} ({}) joined workflow {workflow_id} at seq {}", user.name, user.id, state.seq());

    let replies = vec![
        ServerMessage::Joined {
            conn_ref: peer.conn_ref,
            workflow_id,
            user_id: user.id.clone(),
        },
        ServerMessage::SyncState { state },
    ];
    peer.workflow_rx = Some(rx);
    peer.joined = Some(Joined {
        workflow_id,
        user,
        session,
        group,
    });
    replies
}

async fn unwatch(peer: &mut Peer, ctx: &ServerContext) {
    peer.execution_rx = None;
    if let Some((execution_id, group)) = peer.watching.take() {
        group.remove_peer(&peer.conn_ref).await;
        ctx.rooms.remove_if_empty(Topic::Execution(execution_id)).await;
    }
}

/// Undo everything the connection registered. The last connection of a
/// user frees their locks, the last connection of a workflow stops its
/// session.
async fn cleanup(peer: &mut Peer, ctx: &ServerContext) {
    unwatch(peer, ctx).await;
    peer.workflow_rx = None;

    let Some(mut joined) = peer.joined.take() else {
        return;
    };
    let workflow_id = joined.workflow_id;
    joined.group.remove_peer(&peer.conn_ref).await;
    ctx.presence.untrack(workflow_id, peer.conn_ref).await;

    if ctx.config.release_locks_on_disconnect && joined.group.connections_of(&joined.user.id).await == 0 {
        if let Ok(session) = live_session(&mut joined, ctx).await {
            if let Err(e) = session.release_user_locks(joined.user.id.clone()).await {
                log::warn!("Could not release locks of {}: {e}", joined.user.id);
            }
        }
    }

    if joined.group.peer_count().await == 0 {
        match ctx.sessions.stop(workflow_id).await {
            Ok(outcome) => {
                log::info!("Workflow {workflow_id} closed ({outcome:?})");
                ctx.rooms.remove_if_empty(Topic::Workflow(workflow_id)).await;
            }
            // The session still publishes to this room, so it stays.
            Err(e) => log::error!("Workflow {workflow_id} kept open, flush failed: {e}"),
        }
    }
    log::info!("{} left workflow {workflow_id}", joined.user.id);
}
