//! JSON wire protocol between editors and the sync server.
//!
//! Every WebSocket text frame carries one message, tagged by `type`:
//!
//! ```text
//! client ──► {"type":"operation","operation":{"id":..,"type":"add_step",..}}
//! server ──► {"type":"operation_applied","operation":{..,"seq":42}}
//! ```
//!
//! Operation payloads are free-form JSON objects, so frames are JSON text
//! rather than a binary encoding.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowdraft_core::{EditorState, Operation, RawOperation};

use crate::presence::{ConnRef, Cursor, PresenceDiff, PresenceList, UserInfo};
use crate::projector::ExecutionEvent;
use crate::session::{PersistOutcome, SyncState};

/// Frames sent by an editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Must be the first frame on a connection.
    Join { workflow_id: Uuid, user: UserInfo },
    Operation { operation: RawOperation },
    AcquireLock { step_id: String },
    ReleaseLock { step_id: String },
    /// `known_seq` is the last sequence number the replica holds, if any.
    RequestSync {
        #[serde(default)]
        known_seq: Option<u64>,
    },
    UpdateCursor {
        #[serde(default)]
        cursor: Option<Cursor>,
    },
    UpdateSelection { step_ids: Vec<String> },
    UpdateFocus { step_id: String },
    ClearFocus,
    UpdateDragging { step_ids: Vec<String> },
    ListPresence,
    WatchExecution { execution_id: Uuid },
    UnwatchExecution,
    StartWebhookTest { step_id: String },
    StopWebhookTest,
    Persist,
    Ping,
}

/// Frames sent by the server, either broadcast on a topic or addressed
/// to a single connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Joined {
        conn_ref: ConnRef,
        workflow_id: Uuid,
        user_id: String,
    },
    OperationApplied { operation: Operation },
    EditorStateUpdated { state: EditorState },
    LockAcquired {
        step_id: String,
        user_id: String,
        acquired_at: u64,
    },
    LockReleased { step_id: String },
    SyncState { state: SyncState },
    OperationRejected {
        operation_id: String,
        code: String,
        message: String,
    },
    LockDenied { step_id: String, locked_by: String },
    PresenceDiff { diff: PresenceDiff },
    PresenceList { users: PresenceList },
    WatchingExecution { execution_id: Uuid },
    Execution { event: ExecutionEvent },
    Persisted { outcome: PersistOutcome },
    Pong,
    Error { code: String, message: String },
}

/// Wire-level failures.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ProtocolError::Transport(e.to_string())
    }
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }

    /// Wrap a validated operation for sending.
    pub fn operation(op: Operation) -> Self {
        ClientMessage::Operation { operation: op.into() }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}
