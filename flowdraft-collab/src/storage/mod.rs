//! Durable draft storage.
//!
//! ```text
//! EditSession ── append_operation(op, seq) ──► operation log
//!      │
//!      └──────── save_draft(draft @ seq) ────► snapshot ──► compact log ≤ seq
//!
//! on start:  load_draft() + load_operations_since(snapshot.seq)  ⇒  draft @ seq
//! ```
//!
//! Snapshots and log entries are JSON, LZ4 compressed. Metadata records
//! are bincode.

pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowdraft_core::{now_millis, Operation, WorkflowDraft};

pub use memory::MemoryDraftStore;
pub use rocks::{RocksDraftStore, StoreConfig};

/// A draft as of sequence number `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftSnapshot {
    pub draft: WorkflowDraft,
    pub seq: u64,
}

/// Bookkeeping kept next to each workflow's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftMetadata {
    pub workflow_id: Uuid,
    /// Sequence number of the stored snapshot.
    pub snapshot_seq: u64,
    /// Highest sequence number in the operation log.
    pub last_logged_seq: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DraftMetadata {
    pub fn new(workflow_id: Uuid) -> Self {
        let now = now_millis();
        Self {
            workflow_id,
            snapshot_seq: 0,
            last_logged_seq: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("operation {0} has no sequence number")]
    Unsequenced(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Persistence collaborator for edit sessions.
///
/// Calls are synchronous; each session serialises its own calls, so a
/// store only needs to tolerate different workflows in parallel.
pub trait DraftStore: Send + Sync {
    /// Latest snapshot, if the workflow was ever persisted.
    fn load_draft(&self, workflow_id: Uuid) -> Result<Option<DraftSnapshot>, StoreError>;

    /// Replace the snapshot.
    fn save_draft(&self, workflow_id: Uuid, snapshot: &DraftSnapshot) -> Result<DraftMetadata, StoreError>;

    /// Append an accepted operation. `op.seq` must be set.
    fn append_operation(&self, workflow_id: Uuid, op: &Operation) -> Result<(), StoreError>;

    /// Logged operations with `seq > after_seq`, in order.
    fn load_operations_since(&self, workflow_id: Uuid, after_seq: u64) -> Result<Vec<Operation>, StoreError>;

    /// Drop logged operations with `seq <= up_to_seq`. Returns how many.
    fn compact_operations(&self, workflow_id: Uuid, up_to_seq: u64) -> Result<u64, StoreError>;

    fn load_metadata(&self, workflow_id: Uuid) -> Result<Option<DraftMetadata>, StoreError>;

    fn list_workflows(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Remove the snapshot, log and metadata of a workflow.
    fn delete_workflow(&self, workflow_id: Uuid) -> Result<(), StoreError>;
}

pub(crate) fn encode_compressed<T: Serialize>(value: &T) -> Result<(Vec<u8>, usize), StoreError> {
    let json = serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok((lz4_flex::compress_prepend_size(&json), json.len()))
}

pub(crate) fn decode_compressed<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes).map_err(|e| StoreError::Compression(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))
}

pub(crate) fn require_seq(op: &Operation) -> Result<u64, StoreError> {
    op.seq.ok_or_else(|| StoreError::Unsequenced(op.id.clone()))
}
