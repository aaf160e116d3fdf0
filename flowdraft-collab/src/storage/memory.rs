//! In-process draft store for tests and servers without a data directory.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use flowdraft_core::{now_millis, Operation};

use super::{require_seq, DraftMetadata, DraftSnapshot, DraftStore, StoreError};

#[derive(Default)]
struct Entry {
    snapshot: Option<DraftSnapshot>,
    operations: BTreeMap<u64, Operation>,
    metadata: Option<DraftMetadata>,
}

/// Keeps everything in a map. Writes can be made to fail on demand.
#[derive(Default)]
pub struct MemoryDraftStore {
    entries: Mutex<HashMap<Uuid, Entry>>,
    fail_writes: AtomicBool,
}

impl MemoryDraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write return `StoreError::Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of logged operations for a workflow.
    pub fn operation_count(&self, workflow_id: Uuid) -> usize {
        self.lock()
            .map(|entries| entries.get(&workflow_id).map_or(0, |e| e.operations.len()))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Uuid, Entry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("writes disabled".into()))
        } else {
            Ok(())
        }
    }
}

impl DraftStore for MemoryDraftStore {
    fn load_draft(&self, workflow_id: Uuid) -> Result<Option<DraftSnapshot>, StoreError> {
        Ok(self.lock()?.get(&workflow_id).and_then(|e| e.snapshot.clone()))
    }

    fn save_draft(&self, workflow_id: Uuid, snapshot: &DraftSnapshot) -> Result<DraftMetadata, StoreError> {
        self.check_writable()?;
        let size = serde_json::to_vec(&snapshot.draft)
            .map_err(|e| StoreError::Serialization(e.to_string()))?
            .len() as u64;

        let mut entries = self.lock()?;
        let entry = entries.entry(workflow_id).or_default();
        let mut meta = entry.metadata.clone().unwrap_or_else(|| DraftMetadata::new(workflow_id));
        meta.snapshot_seq = snapshot.seq;
        meta.snapshot_size = size;
        meta.compressed_size = size;
        meta.updated_at = now_millis();

        entry.snapshot = Some(snapshot.clone());
        entry.metadata = Some(meta.clone());
        Ok(meta)
    }

    fn append_operation(&self, workflow_id: Uuid, op: &Operation) -> Result<(), StoreError> {
        self.check_writable()?;
        let seq = require_seq(op)?;

        let mut entries = self.lock()?;
        let entry = entries.entry(workflow_id).or_default();
        entry.operations.insert(seq, op.clone());
        let meta = entry.metadata.get_or_insert_with(|| DraftMetadata::new(workflow_id));
        meta.last_logged_seq = meta.last_logged_seq.max(seq);
        meta.updated_at = now_millis();
        Ok(())
    }

    fn load_operations_since(&self, workflow_id: Uuid, after_seq: u64) -> Result<Vec<Operation>, StoreError> {
        let entries = self.lock()?;
        Ok(entries
            .get(&workflow_id)
            .map(|e| {
                e.operations
                    .range(after_seq.saturating_add(1)..)
                    .map(|(_, op)| op.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn compact_operations(&self, workflow_id: Uuid, up_to_seq: u64) -> Result<u64, StoreError> {
        self.check_writable()?;
        let mut entries = self.lock()?;
        let Some(entry) = entries.get_mut(&workflow_id) else {
            return Ok(0);
        };
        let before = entry.operations.len();
        entry.operations.retain(|seq, _| *seq > up_to_seq);
        Ok((before - entry.operations.len()) as u64)
    }

    fn load_metadata(&self, workflow_id: Uuid) -> Result<Option<DraftMetadata>, StoreError> {
        Ok(self.lock()?.get(&workflow_id).and_then(|e| e.metadata.clone()))
    }

    fn list_workflows(&self) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.lock()?.keys().copied().collect())
    }

    fn delete_workflow(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        self.check_writable()?;
        self.lock()?.remove(&workflow_id);
        Ok(())
    }
}
