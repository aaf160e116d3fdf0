//! RocksDB-backed draft store.
//!
//! Column families:
//! - `drafts`    : draft snapshots, keyed by workflow id (JSON, LZ4)
//! - `operations`: operation log, keyed by `workflow_id:seq` (JSON, LZ4)
//! - `metadata`  : per-workflow bookkeeping, keyed by workflow id (bincode)

use std::path::{Path, PathBuf};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Direction, IteratorMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use uuid::Uuid;

use flowdraft_core::{now_millis, Operation};

use super::{
    decode_compressed, encode_compressed, require_seq, DraftMetadata, DraftSnapshot, DraftStore, StoreError,
};

const CF_DRAFTS: &str = "drafts";
const CF_OPERATIONS: &str = "operations";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DRAFTS, CF_OPERATIONS, CF_METADATA];

/// Length of an operation-log key: 16 byte workflow id + 8 byte seq.
const OP_KEY_LEN: usize = 24;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes.
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync every write batch.
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family.
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("flowdraft_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

pub struct RocksDraftStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksDraftStore {
    /// Open or create the database and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, descriptors)?;
        log::info!("Opened draft store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are LZ4 already.
            CF_DRAFTS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPERATIONS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn op_key(workflow_id: Uuid, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(OP_KEY_LEN);
        key.extend_from_slice(workflow_id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn seq_of(key: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[16..OP_KEY_LEN]);
        u64::from_be_bytes(buf)
    }

    /// Keys of logged operations for `workflow_id` with `from <= seq <= to`.
    fn op_keys(&self, workflow_id: Uuid, from: u64, to: u64) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let start = Self::op_key(workflow_id, from);
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, _) = item?;
            if key.len() != OP_KEY_LEN || &key[..16] != workflow_id.as_bytes() || Self::seq_of(&key) > to {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn read_metadata(&self, workflow_id: Uuid) -> Result<Option<DraftMetadata>, StoreError> {
        match self.db.get_cf(self.cf(CF_METADATA)?, workflow_id.as_bytes())? {
            Some(bytes) => DraftMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

impl DraftStore for RocksDraftStore {
    fn load_draft(&self, workflow_id: Uuid) -> Result<Option<DraftSnapshot>, StoreError> {
        match self.db.get_cf(self.cf(CF_DRAFTS)?, workflow_id.as_bytes())? {
            Some(bytes) => decode_compressed(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn save_draft(&self, workflow_id: Uuid, snapshot: &DraftSnapshot) -> Result<DraftMetadata, StoreError> {
        let (compressed, raw_len) = encode_compressed(snapshot)?;

        let mut meta = self.read_metadata(workflow_id)?.unwrap_or_else(|| DraftMetadata::new(workflow_id));
        meta.snapshot_seq = snapshot.seq;
        meta.snapshot_size = raw_len as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_millis();

        // Snapshot and metadata land together or not at all.
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DRAFTS)?, workflow_id.as_bytes(), &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, workflow_id.as_bytes(), meta.encode()?);
        self.write(batch)?;

        log::debug!(
            "Saved snapshot of {workflow_id} at seq {} ({} -> {} bytes)",
            snapshot.seq,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    fn append_operation(&self, workflow_id: Uuid, op: &Operation) -> Result<(), StoreError> {
        let seq = require_seq(op)?;
        let (compressed, _) = encode_compressed(op)?;

        let mut meta = self.read_metadata(workflow_id)?.unwrap_or_else(|| DraftMetadata::new(workflow_id));
        meta.last_logged_seq = meta.last_logged_seq.max(seq);
        meta.updated_at = now_millis();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_OPERATIONS)?, Self::op_key(workflow_id, seq), &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, workflow_id.as_bytes(), meta.encode()?);
        self.write(batch)
    }

    fn load_operations_since(&self, workflow_id: Uuid, after_seq: u64) -> Result<Vec<Operation>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let start = Self::op_key(workflow_id, after_seq.saturating_add(1));
        let mut ops = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if key.len() != OP_KEY_LEN || &key[..16] != workflow_id.as_bytes() {
                break;
            }
            ops.push(decode_compressed(&value)?);
        }
        Ok(ops)
    }

    fn compact_operations(&self, workflow_id: Uuid, up_to_seq: u64) -> Result<u64, StoreError> {
        let keys = self.op_keys(workflow_id, 0, up_to_seq)?;
        if keys.is_empty() {
            return Ok(0);
        }
        let cf = self.cf(CF_OPERATIONS)?;
        let mut batch = WriteBatch::default();
        for key in &keys {
            batch.delete_cf(cf, key);
        }
        self.write(batch)?;
        Ok(keys.len() as u64)
    }

    fn load_metadata(&self, workflow_id: Uuid) -> Result<Option<DraftMetadata>, StoreError> {
        self.read_metadata(workflow_id)
    }

    fn list_workflows(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("invalid workflow id key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }

    fn delete_workflow(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DRAFTS)?, workflow_id.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, workflow_id.as_bytes());
        let cf_ops = self.cf(CF_OPERATIONS)?;
        for key in self.op_keys(workflow_id, 0, u64::MAX)? {
            batch.delete_cf(cf_ops, key);
        }
        self.write(batch)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowdraft_core::{Connection, OperationKind, Step, StepRef, WorkflowDraft};

    fn open_temp() -> (tempfile::TempDir, RocksDraftStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDraftStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    fn logged(seq: u64) -> Operation {
        Operation::new("u1", OperationKind::RemoveStep(StepRef { step_id: format!("s{seq}") })).sequenced(seq)
    }

    #[test]
    fn open_creates_directory() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
    }

    #[test]
    fn snapshot_save_load() {
        let (_dir, store) = open_temp();
        let id = Uuid::new_v4();
        assert_eq!(store.load_draft(id).unwrap(), None);

        let mut draft = WorkflowDraft::new();
        draft.steps.push(Step::new("a", "trigger", "Start"));
        draft.steps.push(Step::new("b", "http", "Fetch"));
        draft.connections.push(Connection::new("a-b", "a", "b"));
        let snapshot = DraftSnapshot { draft, seq: 9 };

        let meta = store.save_draft(id, &snapshot).unwrap();
        assert_eq!(meta.workflow_id, id);
        assert_eq!(meta.snapshot_seq, 9);
        assert!(meta.compressed_size > 0);
        assert_eq!(store.load_draft(id).unwrap(), Some(snapshot));
    }

    #[test]
    fn operation_log_order_and_compaction() {
        let (_dir, store) = open_temp();
        let id = Uuid::new_v4();
        for seq in 1..=20 {
            store.append_operation(id, &logged(seq)).unwrap();
        }

        let all = store.load_operations_since(id, 0).unwrap();
        assert_eq!(all.len(), 20);
        assert_eq!(all[0].seq, Some(1));
        assert_eq!(all[19].seq, Some(20));
        assert_eq!(all[4], logged_like(&all[4], 5));

        assert_eq!(store.compact_operations(id, 10).unwrap(), 10);
        let rest = store.load_operations_since(id, 0).unwrap();
        assert_eq!(rest.len(), 10);
        assert_eq!(rest[0].seq, Some(11));
        assert_eq!(store.load_metadata(id).unwrap().unwrap().last_logged_seq, 20);
    }

    fn logged_like(op: &Operation, seq: u64) -> Operation {
        Operation {
            id: op.id.clone(),
            ..logged(seq)
        }
    }

    #[test]
    fn workflows_are_isolated() {
        let (_dir, store) = open_temp();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.append_operation(a, &logged(1)).unwrap();
        store.append_operation(b, &logged(1)).unwrap();
        store.append_operation(b, &logged(2)).unwrap();

        assert_eq!(store.load_operations_since(a, 0).unwrap().len(), 1);
        assert_eq!(store.load_operations_since(b, 1).unwrap().len(), 1);
        assert_eq!(store.compact_operations(a, 5).unwrap(), 1);
        assert_eq!(store.load_operations_since(b, 0).unwrap().len(), 2);

        let mut listed = store.list_workflows().unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[test]
    fn delete_workflow_removes_log_and_snapshot() {
        let (_dir, store) = open_temp();
        let id = Uuid::new_v4();
        store
            .save_draft(id, &DraftSnapshot { draft: WorkflowDraft::new(), seq: 1 })
            .unwrap();
        store.append_operation(id, &logged(2)).unwrap();

        store.delete_workflow(id).unwrap();
        assert_eq!(store.load_draft(id).unwrap(), None);
        assert!(store.load_operations_since(id, 0).unwrap().is_empty());
        assert_eq!(store.load_metadata(id).unwrap(), None);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        {
            let store = RocksDraftStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
            store
                .save_draft(id, &DraftSnapshot { draft: WorkflowDraft::new(), seq: 3 })
                .unwrap();
            store.append_operation(id, &logged(4)).unwrap();
            store.flush().unwrap();
        }
        let store = RocksDraftStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        assert_eq!(store.load_draft(id).unwrap().map(|s| s.seq), Some(3));
        assert_eq!(store.load_operations_since(id, 3).unwrap().len(), 1);
    }

    #[test]
    fn store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.path, PathBuf::from("flowdraft_data"));
        assert!(!config.sync_writes);
    }
}
