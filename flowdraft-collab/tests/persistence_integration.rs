//! Sessions on top of RocksDB: operation logging, flushes, compaction
//! and recovery after a restart.

use std::sync::Arc;

use tokio::time::{Duration, Instant};
use uuid::Uuid;

use flowdraft_collab::broadcast::RoomManager;
use flowdraft_collab::client::SyncClient;
use flowdraft_collab::presence::UserInfo;
use flowdraft_collab::server::{ServerConfig, SyncServer};
use flowdraft_collab::session::{PersistOutcome, SessionConfig, SessionRegistry, SyncState};
use flowdraft_collab::storage::{DraftSnapshot, DraftStore, RocksDraftStore, StoreConfig};
use flowdraft_core::{Connection, Operation, OperationKind, PinOutput, Step, StepRef, WorkflowDraft};

fn open_store(dir: &tempfile::TempDir) -> Arc<RocksDraftStore> {
    Arc::new(RocksDraftStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap())
}

fn registry(store: Arc<RocksDraftStore>) -> SessionRegistry {
    let config = SessionConfig {
        persist_interval_secs: 0,
        ..SessionConfig::default()
    };
    SessionRegistry::new(Arc::new(RoomManager::new(64)), store, config)
}

fn op(kind: OperationKind) -> Operation {
    Operation::new("u1", kind)
}

/// Wait until nothing but `store` itself holds the database.
async fn release(store: Arc<RocksDraftStore>) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Arc::strong_count(&store) > 1 {
        assert!(Instant::now() < deadline, "store still referenced");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    drop(store);
}

#[tokio::test]
async fn test_accepted_operations_are_logged() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let sessions = registry(store.clone());
    let workflow_id = Uuid::new_v4();

    let session = sessions.get_or_start(workflow_id).await.unwrap();
    session.apply_operation(op(OperationKind::AddStep(Step::new("a", "trigger", "Start")))).await.unwrap();
    session.apply_operation(op(OperationKind::AddStep(Step::new("b", "http", "Fetch")))).await.unwrap();

    let logged = store.load_operations_since(workflow_id, 0).unwrap();
    let seqs: Vec<_> = logged.iter().map(|op| op.seq).collect();
    assert_eq!(seqs, vec![Some(1), Some(2)]);
    assert_eq!(store.load_draft(workflow_id).unwrap(), None);
}

#[tokio::test]
async fn test_persist_writes_snapshot_and_compacts_log() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let sessions = registry(store.clone());
    let workflow_id = Uuid::new_v4();

    let session = sessions.get_or_start(workflow_id).await.unwrap();
    session.apply_operation(op(OperationKind::AddStep(Step::new("a", "trigger", "Start")))).await.unwrap();
    assert_eq!(session.persist_sync().await.unwrap(), PersistOutcome::Persisted { seq: 1 });
    assert_eq!(session.persist_sync().await.unwrap(), PersistOutcome::Noop);

    let snapshot = store.load_draft(workflow_id).unwrap().unwrap();
    assert_eq!(snapshot.seq, 1);
    assert!(snapshot.draft.has_step("a"));
    assert!(store.load_operations_since(workflow_id, 0).unwrap().is_empty());

    let meta = store.load_metadata(workflow_id).unwrap().unwrap();
    assert_eq!(meta.snapshot_seq, 1);
    assert!(store.list_workflows().unwrap().contains(&workflow_id));
}

#[tokio::test]
async fn test_draft_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let workflow_id = Uuid::new_v4();

    {
        let store = open_store(&dir);
        let sessions = registry(store.clone());
        let session = sessions.get_or_start(workflow_id).await.unwrap();
        session.apply_operation(op(OperationKind::AddStep(Step::new("a", "trigger", "Start")))).await.unwrap();
        session.apply_operation(op(OperationKind::AddStep(Step::new("b", "http", "Fetch")))).await.unwrap();
        session
            .apply_operation(op(OperationKind::AddConnection(Connection::new("a-b", "a", "b"))))
            .await
            .unwrap();
        session
            .apply_operation(op(OperationKind::PinStepOutput(PinOutput {
                step_id: "b".into(),
                data: serde_json::json!([{"ok": true}]),
            })))
            .await
            .unwrap();
        assert_eq!(sessions.stop(workflow_id).await.unwrap(), PersistOutcome::Persisted { seq: 4 });
        drop(session);
        drop(sessions);
        release(store).await;
    }

    let store = open_store(&dir);
    let sessions = registry(store.clone());
    let session = sessions.get_or_start(workflow_id).await.unwrap();
    match session.get_sync_state(None).await.unwrap() {
        SyncState::FullSync { draft, seq, .. } => {
            assert_eq!(seq, 4);
            assert!(draft.has_step("a") && draft.has_step("b"));
            assert_eq!(draft.connections.len(), 1);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Sequence numbers continue where they stopped.
    let next = session
        .apply_operation(op(OperationKind::RemoveStep(StepRef { step_id: "a".into() })))
        .await
        .unwrap();
    assert_eq!(next.seq, Some(5));
}

#[tokio::test]
async fn test_unflushed_log_is_replayed_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let workflow_id = Uuid::new_v4();

    {
        // A snapshot at seq 1 plus two logged operations that never made
        // it into a snapshot.
        let store = open_store(&dir);
        let mut draft = WorkflowDraft::new();
        draft.steps.push(Step::new("a", "trigger", "Start"));
        store.save_draft(workflow_id, &DraftSnapshot { draft, seq: 1 }).unwrap();
        store
            .append_operation(workflow_id, &op(OperationKind::AddStep(Step::new("b", "http", "Fetch"))).sequenced(2))
            .unwrap();
        store
            .append_operation(
                workflow_id,
                &op(OperationKind::AddConnection(Connection::new("a-b", "a", "b"))).sequenced(3),
            )
            .unwrap();
        store.flush().unwrap();
    }

    let store = open_store(&dir);
    let sessions = registry(store.clone());
    let session = sessions.get_or_start(workflow_id).await.unwrap();
    let (snapshot, _) = session.snapshot().await.unwrap();
    assert_eq!(snapshot.seq, 3);
    assert!(snapshot.draft.has_step("b"));
    assert_eq!(snapshot.draft.connections.len(), 1);
}

#[tokio::test]
async fn test_server_flushes_when_last_editor_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let workflow_id = Uuid::new_v4();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::with_store(config, store.clone()));
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = SyncClient::new(UserInfo::new("u1", "Alice"), workflow_id, format!("ws://127.0.0.1:{port}"));
    client.connect().await.unwrap();
    client
        .propose(OperationKind::AddStep(Step::new("a", "trigger", "Start")))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while client.seq().await < 1 {
        assert!(Instant::now() < deadline, "operation never confirmed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    client.disconnect().await;

    loop {
        if let Some(snapshot) = store.load_draft(workflow_id).unwrap() {
            assert_eq!(snapshot.seq, 1);
            assert!(snapshot.draft.has_step("a"));
            break;
        }
        assert!(Instant::now() < deadline, "draft never flushed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    server.shutdown().await;
}
