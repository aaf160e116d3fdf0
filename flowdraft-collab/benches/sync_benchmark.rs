use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use uuid::Uuid;

use flowdraft_collab::broadcast::{BroadcastGroup, Topic};
use flowdraft_collab::presence::{flatten, ConnRef, Cursor, PresenceList, PresenceMeta, UserColor, UserInfo};
use flowdraft_collab::projector::{ExecutionEvent, ExecutionProjector};
use flowdraft_collab::protocol::{ClientMessage, ServerMessage};
use flowdraft_collab::replica::Replica;
use flowdraft_collab::session::SyncState;
use flowdraft_collab::storage::{DraftSnapshot, DraftStore, RocksDraftStore, StoreConfig};
use flowdraft_collab::OfflineQueue;
use flowdraft_core::{
    apply_in_place, Connection, EditorState, MoveStep, Operation, OperationKind, Position, Step, WorkflowDraft,
};

fn draft_with(steps: usize) -> WorkflowDraft {
    let mut draft = WorkflowDraft::new();
    for i in 0..steps {
        draft.steps.push(Step::new(format!("s{i}"), "http_request", format!("Step {i}")));
        if i > 0 {
            draft
                .connections
                .push(Connection::new(format!("c{i}"), format!("s{}", i - 1), format!("s{i}")));
        }
    }
    draft
}

fn move_op(i: usize) -> Operation {
    Operation::new(
        "u1",
        OperationKind::UpdateStepPosition(MoveStep {
            step_id: format!("s{}", i % 100),
            position: Position::new(i as f64, 0.0),
        }),
    )
}

fn bench_operation_encode(c: &mut Criterion) {
    let msg = ClientMessage::operation(move_op(1));

    c.bench_function("operation_encode", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_operation_applied_decode(c: &mut Criterion) {
    let encoded = ServerMessage::OperationApplied {
        operation: move_op(1).sequenced(42),
    }
    .encode()
    .unwrap();

    c.bench_function("operation_applied_decode", |b| {
        b.iter(|| {
            black_box(ServerMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_apply_move_100_steps(c: &mut Criterion) {
    let mut draft = draft_with(100);
    let op = move_op(50);

    c.bench_function("apply_move_100_steps", |b| {
        b.iter(|| {
            apply_in_place(black_box(&mut draft), black_box(&op.kind)).unwrap();
        })
    });
}

fn bench_replica_rebase_50_pending(c: &mut Criterion) {
    c.bench_function("replica_confirm_with_50_pending", |b| {
        b.iter(|| {
            let mut replica = Replica::new("u1");
            replica.apply_sync_state(SyncState::FullSync {
                draft: draft_with(100),
                editor_state: EditorState::new(),
                seq: 0,
            });
            for i in 0..50 {
                replica
                    .propose(OperationKind::UpdateStepPosition(MoveStep {
                        step_id: format!("s{i}"),
                        position: Position::new(1.0, 1.0),
                    }))
                    .unwrap();
            }
            let remote = Operation::new("u2", OperationKind::AddStep(Step::new("x", "code", "X"))).sequenced(1);
            black_box(replica.handle_operation_applied(&remote));
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(Topic::Workflow(Uuid::new_v4()), 2048);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    receivers.push(group.add_peer(ConnRef::new(), format!("u{i}")).await);
                }

                let msg = Arc::new(ServerMessage::OperationApplied {
                    operation: move_op(1).sequenced(1),
                });
                for _ in 0..1000 {
                    group.publish_shared(black_box(msg.clone()));
                }
            });
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    c.bench_function("offline_queue_1000_ops", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for i in 0..1000 {
                queue.enqueue(move_op(i));
            }
            black_box(queue.drain());
        })
    });
}

fn bench_presence_flatten(c: &mut Criterion) {
    let mut list = PresenceList::new();
    for u in 0..50 {
        let user_id = format!("user-{u}");
        let metas = (0..3)
            .map(|tab| PresenceMeta {
                conn_ref: ConnRef::new(),
                user: UserInfo::new(user_id.clone(), format!("User {u}")).into(),
                cursor: Some(Cursor::new(tab as f64, u as f64)),
                selected_steps: vec![format!("s{tab}")],
                focused_step: None,
                dragging_steps: vec![],
                online_at: 1,
                updated_at: tab as u64,
                focused_at: None,
            })
            .collect();
        list.insert(user_id, metas);
    }

    c.bench_function("presence_flatten_50_users_3_tabs", |b| {
        b.iter(|| {
            black_box(flatten(black_box(&list), Some("user-0")));
        })
    });
}

fn bench_user_color(c: &mut Criterion) {
    c.bench_function("user_color_from_id", |b| {
        b.iter(|| {
            black_box(UserColor::from_user_id(black_box("3f2b8c1e-user")).hex());
        })
    });
}

fn bench_projector_1000_events(c: &mut Criterion) {
    let execution_id = Uuid::new_v4();
    let events: Vec<ExecutionEvent> = (0..500)
        .flat_map(|i| {
            [
                ExecutionEvent::StepStarted {
                    execution_id,
                    step_id: format!("n{i}"),
                    input_data: Some(json!({"i": i})),
                    started_at: Some(i),
                },
                ExecutionEvent::StepCompleted {
                    execution_id,
                    step_id: format!("n{i}"),
                    output_data: Some(json!({"ok": true})),
                    completed_at: Some(i + 1),
                    duration: Some(1),
                },
            ]
        })
        .collect();

    c.bench_function("projector_1000_events", |b| {
        b.iter(|| {
            let mut projector = ExecutionProjector::for_execution(execution_id);
            for event in &events {
                projector.apply(event);
            }
            black_box(projector.steps().len());
        })
    });
}

fn bench_save_snapshot(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksDraftStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let workflow_id = Uuid::new_v4();
    let snapshot = DraftSnapshot {
        draft: draft_with(100),
        seq: 1,
    };

    c.bench_function("save_snapshot_100_steps", |b| {
        b.iter(|| {
            black_box(store.save_draft(workflow_id, black_box(&snapshot)).unwrap());
        })
    });
}

fn bench_load_snapshot(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksDraftStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let workflow_id = Uuid::new_v4();
    store
        .save_draft(
            workflow_id,
            &DraftSnapshot {
                draft: draft_with(100),
                seq: 1,
            },
        )
        .unwrap();

    c.bench_function("load_snapshot_100_steps", |b| {
        b.iter(|| {
            black_box(store.load_draft(black_box(workflow_id)).unwrap());
        })
    });
}

fn bench_append_operation(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksDraftStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let workflow_id = Uuid::new_v4();
    let mut seq = 0u64;

    c.bench_function("append_operation", |b| {
        b.iter(|| {
            seq += 1;
            store.append_operation(workflow_id, &move_op(1).sequenced(seq)).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_operation_encode,
    bench_operation_applied_decode,
    bench_apply_move_100_steps,
    bench_replica_rebase_50_pending,
    bench_broadcast_1000_messages,
    bench_offline_queue,
    bench_presence_flatten,
    bench_user_color,
    bench_projector_1000_events,
    bench_save_snapshot,
    bench_load_snapshot,
    bench_append_operation,
);
criterion_main!(benches);
