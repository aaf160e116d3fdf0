use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use flowdraft_core::{
    apply_operation, Connection, Operation, OperationKind, PatchOp, RawOperation, Step, StepConfigChange, StepRef,
    WorkflowDraft,
};
use serde_json::json;
use std::hint::black_box;

/// A chain of `n` steps, each connected to the next.
fn chain_draft(n: usize) -> WorkflowDraft {
    let mut draft = WorkflowDraft::new();
    for i in 0..n {
        draft.steps.push(Step::new(format!("s{i}"), "code", format!("Step {i}")).at(i as f64 * 200.0, 0.0));
        if i > 0 {
            draft
                .connections
                .push(Connection::new(format!("c{i}"), format!("s{}", i - 1), format!("s{i}")));
        }
    }
    draft
}

fn bench_apply_config_patch(c: &mut Criterion) {
    let mut group = c.benchmark_group("Applier");
    group.throughput(Throughput::Elements(1));

    let draft = chain_draft(200);
    let op = Operation::new(
        "u1",
        OperationKind::UpdateStepConfig(StepConfigChange {
            step_id: "s150".into(),
            changes: vec![
                PatchOp::Add { path: "/url".into(), value: json!("https://example.com") },
                PatchOp::Replace { path: "/timeout".into(), value: json!(30) },
            ],
        }),
    );

    group.bench_function("update_step_config_200_steps", |b| {
        b.iter(|| black_box(apply_operation(black_box(&draft), black_box(&op)).unwrap()))
    });
    group.finish();
}

fn bench_remove_step_cascade(c: &mut Criterion) {
    let mut group = c.benchmark_group("Applier");
    group.throughput(Throughput::Elements(1));

    let draft = chain_draft(200);
    let op = Operation::new("u1", OperationKind::RemoveStep(StepRef { step_id: "s100".into() }));

    group.bench_function("remove_step_cascade_200_steps", |b| {
        b.iter(|| black_box(apply_operation(black_box(&draft), black_box(&op)).unwrap()))
    });
    group.finish();
}

fn bench_validate_raw(c: &mut Criterion) {
    let raw = RawOperation {
        id: "op-1".into(),
        op_type: "add_step".into(),
        payload: json!({"id": "n1", "type_id": "http", "name": "Fetch", "position": {"x": 1.0, "y": 2.0}}),
        user_id: "u1".into(),
        client_seq: Some(1),
        seq: None,
    };

    c.bench_function("validate_add_step", |b| {
        b.iter(|| black_box(Operation::try_from(black_box(raw.clone())).unwrap()))
    });
}

criterion_group!(benches, bench_apply_config_patch, bench_remove_step_cascade, bench_validate_raw);
criterion_main!(benches);
