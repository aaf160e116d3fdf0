//! The operation applier: `(draft, operation) -> draft' | error`.
//!
//! Pure and deterministic. The session and every replica run the same
//! function, so identical inputs give identical drafts everywhere, which is
//! what lets a replica echo its own edit before the server confirms it.
//!
//! Every variant is idempotent. Re-delivering an operation that already
//! took effect leaves the draft as it is instead of failing. Only a
//! genuinely invalid reference or conflicting content is an error.

use crate::draft::WorkflowDraft;
use crate::error::ApplyError;
use crate::operation::{Operation, OperationKind};
use crate::patch::apply_patch;

/// Apply `op` to `draft`, returning the new draft. `draft` is not modified.
pub fn apply_operation(draft: &WorkflowDraft, op: &Operation) -> Result<WorkflowDraft, ApplyError> {
    let mut next = draft.clone();
    apply_in_place(&mut next, &op.kind)?;
    Ok(next)
}

/// Apply `kind` to `draft` in place. On error the draft is unchanged.
pub fn apply_in_place(draft: &mut WorkflowDraft, kind: &OperationKind) -> Result<(), ApplyError> {
    match kind {
        OperationKind::AddStep(step) => match draft.step(&step.id) {
            Some(existing) if existing == step => {
                log::trace!("add_step {}: already present", step.id);
                Ok(())
            }
            Some(_) => Err(ApplyError::DuplicateStep(step.id.clone())),
            None => {
                draft.steps.push(step.clone());
                Ok(())
            }
        },

        OperationKind::RemoveStep(r) => {
            if !draft.has_step(&r.step_id) {
                log::trace!("remove_step {}: already absent", r.step_id);
            }
            draft.steps.retain(|s| s.id != r.step_id);
            draft.connections.retain(|c| !c.touches(&r.step_id));
            Ok(())
        }

        OperationKind::UpdateStepPosition(m) => {
            step_mut(draft, &m.step_id)?.position = m.position;
            Ok(())
        }

        OperationKind::UpdateStepMetadata(m) => {
            let step = step_mut(draft, &m.step_id)?;
            if let Some(name) = &m.name {
                step.name = name.clone();
            }
            if let Some(notes) = &m.notes {
                step.notes = notes.clone();
            }
            Ok(())
        }

        OperationKind::UpdateStepConfig(c) => {
            let step = step_mut(draft, &c.step_id)?;
            step.config = apply_patch(&step.config, &c.changes)?;
            Ok(())
        }

        OperationKind::AddConnection(conn) => {
            if draft.connection(&conn.id).is_some() {
                log::trace!("add_connection {}: already present", conn.id);
                return Ok(());
            }
            for endpoint in [&conn.source_step_id, &conn.target_step_id] {
                if !draft.has_step(endpoint) {
                    return Err(ApplyError::InvalidReference {
                        connection_id: conn.id.clone(),
                        step_id: endpoint.clone(),
                    });
                }
            }
            draft.connections.push(conn.clone());
            Ok(())
        }

        OperationKind::RemoveConnection(r) => {
            draft.connections.retain(|c| c.id != r.connection_id);
            Ok(())
        }

        // Editor-state operations leave the draft alone, but pinning or
        // disabling a step that does not exist is still a bad reference.
        OperationKind::PinStepOutput(p) => require_step(draft, &p.step_id),
        OperationKind::DisableStep(d) => require_step(draft, &d.step_id),
        OperationKind::UnpinStepOutput(_) | OperationKind::EnableStep(_) => Ok(()),
    }
}

/// Apply a sequence of operations, stopping at the first failure.
/// Returns the index of the failing operation with its error.
pub fn apply_all<'a, I>(draft: &WorkflowDraft, ops: I) -> Result<WorkflowDraft, (usize, ApplyError)>
where
    I: IntoIterator<Item = &'a Operation>,
{
    let mut next = draft.clone();
    for (idx, op) in ops.into_iter().enumerate() {
        apply_in_place(&mut next, &op.kind).map_err(|e| (idx, e))?;
    }
    Ok(next)
}

fn step_mut<'a>(draft: &'a mut WorkflowDraft, step_id: &str) -> Result<&'a mut crate::draft::Step, ApplyError> {
    draft
        .step_mut(step_id)
        .ok_or_else(|| ApplyError::StepNotFound(step_id.to_string()))
}

fn require_step(draft: &WorkflowDraft, step_id: &str) -> Result<(), ApplyError> {
    if draft.has_step(step_id) {
        Ok(())
    } else {
        Err(ApplyError::StepNotFound(step_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::{Connection, Position, Step};
    use crate::operation::{
        ConnectionRef, DisableMode, DisableStep, MoveStep, PinOutput, StepConfigChange, StepMetadataChange, StepRef,
    };
    use crate::patch::PatchOp;
    use serde_json::json;

    fn op(kind: OperationKind) -> Operation {
        Operation::new("u1", kind)
    }

    fn two_step_draft() -> WorkflowDraft {
        let mut draft = WorkflowDraft::new();
        draft.steps.push(Step::new("A", "trigger", "Start"));
        draft.steps.push(Step::new("B", "http", "Fetch"));
        draft.connections.push(Connection::new("A-B", "A", "B"));
        draft
    }

    #[test]
    fn remove_step_cascades_connections() {
        let draft = two_step_draft();
        let next = apply_operation(&draft, &op(OperationKind::RemoveStep(StepRef { step_id: "A".into() }))).unwrap();
        assert_eq!(next.steps.len(), 1);
        assert_eq!(next.steps[0].id, "B");
        assert!(next.connections.is_empty());
        assert!(next.is_consistent());
    }

    #[test]
    fn remove_missing_step_is_noop() {
        let draft = two_step_draft();
        let next = apply_operation(&draft, &op(OperationKind::RemoveStep(StepRef { step_id: "Z".into() }))).unwrap();
        assert_eq!(next, draft);
    }

    #[test]
    fn add_step_is_idempotent_but_rejects_conflicting_content() {
        let add = op(OperationKind::AddStep(Step::new("C", "code", "Transform")));
        let once = apply_operation(&two_step_draft(), &add).unwrap();
        let twice = apply_operation(&once, &add).unwrap();
        assert_eq!(once, twice);

        let clash = op(OperationKind::AddStep(Step::new("C", "code", "Other")));
        assert_eq!(
            apply_operation(&once, &clash).unwrap_err(),
            ApplyError::DuplicateStep("C".into())
        );
    }

    #[test]
    fn add_connection_requires_both_endpoints() {
        let draft = two_step_draft();
        let bad = op(OperationKind::AddConnection(Connection::new("c2", "missing", "B")));
        assert_eq!(
            apply_operation(&draft, &bad).unwrap_err(),
            ApplyError::InvalidReference {
                connection_id: "c2".into(),
                step_id: "missing".into()
            }
        );
    }

    #[test]
    fn connection_add_and_remove_are_idempotent() {
        let draft = two_step_draft();
        let add = op(OperationKind::AddConnection(Connection::new("B-A", "B", "A")));
        let once = apply_operation(&draft, &add).unwrap();
        assert_eq!(apply_operation(&once, &add).unwrap(), once);

        let remove = op(OperationKind::RemoveConnection(ConnectionRef {
            connection_id: "B-A".into(),
        }));
        let removed = apply_operation(&once, &remove).unwrap();
        assert_eq!(apply_operation(&removed, &remove).unwrap(), removed);
        assert_eq!(removed, draft);
    }

    #[test]
    fn existing_connection_id_wins_even_if_endpoints_vanished() {
        let draft = two_step_draft();
        let add = op(OperationKind::AddConnection(Connection::new("A-B", "ghost", "B")));
        assert_eq!(apply_operation(&draft, &add).unwrap(), draft);
    }

    #[test]
    fn update_position_and_metadata() {
        let draft = two_step_draft();
        let moved = apply_operation(
            &draft,
            &op(OperationKind::UpdateStepPosition(MoveStep {
                step_id: "B".into(),
                position: Position::new(300.0, 120.0),
            })),
        )
        .unwrap();
        assert_eq!(moved.step("B").unwrap().position, Position::new(300.0, 120.0));

        let noted = apply_operation(
            &moved,
            &op(OperationKind::UpdateStepMetadata(StepMetadataChange {
                step_id: "B".into(),
                name: Some("Fetch users".into()),
                notes: Some(Some("paginates".into())),
            })),
        )
        .unwrap();
        let step = noted.step("B").unwrap();
        assert_eq!(step.name, "Fetch users");
        assert_eq!(step.notes.as_deref(), Some("paginates"));

        let cleared = apply_operation(
            &noted,
            &op(OperationKind::UpdateStepMetadata(StepMetadataChange {
                step_id: "B".into(),
                name: None,
                notes: Some(None),
            })),
        )
        .unwrap();
        assert_eq!(cleared.step("B").unwrap().notes, None);
        assert_eq!(cleared.step("B").unwrap().name, "Fetch users");
    }

    #[test]
    fn updates_on_missing_step_fail() {
        let draft = two_step_draft();
        let err = apply_operation(
            &draft,
            &op(OperationKind::UpdateStepPosition(MoveStep {
                step_id: "Z".into(),
                position: Position::default(),
            })),
        )
        .unwrap_err();
        assert_eq!(err, ApplyError::StepNotFound("Z".into()));
    }

    #[test]
    fn config_patch_applies_to_step() {
        let draft = two_step_draft();
        let next = apply_operation(
            &draft,
            &op(OperationKind::UpdateStepConfig(StepConfigChange {
                step_id: "B".into(),
                changes: vec![
                    PatchOp::Add { path: "/url".into(), value: json!("https://example.com") },
                    PatchOp::Add { path: "/method".into(), value: json!("GET") },
                ],
            })),
        )
        .unwrap();
        let config = &next.step("B").unwrap().config;
        assert_eq!(config.get("url"), Some(&json!("https://example.com")));
        assert_eq!(config.get("method"), Some(&json!("GET")));
    }

    #[test]
    fn config_append_applied_twice_matches_once() {
        let draft = two_step_draft();
        let append = op(OperationKind::UpdateStepConfig(StepConfigChange {
            step_id: "B".into(),
            changes: vec![
                PatchOp::Add { path: "/headers".into(), value: json!([]) },
                PatchOp::Add { path: "/headers/-".into(), value: json!("x") },
            ],
        }));
        let once = apply_operation(&draft, &append).unwrap();
        let twice = apply_operation(&once, &append).unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.step("B").unwrap().config.get("headers"), Some(&json!(["x"])));
    }

    #[test]
    fn editor_only_operations_check_reference_but_keep_draft() {
        let draft = two_step_draft();
        let pin = op(OperationKind::PinStepOutput(PinOutput {
            step_id: "B".into(),
            data: json!({"rows": 3}),
        }));
        assert_eq!(apply_operation(&draft, &pin).unwrap(), draft);

        let disable_missing = op(OperationKind::DisableStep(DisableStep {
            step_id: "Z".into(),
            mode: DisableMode::Exclude,
        }));
        assert!(apply_operation(&draft, &disable_missing).is_err());

        let enable_missing = op(OperationKind::EnableStep(StepRef { step_id: "Z".into() }));
        assert_eq!(apply_operation(&draft, &enable_missing).unwrap(), draft);
    }

    #[test]
    fn apply_all_reports_failing_index() {
        let draft = two_step_draft();
        let ops = vec![
            op(OperationKind::AddStep(Step::new("C", "code", "C"))),
            op(OperationKind::AddConnection(Connection::new("x", "C", "nope"))),
        ];
        let (idx, err) = apply_all(&draft, &ops).unwrap_err();
        assert_eq!(idx, 1);
        assert_eq!(err.code(), "invalid_reference");
    }

    #[test]
    fn replicas_converge_on_same_sequence() {
        let ops = vec![
            op(OperationKind::AddStep(Step::new("C", "code", "C").at(10.0, 10.0))),
            op(OperationKind::AddConnection(Connection::new("B-C", "B", "C"))),
            op(OperationKind::UpdateStepConfig(StepConfigChange {
                step_id: "C".into(),
                changes: vec![PatchOp::Add { path: "/src".into(), value: json!("return 1") }],
            })),
            op(OperationKind::RemoveStep(StepRef { step_id: "A".into() })),
        ];
        let left = apply_all(&two_step_draft(), &ops).unwrap();
        let right = apply_all(&two_step_draft(), &ops).unwrap();
        assert_eq!(
            serde_json::to_vec(&left).unwrap(),
            serde_json::to_vec(&right).unwrap()
        );
        assert!(left.is_consistent());
    }
}
