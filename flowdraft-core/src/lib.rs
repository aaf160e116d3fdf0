//! # flowdraft-core: draft model and operation applier
//!
//! The pure half of flowdraft: the workflow draft, the closed set of
//! operations that edit it, and the deterministic applier shared by the
//! authoritative session and every client replica.
//!
//! ```text
//! RawOperation ──TryFrom──► Operation ──apply_operation──► WorkflowDraft'
//!  (wire JSON)   validate     (typed)     pure, idempotent
//!                                   │
//!                                   └──EditorState::apply_effect──► pins / disabled
//! ```

pub mod apply;
pub mod draft;
pub mod editor_state;
pub mod error;
pub mod operation;
pub mod patch;

pub use apply::{apply_all, apply_in_place, apply_operation};
pub use draft::{Connection, DraftViolation, Position, Step, Trigger, WorkflowDraft, MAIN_PORT};
pub use editor_state::{now_millis, EditorState, LockOutcome, StepLock, WebhookTest};
pub use error::{ApplyError, OperationError, ValidationError};
pub use operation::{
    ConnectionRef, DisableMode, DisableStep, MoveStep, Operation, OperationKind, OperationType, PinOutput,
    RawOperation, StepConfigChange, StepMetadataChange, StepRef,
};
pub use patch::{apply_patch, PatchOp};
