//! Error taxonomy for operations against a draft.
//!
//! Every error carries a stable snake_case `code()` that goes on the wire
//! unchanged, so clients can branch on it without parsing messages.

use thiserror::Error;

/// A malformed operation, rejected before the applier runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown operation type: {0}")]
    UnknownOperation(String),

    #[error("invalid payload for {op_type}: {reason}")]
    InvalidPayload { op_type: String, reason: String },

    #[error("operation id must not be empty")]
    MissingOperationId,

    #[error("user id must not be empty")]
    MissingUserId,
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownOperation(_) => "unknown_operation",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::MissingOperationId => "missing_operation_id",
            Self::MissingUserId => "missing_user_id",
        }
    }

    pub(crate) fn payload(op_type: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            op_type: op_type.to_string(),
            reason: reason.into(),
        }
    }
}

/// A well-formed operation that cannot be applied to the current draft.
/// The draft is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error("step {0} already exists with different content")]
    DuplicateStep(String),

    #[error("connection {connection_id} references missing step {step_id}")]
    InvalidReference { connection_id: String, step_id: String },

    #[error("invalid config patch at {path}: {reason}")]
    InvalidPatch { path: String, reason: String },
}

impl ApplyError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::StepNotFound(_) => "step_not_found",
            Self::DuplicateStep(_) => "duplicate_step",
            Self::InvalidReference { .. } => "invalid_reference",
            Self::InvalidPatch { .. } => "invalid_patch",
        }
    }
}

/// Either half of the operation error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Apply(#[from] ApplyError),
}

impl OperationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.code(),
            Self::Apply(e) => e.code(),
        }
    }
}
