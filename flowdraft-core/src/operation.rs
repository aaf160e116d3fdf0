//! Typed draft operations and their wire form.
//!
//! On the wire an operation is loosely shaped:
//!
//! ```text
//! { "id": "...", "type": "add_step", "payload": { ... },
//!   "user_id": "...", "client_seq": 3, "seq": null }
//! ```
//!
//! [`RawOperation`] mirrors that shape. Converting it into an [`Operation`]
//! validates the payload against the schema of its variant, so everything
//! past the boundary works with a closed union and never sees a malformed
//! payload.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::draft::{Connection, Position, Step};
use crate::error::ValidationError;
use crate::patch::PatchOp;

/// Operation discriminator, as it appears in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    AddStep,
    RemoveStep,
    UpdateStepPosition,
    UpdateStepMetadata,
    UpdateStepConfig,
    AddConnection,
    RemoveConnection,
    PinStepOutput,
    UnpinStepOutput,
    DisableStep,
    EnableStep,
}

impl OperationType {
    pub const ALL: [OperationType; 11] = [
        Self::AddStep,
        Self::RemoveStep,
        Self::UpdateStepPosition,
        Self::UpdateStepMetadata,
        Self::UpdateStepConfig,
        Self::AddConnection,
        Self::RemoveConnection,
        Self::PinStepOutput,
        Self::UnpinStepOutput,
        Self::DisableStep,
        Self::EnableStep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddStep => "add_step",
            Self::RemoveStep => "remove_step",
            Self::UpdateStepPosition => "update_step_position",
            Self::UpdateStepMetadata => "update_step_metadata",
            Self::UpdateStepConfig => "update_step_config",
            Self::AddConnection => "add_connection",
            Self::RemoveConnection => "remove_connection",
            Self::PinStepOutput => "pin_step_output",
            Self::UnpinStepOutput => "unpin_step_output",
            Self::DisableStep => "disable_step",
            Self::EnableStep => "enable_step",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Operations whose only effect is on editor state, not on the draft.
    pub fn is_editor_only(&self) -> bool {
        matches!(
            self,
            Self::PinStepOutput | Self::UnpinStepOutput | Self::DisableStep | Self::EnableStep
        )
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a disabled step is treated when the workflow runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisableMode {
    /// The step is passed over and its input flows through.
    #[default]
    Skip,
    /// The step and everything only reachable through it is left out.
    Exclude,
}

// ─── Payloads ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRef {
    pub step_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveStep {
    pub step_id: String,
    pub position: Position,
}

/// Name and notes edits. Absent fields are left alone; `notes: null`
/// clears the notes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetadataChange {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub notes: Option<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfigChange {
    pub step_id: String,
    pub changes: Vec<PatchOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRef {
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinOutput {
    pub step_id: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisableStep {
    pub step_id: String,
    #[serde(default)]
    pub mode: DisableMode,
}

fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

/// One variant per operation kind, each with its validated payload.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    AddStep(Step),
    RemoveStep(StepRef),
    UpdateStepPosition(MoveStep),
    UpdateStepMetadata(StepMetadataChange),
    UpdateStepConfig(StepConfigChange),
    AddConnection(Connection),
    RemoveConnection(ConnectionRef),
    PinStepOutput(PinOutput),
    UnpinStepOutput(StepRef),
    DisableStep(DisableStep),
    EnableStep(StepRef),
}

impl OperationKind {
    pub fn op_type(&self) -> OperationType {
        match self {
            Self::AddStep(_) => OperationType::AddStep,
            Self::RemoveStep(_) => OperationType::RemoveStep,
            Self::UpdateStepPosition(_) => OperationType::UpdateStepPosition,
            Self::UpdateStepMetadata(_) => OperationType::UpdateStepMetadata,
            Self::UpdateStepConfig(_) => OperationType::UpdateStepConfig,
            Self::AddConnection(_) => OperationType::AddConnection,
            Self::RemoveConnection(_) => OperationType::RemoveConnection,
            Self::PinStepOutput(_) => OperationType::PinStepOutput,
            Self::UnpinStepOutput(_) => OperationType::UnpinStepOutput,
            Self::DisableStep(_) => OperationType::DisableStep,
            Self::EnableStep(_) => OperationType::EnableStep,
        }
    }

    /// The step this operation targets, if it targets one.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::AddStep(step) => Some(&step.id),
            Self::RemoveStep(r) | Self::UnpinStepOutput(r) | Self::EnableStep(r) => Some(&r.step_id),
            Self::UpdateStepPosition(m) => Some(&m.step_id),
            Self::UpdateStepMetadata(m) => Some(&m.step_id),
            Self::UpdateStepConfig(c) => Some(&c.step_id),
            Self::PinStepOutput(p) => Some(&p.step_id),
            Self::DisableStep(d) => Some(&d.step_id),
            Self::AddConnection(_) | Self::RemoveConnection(_) => None,
        }
    }

    /// Encode the payload as the loose JSON object carried on the wire.
    pub fn payload(&self) -> Value {
        let encoded = match self {
            Self::AddStep(step) => serde_json::to_value(step),
            Self::RemoveStep(r) | Self::UnpinStepOutput(r) | Self::EnableStep(r) => serde_json::to_value(r),
            Self::UpdateStepPosition(m) => serde_json::to_value(m),
            Self::UpdateStepMetadata(m) => serde_json::to_value(m),
            Self::UpdateStepConfig(c) => serde_json::to_value(c),
            Self::AddConnection(c) => serde_json::to_value(c),
            Self::RemoveConnection(c) => serde_json::to_value(c),
            Self::PinStepOutput(p) => serde_json::to_value(p),
            Self::DisableStep(d) => serde_json::to_value(d),
        };
        // Payload types only hold string keys and JSON values, so encoding cannot fail.
        encoded.unwrap_or(Value::Null)
    }

    /// Decode and validate a payload for the given type.
    pub fn from_payload(op_type: OperationType, payload: Value) -> Result<Self, ValidationError> {
        let name = op_type.as_str();
        let kind = match op_type {
            OperationType::AddStep => Self::AddStep(decode(name, payload)?),
            OperationType::RemoveStep => Self::RemoveStep(decode(name, payload)?),
            OperationType::UpdateStepPosition => Self::UpdateStepPosition(decode(name, payload)?),
            OperationType::UpdateStepMetadata => Self::UpdateStepMetadata(decode(name, payload)?),
            OperationType::UpdateStepConfig => Self::UpdateStepConfig(decode(name, payload)?),
            OperationType::AddConnection => Self::AddConnection(decode(name, payload)?),
            OperationType::RemoveConnection => Self::RemoveConnection(decode(name, payload)?),
            OperationType::PinStepOutput => Self::PinStepOutput(decode(name, payload)?),
            OperationType::UnpinStepOutput => Self::UnpinStepOutput(decode(name, payload)?),
            OperationType::DisableStep => Self::DisableStep(decode(name, payload)?),
            OperationType::EnableStep => Self::EnableStep(decode(name, payload)?),
        };
        kind.validate()?;
        Ok(kind)
    }

    /// Checks serde cannot express: non-empty ids, finite coordinates,
    /// well-formed patch paths.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let name = self.op_type().as_str();
        let require = |field: &str, value: &str| {
            if value.trim().is_empty() {
                Err(ValidationError::payload(name, format!("{field} must not be empty")))
            } else {
                Ok(())
            }
        };

        match self {
            Self::AddStep(step) => {
                require("id", &step.id)?;
                require("type_id", &step.type_id)?;
                require("name", &step.name)?;
                check_position(name, &step.position)
            }
            Self::RemoveStep(r) | Self::UnpinStepOutput(r) | Self::EnableStep(r) => require("step_id", &r.step_id),
            Self::UpdateStepPosition(m) => {
                require("step_id", &m.step_id)?;
                check_position(name, &m.position)
            }
            Self::UpdateStepMetadata(m) => {
                require("step_id", &m.step_id)?;
                if let Some(new_name) = &m.name {
                    require("name", new_name)?;
                }
                Ok(())
            }
            Self::UpdateStepConfig(c) => {
                require("step_id", &c.step_id)?;
                for change in &c.changes {
                    if !change.path().starts_with('/') {
                        return Err(ValidationError::payload(
                            name,
                            format!("patch path {:?} must start with '/'", change.path()),
                        ));
                    }
                }
                Ok(())
            }
            Self::AddConnection(c) => {
                require("id", &c.id)?;
                require("source_step_id", &c.source_step_id)?;
                require("target_step_id", &c.target_step_id)?;
                require("source_output", &c.source_output)?;
                require("target_input", &c.target_input)
            }
            Self::RemoveConnection(c) => require("connection_id", &c.connection_id),
            Self::PinStepOutput(p) => require("step_id", &p.step_id),
            Self::DisableStep(d) => require("step_id", &d.step_id),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(op_type: &str, payload: Value) -> Result<T, ValidationError> {
    if !payload.is_object() {
        return Err(ValidationError::payload(op_type, "payload must be an object"));
    }
    serde_json::from_value(payload).map_err(|e| ValidationError::payload(op_type, e.to_string()))
}

fn check_position(op_type: &str, position: &Position) -> Result<(), ValidationError> {
    if position.x.is_finite() && position.y.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::payload(op_type, "position must be finite"))
    }
}

// ─── Operation envelope ──────────────────────────────────────────────

/// Loose wire shape of an operation, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOperation {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub client_seq: Option<u64>,
    #[serde(default)]
    pub seq: Option<u64>,
}

/// A validated operation. Once broadcast with a `seq` it is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOperation", into = "RawOperation")]
pub struct Operation {
    pub id: String,
    pub kind: OperationKind,
    pub user_id: String,
    /// Client-local ordering hint, not trusted by the server.
    pub client_seq: Option<u64>,
    /// Server-assigned sequence number, set when the operation is accepted.
    pub seq: Option<u64>,
}

impl Operation {
    /// New operation with a fresh id.
    pub fn new(user_id: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            user_id: user_id.into(),
            client_seq: None,
            seq: None,
        }
    }

    pub fn with_client_seq(mut self, client_seq: u64) -> Self {
        self.client_seq = Some(client_seq);
        self
    }

    pub fn op_type(&self) -> OperationType {
        self.kind.op_type()
    }

    /// Copy of this operation stamped with its server sequence number.
    pub fn sequenced(&self, seq: u64) -> Self {
        Self {
            seq: Some(seq),
            ..self.clone()
        }
    }
}

impl TryFrom<RawOperation> for Operation {
    type Error = ValidationError;

    fn try_from(raw: RawOperation) -> Result<Self, Self::Error> {
        if raw.id.trim().is_empty() {
            return Err(ValidationError::MissingOperationId);
        }
        if raw.user_id.trim().is_empty() {
            return Err(ValidationError::MissingUserId);
        }
        let op_type = OperationType::parse(&raw.op_type)
            .ok_or_else(|| ValidationError::UnknownOperation(raw.op_type.clone()))?;
        let kind = OperationKind::from_payload(op_type, raw.payload)?;
        Ok(Self {
            id: raw.id,
            kind,
            user_id: raw.user_id,
            client_seq: raw.client_seq,
            seq: raw.seq,
        })
    }
}

impl From<Operation> for RawOperation {
    fn from(op: Operation) -> Self {
        Self {
            payload: op.kind.payload(),
            op_type: op.kind.op_type().as_str().to_string(),
            id: op.id,
            user_id: op.user_id,
            client_seq: op.client_seq,
            seq: op.seq,
        }
    }
}
