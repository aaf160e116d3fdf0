//! Workflow draft model: steps, connections, triggers and settings.
//!
//! A draft is the live, unpublished shape of a workflow. Every replica and
//! the authoritative session hold a `WorkflowDraft` and mutate it only
//! through [`crate::apply::apply_operation`].
//!
//! Config and settings maps are `serde_json::Map`, which is ordered by key,
//! so two drafts built from the same operation sequence serialize to the
//! same bytes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default output/input port name for connections.
pub const MAIN_PORT: &str = "main";

fn main_port() -> String {
    MAIN_PORT.to_string()
}

/// 2D canvas position of a step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub type_id: String,
    pub name: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Step {
    pub fn new(id: impl Into<String>, type_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_id: type_id.into(),
            name: name.into(),
            config: Map::new(),
            position: Position::default(),
            notes: None,
        }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Position::new(x, y);
        self
    }

    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }
}

/// A directed edge between two steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub source_step_id: String,
    pub target_step_id: String,
    #[serde(default = "main_port")]
    pub source_output: String,
    #[serde(default = "main_port")]
    pub target_input: String,
}

impl Connection {
    /// Connection between the `main` ports of two steps.
    pub fn new(
        id: impl Into<String>,
        source_step_id: impl Into<String>,
        target_step_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_step_id: source_step_id.into(),
            target_step_id: target_step_id.into(),
            source_output: main_port(),
            target_input: main_port(),
        }
    }

    /// Whether either endpoint is the given step.
    pub fn touches(&self, step_id: &str) -> bool {
        self.source_step_id == step_id || self.target_step_id == step_id
    }
}

/// An entry point that starts executions of the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub type_id: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

/// The mutable draft of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkflowDraft {
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

/// A broken draft invariant found by [`WorkflowDraft::check_invariants`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftViolation {
    DuplicateStepId(String),
    DanglingConnection { connection_id: String, step_id: String },
}

impl WorkflowDraft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    pub fn has_step(&self, step_id: &str) -> bool {
        self.steps.iter().any(|s| s.id == step_id)
    }

    pub fn connection(&self, connection_id: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id == connection_id)
    }

    /// Connections that start or end at `step_id`.
    pub fn connections_of<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| c.touches(step_id))
    }

    /// Validate the structural invariants: unique step ids and
    /// connections that only reference existing steps.
    pub fn check_invariants(&self) -> Vec<DraftViolation> {
        let mut violations = Vec::new();
        let mut seen = std::collections::HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                violations.push(DraftViolation::DuplicateStepId(step.id.clone()));
            }
        }
        for conn in &self.connections {
            for endpoint in [&conn.source_step_id, &conn.target_step_id] {
                if !seen.contains(endpoint.as_str()) {
                    violations.push(DraftViolation::DanglingConnection {
                        connection_id: conn.id.clone(),
                        step_id: endpoint.clone(),
                    });
                }
            }
        }
        violations
    }

    pub fn is_consistent(&self) -> bool {
        self.check_invariants().is_empty()
    }
}
