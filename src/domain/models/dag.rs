//! Block pipeline domain models.
//!
//! A pipeline definition wires typed output ports to input ports across
//! blocks. Definitions are validated structurally (unique ids, declared
//! ports, acyclicity); runs track per-block instances with their own retry
//! state.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::gate::{Backoff, GateDef};

/// Declared input port on a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPort {
    #[serde(rename = "type")]
    pub port_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Declared output port on a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPort {
    #[serde(rename = "type")]
    pub port_type: String,
}

/// Per-block retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRetry {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

impl Default for BlockRetry {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
            delay_ms: 0,
            max_delay_ms: None,
        }
    }
}

impl BlockRetry {
    /// Delay before the retry following `attempt` (1-based), capped by
    /// `max_delay_ms` when set.
    pub fn next_delay_ms(&self, attempt: u32) -> u64 {
        let delay = self.backoff.delay_ms(self.delay_ms, attempt);
        match self.max_delay_ms {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

/// A node in a pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputPort>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputPort>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_gates: Vec<GateDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_gates: Vec<GateDef>,
    #[serde(default)]
    pub retry: BlockRetry,
    /// Agent selector for the block executor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub strict_output: bool,
    #[serde(default)]
    pub contract_repair_attempts: u32,
}

impl BlockDef {
    /// Canonical 16-hex-digit hash over the normalized definition, for
    /// cache and equality checks.
    pub fn definition_hash(&self) -> String {
        let normalized = serde_json::json!({
            "id": self.id,
            "inputs": self.inputs,
            "outputs": self.outputs,
            "agent": self.agent,
            "pre_gates": self.pre_gates,
            "post_gates": self.post_gates,
            "retry": self.retry,
            "strict_output": self.strict_output,
            "contract_repair_attempts": self.contract_repair_attempts,
        });
        let canonical = serde_json::to_string(&normalized).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(&digest[..8])
    }
}

/// A directed connection from an output port to an input port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDef {
    pub from: String,
    pub output: String,
    pub to: String,
    pub input: String,
    /// Safe expression over the scope `{value}` applied to the carried value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

/// A complete pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagDefinition {
    pub name: String,
    pub blocks: Vec<BlockDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<EdgeDef>,
    /// Declared sinks; when present, run completion is judged on these only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terminals: Vec<String>,
}

impl DagDefinition {
    /// Validate uniqueness, edge endpoints, declared ports, terminal names,
    /// and acyclicity.
    pub fn validate(&self) -> DomainResult<()> {
        let mut blocks: HashMap<&str, &BlockDef> = HashMap::new();
        for block in &self.blocks {
            if blocks.insert(block.id.as_str(), block).is_some() {
                return Err(DomainError::Validation(format!(
                    "duplicate block id: {}",
                    block.id
                )));
            }
        }

        for edge in &self.edges {
            let from = blocks.get(edge.from.as_str()).ok_or_else(|| {
                DomainError::Validation(format!("edge references unknown block: {}", edge.from))
            })?;
            let to = blocks.get(edge.to.as_str()).ok_or_else(|| {
                DomainError::Validation(format!("edge references unknown block: {}", edge.to))
            })?;
            if !from.outputs.contains_key(&edge.output) {
                return Err(DomainError::Validation(format!(
                    "block {} has no output port {}",
                    edge.from, edge.output
                )));
            }
            if !to.inputs.contains_key(&edge.input) {
                return Err(DomainError::Validation(format!(
                    "block {} has no input port {}",
                    edge.to, edge.input
                )));
            }
        }

        for terminal in &self.terminals {
            if !blocks.contains_key(terminal.as_str()) {
                return Err(DomainError::Validation(format!(
                    "terminal references unknown block: {terminal}"
                )));
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Kahn topological sort over block ids; cycle → `DomainError::Cycle`.
    pub fn topological_order(&self) -> DomainResult<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> =
            self.blocks.iter().map(|b| (b.id.as_str(), 0)).collect();
        let mut downstream: HashMap<&str, Vec<&str>> = HashMap::new();

        for edge in &self.edges {
            // Parallel edges between the same pair each count.
            *in_degree.entry(edge.to.as_str()).or_insert(0) += 1;
            downstream
                .entry(edge.from.as_str())
                .or_default()
                .push(edge.to.as_str());
        }

        let mut queue: VecDeque<&str> = self
            .blocks
            .iter()
            .map(|b| b.id.as_str())
            .filter(|id| in_degree.get(id).copied().unwrap_or(0) == 0)
            .collect();

        let mut order = Vec::with_capacity(self.blocks.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for next in downstream.get(id).into_iter().flatten() {
                let degree = in_degree.get_mut(next).expect("edge endpoints validated");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != self.blocks.len() {
            let stuck = self
                .blocks
                .iter()
                .map(|b| b.id.as_str())
                .find(|id| !order.iter().any(|o| o.as_str() == *id))
                .unwrap_or("?");
            return Err(DomainError::Cycle(stuck.to_string()));
        }

        Ok(order)
    }

    pub fn block(&self, id: &str) -> Option<&BlockDef> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Edges feeding a given block.
    pub fn incoming_edges(&self, block_id: &str) -> Vec<&EdgeDef> {
        self.edges.iter().filter(|e| e.to == block_id).collect()
    }
}

/// Lifecycle state of a block instance within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Retrying,
}

impl BlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Per-block retry bookkeeping inside a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockRetryState {
    /// Attempts started so far
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Execution metadata recorded on completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockExecution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<serde_json::Value>,
}

/// One block's state within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInstance {
    pub status: BlockStatus,
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_gate_results: Vec<crate::domain::models::gate::GateOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_gate_results: Vec<crate::domain::models::gate::GateOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<BlockExecution>,
    pub retry_state: BlockRetryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BlockInstance {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            status: BlockStatus::Pending,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            pre_gate_results: Vec::new(),
            post_gate_results: Vec::new(),
            execution: None,
            retry_state: BlockRetryState {
                attempt: 0,
                max_attempts,
                next_retry_at: None,
                last_error: None,
            },
            started_at: None,
            completed_at: None,
        }
    }
}

/// Overall status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A materialized execution of a pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagRun {
    pub id: String,
    pub dag_name: String,
    pub status: RunStatus,
    pub blocks: BTreeMap<String, BlockInstance>,
    /// Run-level context consulted during input wiring
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DagRun {
    /// Materialize a fresh run for a definition, one pending instance per
    /// block.
    pub fn new(definition: &DagDefinition, context: BTreeMap<String, serde_json::Value>) -> Self {
        let now = Utc::now();
        let blocks = definition
            .blocks
            .iter()
            .map(|b| (b.id.clone(), BlockInstance::new(b.retry.max_attempts)))
            .collect();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            dag_name: definition.name.clone(),
            status: RunStatus::Pending,
            blocks,
            context,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn instance(&self, block_id: &str) -> Option<&BlockInstance> {
        self.blocks.get(block_id)
    }
}
