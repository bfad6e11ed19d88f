//! Block pipeline engine: readiness, input wiring, gates, and durable
//! per-block retry.
//!
//! The engine never invokes agents itself; it exposes the lifecycle
//! primitives (`start`, `complete`, `fail`) plus a sequential driver
//! ([`DagEngine::execute`]) that wires them to a caller-supplied
//! [`BlockAgent`]. Every mutation is written back through the run
//! repository.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::dag::{
    BlockDef, BlockExecution, BlockStatus, DagDefinition, DagRun, RunStatus,
};
use crate::domain::ports::DagRunRepository;
use crate::services::expression;
use crate::services::gates::{GateMode, GateRunner};

/// Context key prefix for explicit per-block input overrides.
const OVERRIDE_PREFIX: &str = "__override_input_";

/// Executes one block given its wired inputs.
#[async_trait]
pub trait BlockAgent: Send + Sync {
    async fn run(
        &self,
        block: &BlockDef,
        inputs: &BTreeMap<String, Value>,
    ) -> DomainResult<BTreeMap<String, Value>>;
}

pub struct DagEngine {
    runs: Arc<dyn DagRunRepository>,
    gates: Arc<GateRunner>,
}

impl DagEngine {
    pub fn new(runs: Arc<dyn DagRunRepository>, gates: Arc<GateRunner>) -> Self {
        Self { runs, gates }
    }

    /// Validate the definition and materialize a persisted run.
    pub async fn create_run(
        &self,
        definition: &DagDefinition,
        context: BTreeMap<String, Value>,
    ) -> DomainResult<DagRun> {
        definition.validate()?;
        let run = DagRun::new(definition, context);
        self.runs.create_run(&run).await?;
        Ok(run)
    }

    /// Pending blocks whose inputs can all be satisfied right now.
    pub fn ready_blocks(definition: &DagDefinition, run: &DagRun) -> Vec<String> {
        definition
            .blocks
            .iter()
            .filter(|block| {
                run.instance(&block.id)
                    .map(|i| i.status == BlockStatus::Pending)
                    .unwrap_or(false)
            })
            .filter(|block| Self::inputs_satisfied(definition, run, block))
            .map(|block| block.id.clone())
            .collect()
    }

    fn inputs_satisfied(definition: &DagDefinition, run: &DagRun, block: &BlockDef) -> bool {
        block.inputs.iter().all(|(port_name, port)| {
            let edge = definition
                .incoming_edges(&block.id)
                .into_iter()
                .find(|e| e.input == *port_name);

            match edge {
                Some(edge) => run
                    .instance(&edge.from)
                    .map(|source| {
                        source.status == BlockStatus::Completed
                            && source.outputs.contains_key(&edge.output)
                    })
                    .unwrap_or(false),
                None => {
                    !port.required
                        || port.default.is_some()
                        || run.context.contains_key(port_name)
                        || run
                            .context
                            .contains_key(&override_key(&block.id, port_name))
                }
            }
        })
    }

    /// Resolve each input port in precedence order: explicit override,
    /// incoming edge (with transform), run context, declared default.
    /// Unresolvable ports stay absent.
    pub fn wire_inputs(
        definition: &DagDefinition,
        run: &DagRun,
        block: &BlockDef,
    ) -> BTreeMap<String, Value> {
        let mut inputs = BTreeMap::new();
        let edges = definition.incoming_edges(&block.id);

        for (port_name, port) in &block.inputs {
            if let Some(value) = run.context.get(&override_key(&block.id, port_name)) {
                inputs.insert(port_name.clone(), value.clone());
                continue;
            }

            if let Some(edge) = edges.iter().find(|e| e.input == *port_name) {
                let source_value = run
                    .instance(&edge.from)
                    .and_then(|source| source.outputs.get(&edge.output))
                    .cloned();
                if let Some(value) = source_value {
                    inputs.insert(port_name.clone(), apply_transform(edge.transform.as_deref(), value));
                    continue;
                }
            }

            if let Some(value) = run.context.get(port_name) {
                inputs.insert(port_name.clone(), value.clone());
                continue;
            }

            if let Some(default) = &port.default {
                inputs.insert(port_name.clone(), default.clone());
            }
        }

        inputs
    }

    /// Mark a block running: records inputs and start time, counts the
    /// attempt, lifts the run to running.
    pub fn start(run: &mut DagRun, block_id: &str, inputs: BTreeMap<String, Value>) {
        let now = Utc::now();
        if let Some(instance) = run.blocks.get_mut(block_id) {
            instance.status = BlockStatus::Running;
            instance.inputs = inputs;
            instance.started_at = Some(now);
            instance.retry_state.attempt += 1;
            instance.retry_state.next_retry_at = None;
        }
        if run.status == RunStatus::Pending {
            run.status = RunStatus::Running;
        }
        run.updated_at = now;
    }

    /// Mark a block completed with its outputs and execution metadata.
    pub fn complete(
        definition: &DagDefinition,
        run: &mut DagRun,
        block_id: &str,
        outputs: BTreeMap<String, Value>,
        execution: BlockExecution,
    ) {
        let now = Utc::now();
        if let Some(instance) = run.blocks.get_mut(block_id) {
            instance.status = BlockStatus::Completed;
            instance.outputs = outputs;
            instance.execution = Some(execution);
            instance.completed_at = Some(now);
        }
        run.updated_at = now;
        Self::refresh_run_status(definition, run);
    }

    /// Record a failure: schedules a retry when the block has attempts
    /// left, otherwise fails it (and possibly the run).
    pub fn fail(definition: &DagDefinition, run: &mut DagRun, block_id: &str, error: &str) {
        let now = Utc::now();
        let retry = definition
            .block(block_id)
            .map(|b| b.retry.clone())
            .unwrap_or_default();

        if let Some(instance) = run.blocks.get_mut(block_id) {
            instance.retry_state.last_error = Some(error.to_string());
            if instance.retry_state.attempt < retry.max_attempts {
                let delay_ms = retry.next_delay_ms(instance.retry_state.attempt);
                instance.status = BlockStatus::Retrying;
                instance.retry_state.next_retry_at =
                    Some(now + ChronoDuration::milliseconds(delay_ms as i64));
            } else {
                instance.status = BlockStatus::Failed;
                instance.completed_at = Some(now);
            }
        }
        run.updated_at = now;
        Self::refresh_run_status(definition, run);
    }

    /// Mark a block skipped (its subtree is unreachable).
    pub fn skip(definition: &DagDefinition, run: &mut DagRun, block_id: &str) {
        let now = Utc::now();
        if let Some(instance) = run.blocks.get_mut(block_id) {
            if instance.status == BlockStatus::Pending {
                instance.status = BlockStatus::Skipped;
                instance.completed_at = Some(now);
            }
        }
        run.updated_at = now;
        Self::refresh_run_status(definition, run);
    }

    /// Completion predicate: declared terminals when present, every block
    /// otherwise.
    pub fn is_complete(definition: &DagDefinition, run: &DagRun) -> bool {
        let judged: Vec<&str> = if definition.terminals.is_empty() {
            definition.blocks.iter().map(|b| b.id.as_str()).collect()
        } else {
            definition.terminals.iter().map(String::as_str).collect()
        };
        judged.iter().all(|id| {
            run.instance(id)
                .map(|i| matches!(i.status, BlockStatus::Completed | BlockStatus::Skipped))
                .unwrap_or(false)
        })
    }

    /// Recompute the run status. A run fails only when every block is
    /// terminal and at least one failed.
    fn refresh_run_status(definition: &DagDefinition, run: &mut DagRun) {
        if Self::is_complete(definition, run) {
            run.status = RunStatus::Completed;
            return;
        }
        let all_terminal = run.blocks.values().all(|i| i.status.is_terminal());
        let any_failed = run.blocks.values().any(|i| i.status == BlockStatus::Failed);
        if all_terminal && any_failed {
            run.status = RunStatus::Failed;
        }
    }

    /// Drive a run to a terminal state with the given agent, honoring
    /// per-block retry delays. Blocks execute sequentially in readiness
    /// order.
    pub async fn execute(
        &self,
        definition: &DagDefinition,
        mut run: DagRun,
        agent: Arc<dyn BlockAgent>,
    ) -> DomainResult<DagRun> {
        definition.validate()?;

        loop {
            if matches!(run.status, RunStatus::Completed | RunStatus::Failed) {
                break;
            }

            self.revive_due_retries(&mut run);

            let ready = Self::ready_blocks(definition, &run);
            if ready.is_empty() {
                if let Some(next_retry) = earliest_retry(&run) {
                    let wait = (next_retry - Utc::now())
                        .to_std()
                        .unwrap_or(std::time::Duration::from_millis(1));
                    tokio::time::sleep(wait).await;
                    continue;
                }
                // No runnable work and nothing retrying: skip blocks whose
                // upstream can never complete, then re-judge.
                if !self.skip_unreachable(definition, &mut run).await? {
                    Self::refresh_run_status(definition, &mut run);
                    if !matches!(run.status, RunStatus::Completed | RunStatus::Failed) {
                        run.status = RunStatus::Failed;
                        run.updated_at = Utc::now();
                    }
                    self.runs.update_run(&run).await?;
                    break;
                }
                continue;
            }

            for block_id in ready {
                let block = definition
                    .block(&block_id)
                    .ok_or_else(|| DomainError::Validation(format!("unknown block {block_id}")))?;
                self.execute_block(definition, &mut run, block, agent.as_ref()).await?;
                if matches!(run.status, RunStatus::Completed | RunStatus::Failed) {
                    break;
                }
            }
        }

        Ok(run)
    }

    async fn execute_block(
        &self,
        definition: &DagDefinition,
        run: &mut DagRun,
        block: &BlockDef,
        agent: &dyn BlockAgent,
    ) -> DomainResult<()> {
        let inputs = Self::wire_inputs(definition, run, block);
        Self::start(run, &block.id, inputs.clone());
        self.runs.update_run(run).await?;

        let inputs_value = Value::Object(inputs.clone().into_iter().collect());

        // Pre gates see the wired inputs and no outputs yet.
        if !block.pre_gates.is_empty() {
            let scope = serde_json::json!({"inputs": inputs_value.clone()});
            let results = self
                .gates
                .run(&block.pre_gates, &scope, "", GateMode::ShortCircuit)
                .await;
            let failed = results.iter().any(|r| !r.passed);
            if let Some(instance) = run.blocks.get_mut(&block.id) {
                instance.pre_gate_results = results.clone();
            }
            if failed {
                let reason = gate_failure_reason(&results);
                Self::fail(definition, run, &block.id, &format!("pre-gate failed: {reason}"));
                self.runs.update_run(run).await?;
                return Ok(());
            }
        }

        let started = std::time::Instant::now();
        match agent.run(block, &inputs).await {
            Ok(outputs) => {
                if block.strict_output {
                    if let Some(missing) = block.outputs.keys().find(|k| !outputs.contains_key(*k)) {
                        Self::fail(
                            definition,
                            run,
                            &block.id,
                            &format!("missing declared output port {missing:?}"),
                        );
                        self.runs.update_run(run).await?;
                        return Ok(());
                    }
                }

                // Post gates see both sides of the block.
                if !block.post_gates.is_empty() {
                    let outputs_value = Value::Object(outputs.clone().into_iter().collect());
                    let scope = serde_json::json!({
                        "inputs": inputs_value,
                        "outputs": outputs_value.clone(),
                    });
                    let raw = serde_json::to_string(&outputs_value).unwrap_or_default();
                    let results = self
                        .gates
                        .run(&block.post_gates, &scope, &raw, GateMode::ShortCircuit)
                        .await;
                    let failed = results.iter().any(|r| !r.passed);
                    if let Some(instance) = run.blocks.get_mut(&block.id) {
                        instance.post_gate_results = results.clone();
                    }
                    if failed {
                        let reason = gate_failure_reason(&results);
                        Self::fail(definition, run, &block.id, &format!("post-gate failed: {reason}"));
                        self.runs.update_run(run).await?;
                        return Ok(());
                    }
                }

                let execution = BlockExecution {
                    agent: block.agent.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    cost: None,
                };
                Self::complete(definition, run, &block.id, outputs, execution);
            }
            Err(e) => {
                Self::fail(definition, run, &block.id, &e.to_string());
            }
        }
        self.runs.update_run(run).await?;
        Ok(())
    }

    /// Move retrying blocks whose delay has elapsed back to pending.
    fn revive_due_retries(&self, run: &mut DagRun) {
        let now = Utc::now();
        for instance in run.blocks.values_mut() {
            if instance.status == BlockStatus::Retrying {
                let due = instance.retry_state.next_retry_at.map_or(true, |at| at <= now);
                if due {
                    instance.status = BlockStatus::Pending;
                }
            }
        }
    }

    /// Skip pending blocks fed by failed or skipped sources. Returns true
    /// when anything changed.
    async fn skip_unreachable(
        &self,
        definition: &DagDefinition,
        run: &mut DagRun,
    ) -> DomainResult<bool> {
        let mut changed = false;
        let pending: Vec<String> = run
            .blocks
            .iter()
            .filter(|(_, i)| i.status == BlockStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect();

        for block_id in pending {
            let Some(block) = definition.block(&block_id) else { continue };
            let dead_upstream = definition.incoming_edges(&block_id).into_iter().any(|edge| {
                block
                    .inputs
                    .get(&edge.input)
                    .map(|port| port.required)
                    .unwrap_or(false)
                    && run
                        .instance(&edge.from)
                        .map(|i| matches!(i.status, BlockStatus::Failed | BlockStatus::Skipped))
                        .unwrap_or(false)
            });
            if dead_upstream {
                Self::skip(definition, run, &block_id);
                changed = true;
            }
        }

        if changed {
            self.runs.update_run(run).await?;
        }
        Ok(changed)
    }
}

fn override_key(block_id: &str, port_name: &str) -> String {
    format!("{OVERRIDE_PREFIX}{block_id}_{port_name}")
}

/// Apply an edge transform over the scope `{value}`; transform failures
/// fall back to the raw value.
fn apply_transform(transform: Option<&str>, value: Value) -> Value {
    let Some(source) = transform else { return value };
    let mut scope = BTreeMap::new();
    scope.insert("value".to_string(), value.clone());
    match expression::evaluate(source, &scope) {
        Ok(transformed) => transformed,
        Err(e) => {
            tracing::warn!("edge transform {source:?} failed, using raw value: {e}");
            value
        }
    }
}

fn gate_failure_reason(results: &[crate::domain::models::gate::GateOutcome]) -> String {
    results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| format!("{}: {}", r.gate_name, r.reason.as_deref().unwrap_or("failed")))
        .collect::<Vec<_>>()
        .join("; ")
}

fn earliest_retry(run: &DagRun) -> Option<DateTime<Utc>> {
    run.blocks
        .values()
        .filter(|i| i.status == BlockStatus::Retrying)
        .filter_map(|i| i.retry_state.next_retry_at)
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::dag::{BlockRetry, EdgeDef, InputPort, OutputPort};
    use crate::domain::models::Backoff;

    fn port_any(required: bool) -> InputPort {
        InputPort {
            port_type: "any".to_string(),
            default: None,
            required,
        }
    }

    fn two_block_def() -> DagDefinition {
        let mut a = BlockDef {
            id: "a".to_string(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            pre_gates: vec![],
            post_gates: vec![],
            retry: BlockRetry::default(),
            agent: None,
            strict_output: false,
            contract_repair_attempts: 0,
        };
        a.outputs
            .insert("x".to_string(), OutputPort { port_type: "number".to_string() });

        let mut b = a.clone();
        b.id = "b".to_string();
        b.outputs.clear();
        b.inputs.insert("y".to_string(), port_any(true));

        DagDefinition {
            name: "two".to_string(),
            blocks: vec![a, b],
            edges: vec![EdgeDef {
                from: "a".to_string(),
                output: "x".to_string(),
                to: "b".to_string(),
                input: "y".to_string(),
                transform: Some("value + 1".to_string()),
            }],
            terminals: vec![],
        }
    }

    #[test]
    fn readiness_follows_completion() {
        let def = two_block_def();
        let mut run = DagRun::new(&def, BTreeMap::new());

        assert_eq!(DagEngine::ready_blocks(&def, &run), vec!["a"]);

        DagEngine::start(&mut run, "a", BTreeMap::new());
        assert!(DagEngine::ready_blocks(&def, &run).is_empty());

        let mut outputs = BTreeMap::new();
        outputs.insert("x".to_string(), serde_json::json!(1));
        DagEngine::complete(&def, &mut run, "a", outputs, BlockExecution::default());
        assert_eq!(DagEngine::ready_blocks(&def, &run), vec!["b"]);
    }

    #[test]
    fn wiring_applies_transform_and_precedence() {
        let def = two_block_def();
        let mut run = DagRun::new(&def, BTreeMap::new());
        let mut outputs = BTreeMap::new();
        outputs.insert("x".to_string(), serde_json::json!(1));
        DagEngine::start(&mut run, "a", BTreeMap::new());
        DagEngine::complete(&def, &mut run, "a", outputs, BlockExecution::default());

        let block_b = def.block("b").unwrap();
        let inputs = DagEngine::wire_inputs(&def, &run, block_b);
        assert_eq!(inputs.get("y"), Some(&serde_json::json!(2)));

        // Explicit override outranks the edge.
        run.context
            .insert("__override_input_b_y".to_string(), serde_json::json!(99));
        let inputs = DagEngine::wire_inputs(&def, &run, block_b);
        assert_eq!(inputs.get("y"), Some(&serde_json::json!(99)));
    }

    #[test]
    fn bad_transform_falls_back_to_raw_value() {
        assert_eq!(
            apply_transform(Some("value.nope.deep + unknown"), serde_json::json!(5)),
            serde_json::json!(5)
        );
        assert_eq!(apply_transform(None, serde_json::json!(5)), serde_json::json!(5));
    }

    #[test]
    fn context_and_default_wiring() {
        let mut def = two_block_def();
        def.edges.clear();
        {
            let b = def.blocks.iter_mut().find(|b| b.id == "b").unwrap();
            b.inputs.insert(
                "with_default".to_string(),
                InputPort {
                    port_type: "string".to_string(),
                    default: Some(serde_json::json!("fallback")),
                    required: false,
                },
            );
        }
        let mut context = BTreeMap::new();
        context.insert("y".to_string(), serde_json::json!("from-context"));
        let run = DagRun::new(&def, context);

        let inputs = DagEngine::wire_inputs(&def, &run, def.block("b").unwrap());
        assert_eq!(inputs.get("y"), Some(&serde_json::json!("from-context")));
        assert_eq!(inputs.get("with_default"), Some(&serde_json::json!("fallback")));
    }

    #[test]
    fn fail_schedules_retry_then_fails() {
        let mut def = two_block_def();
        def.blocks[0].retry = BlockRetry {
            max_attempts: 2,
            backoff: Backoff::Linear,
            delay_ms: 10,
            max_delay_ms: None,
        };
        let mut run = DagRun::new(&def, BTreeMap::new());

        DagEngine::start(&mut run, "a", BTreeMap::new());
        DagEngine::fail(&def, &mut run, "a", "boom");
        let instance = run.instance("a").unwrap();
        assert_eq!(instance.status, BlockStatus::Retrying);
        assert!(instance.retry_state.next_retry_at.is_some());
        assert_eq!(instance.retry_state.last_error.as_deref(), Some("boom"));

        // Second attempt exhausts the budget.
        DagEngine::start(&mut run, "a", BTreeMap::new());
        DagEngine::fail(&def, &mut run, "a", "boom again");
        assert_eq!(run.instance("a").unwrap().status, BlockStatus::Failed);
    }

    #[test]
    fn run_fails_only_when_all_terminal() {
        let def = two_block_def();
        let mut run = DagRun::new(&def, BTreeMap::new());

        DagEngine::start(&mut run, "a", BTreeMap::new());
        DagEngine::fail(&def, &mut run, "a", "boom");
        // "b" is still pending, so the run is not failed yet.
        assert_ne!(run.status, RunStatus::Failed);

        DagEngine::skip(&def, &mut run, "b");
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[test]
    fn terminal_declaration_narrows_completion() {
        let mut def = two_block_def();
        def.terminals = vec!["a".to_string()];
        let mut run = DagRun::new(&def, BTreeMap::new());

        DagEngine::start(&mut run, "a", BTreeMap::new());
        let mut outputs = BTreeMap::new();
        outputs.insert("x".to_string(), serde_json::json!(1));
        DagEngine::complete(&def, &mut run, "a", outputs, BlockExecution::default());

        assert!(DagEngine::is_complete(&def, &run));
        assert_eq!(run.status, RunStatus::Completed);
    }
}
