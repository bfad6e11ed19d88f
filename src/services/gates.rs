//! Gate runner: evaluates ordered gate definitions against `(data, raw)`.
//!
//! Gate execution never throws. Every failure, including evaluation
//! errors, is captured as a failed outcome with a reason.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::process::Command;

use crate::domain::models::gate::{GateDef, GateOutcome, SchemaDef};
use crate::domain::ports::{ReviewRequest, Reviewer};
use crate::services::expression;

/// Evaluation mode for a gate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateMode {
    /// Stop on the first failure
    #[default]
    ShortCircuit,
    /// Evaluate every gate and return all results
    RunAll,
}

/// Result of an external structural validator.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub ok: bool,
    pub issues: Vec<String>,
}

/// External validator protocol: anything that can check an input value.
pub trait StructuralValidator: Send + Sync {
    fn check(&self, input: &Value) -> CheckOutcome;
}

/// Caller-supplied custom gate.
pub type CustomGateFn = dyn Fn(&Value, &str) -> GateOutcome + Send + Sync;

/// Evaluates gates in declaration order.
#[derive(Default)]
pub struct GateRunner {
    reviewer: Option<Arc<dyn Reviewer>>,
    validators: HashMap<String, Arc<dyn StructuralValidator>>,
    custom: HashMap<String, Arc<CustomGateFn>>,
}

impl GateRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the reviewer used by external-review gates.
    pub fn with_reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    /// Register an external structural validator by name.
    pub fn register_validator(&mut self, name: impl Into<String>, validator: Arc<dyn StructuralValidator>) {
        self.validators.insert(name.into(), validator);
    }

    /// Register a custom gate closure by name.
    pub fn register_custom(&mut self, name: impl Into<String>, gate: Arc<CustomGateFn>) {
        self.custom.insert(name.into(), gate);
    }

    /// Evaluate `gates` against `(data, raw)`. An empty list yields no
    /// outcomes, which callers treat as passing.
    pub async fn run(
        &self,
        gates: &[GateDef],
        data: &Value,
        raw: &str,
        mode: GateMode,
    ) -> Vec<GateOutcome> {
        let mut outcomes = Vec::with_capacity(gates.len());
        for gate in gates {
            let outcome = self.run_one(gate, data, raw).await;
            let failed = !outcome.passed;
            outcomes.push(outcome);
            if failed && mode == GateMode::ShortCircuit {
                break;
            }
        }
        outcomes
    }

    async fn run_one(&self, gate: &GateDef, data: &Value, raw: &str) -> GateOutcome {
        let name = gate.name().to_string();
        let started = Instant::now();
        let elapsed = |started: Instant| started.elapsed().as_millis() as u64;

        match gate {
            GateDef::Schema { schema, .. } => match check_schema(schema, data, "$") {
                Ok(()) => GateOutcome::pass(name, elapsed(started)),
                Err(path_message) => GateOutcome::fail(name, path_message, elapsed(started)),
            },
            GateDef::Validator { validator, .. } => match self.validators.get(validator) {
                Some(v) => {
                    let outcome = v.check(data);
                    if outcome.ok {
                        GateOutcome::pass(name, elapsed(started))
                    } else {
                        GateOutcome::fail(name, outcome.issues.join("; "), elapsed(started))
                            .with_details(serde_json::json!({"issues": outcome.issues}))
                    }
                }
                None => GateOutcome::fail(
                    name,
                    format!("no validator registered as {validator:?}"),
                    elapsed(started),
                ),
            },
            GateDef::Expression { expr, .. } => {
                let scope = expression::gate_scope(data, raw);
                match expression::evaluate_truthy(expr, &scope) {
                    Ok(true) => GateOutcome::pass(name, elapsed(started)),
                    Ok(false) => GateOutcome::fail(
                        name,
                        format!("expression {expr:?} evaluated to false"),
                        elapsed(started),
                    ),
                    Err(e) => GateOutcome::fail(name, e.to_string(), elapsed(started)),
                }
            }
            GateDef::Regex {
                pattern,
                flags,
                invert,
                ..
            } => match build_regex(pattern, flags.as_deref()) {
                Ok(re) => {
                    let matched = re.is_match(raw);
                    let passed = matched != *invert;
                    if passed {
                        GateOutcome::pass(name, elapsed(started))
                    } else {
                        let reason = if *invert {
                            format!("pattern {pattern:?} matched but must not")
                        } else {
                            format!("pattern {pattern:?} did not match")
                        };
                        GateOutcome::fail(name, reason, elapsed(started))
                    }
                }
                Err(e) => GateOutcome::fail(name, e, elapsed(started)),
            },
            GateDef::WordCount { min, max, .. } => {
                let count = raw.split_whitespace().count();
                if let Some(min) = min {
                    if count < *min {
                        return GateOutcome::fail(
                            name,
                            format!("Word count {count} is below min {min}"),
                            elapsed(started),
                        )
                        .with_details(serde_json::json!({"count": count, "min": min, "max": max}));
                    }
                }
                if let Some(max) = max {
                    if count > *max {
                        return GateOutcome::fail(
                            name,
                            format!("Word count {count} is above max {max}"),
                            elapsed(started),
                        )
                        .with_details(serde_json::json!({"count": count, "min": min, "max": max}));
                    }
                }
                GateOutcome::pass(name, elapsed(started))
            }
            GateDef::Command {
                command,
                cwd,
                env,
                timeout_ms,
                expect_exit,
                ..
            } => {
                self.run_command_gate(&name, command, cwd.as_deref(), env, *timeout_ms, *expect_exit, data, started)
                    .await
            }
            GateDef::ExternalReview {
                criteria,
                threshold,
                ..
            } => match &self.reviewer {
                None => GateOutcome::fail(name, "no provider", elapsed(started)),
                Some(reviewer) => {
                    let request = ReviewRequest {
                        output: raw.to_string(),
                        criteria: criteria.clone(),
                        original_prompt: None,
                    };
                    match reviewer.review(request).await {
                        Ok(verdict) => {
                            let details = serde_json::json!({
                                "score": verdict.score,
                                "threshold": threshold,
                                "criteria_results": verdict
                                    .criteria_results
                                    .iter()
                                    .map(|c| serde_json::json!({
                                        "criterion": c.criterion,
                                        "passed": c.passed,
                                        "reasoning": c.reasoning,
                                    }))
                                    .collect::<Vec<_>>(),
                            });
                            if verdict.score >= *threshold {
                                GateOutcome::pass(name, elapsed(started)).with_details(details)
                            } else {
                                GateOutcome::fail(
                                    name,
                                    format!("score {:.2} below threshold {threshold:.2}", verdict.score),
                                    elapsed(started),
                                )
                                .with_details(details)
                            }
                        }
                        Err(e) => GateOutcome::fail(name, e.to_string(), elapsed(started)),
                    }
                }
            },
            GateDef::Custom { name: custom_name } => match self.custom.get(custom_name) {
                Some(gate) => {
                    let mut outcome = gate(data, raw);
                    outcome.duration_ms = elapsed(started);
                    outcome
                }
                None => GateOutcome::fail(
                    name,
                    format!("no custom gate registered as {custom_name:?}"),
                    elapsed(started),
                ),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_command_gate(
        &self,
        name: &str,
        command_line: &str,
        cwd: Option<&str>,
        env: &std::collections::BTreeMap<String, String>,
        timeout_ms: Option<u64>,
        expect_exit: i32,
        data: &Value,
        started: Instant,
    ) -> GateOutcome {
        let elapsed = |started: Instant| started.elapsed().as_millis() as u64;

        let mut command = Command::new("sh");
        command.arg("-c").arg(command_line);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        command.env("GATE_DATA", serde_json::to_string(data).unwrap_or_default());
        for (key, value) in env {
            command.env(key, value);
        }
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        command.kill_on_drop(true);

        let timeout = Duration::from_millis(timeout_ms.unwrap_or(30_000));
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return GateOutcome::fail(name, e.to_string(), elapsed(started)),
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let exit = output.status.code().unwrap_or(-1);
                if exit == expect_exit {
                    GateOutcome::pass(name, elapsed(started))
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    GateOutcome::fail(
                        name,
                        format!("exit code {exit}, expected {expect_exit}"),
                        elapsed(started),
                    )
                    .with_details(serde_json::json!({
                        "exit_code": exit,
                        "stderr": stderr.trim(),
                    }))
                }
            }
            Ok(Err(e)) => GateOutcome::fail(name, e.to_string(), elapsed(started)),
            Err(_) => GateOutcome::fail(
                name,
                format!("command timed out after {}ms", timeout.as_millis()),
                elapsed(started),
            ),
        }
    }
}

/// Recursive structural check; reports the first failure path.
fn check_schema(schema: &SchemaDef, value: &Value, path: &str) -> Result<(), String> {
    if let Some(expected) = schema.schema_type {
        if !expected.matches(value) {
            return Err(format!("{path}: expected {}, got {}", expected.as_str(), json_type(value)));
        }
    }

    for required in &schema.required {
        let present = value
            .as_object()
            .map(|map| map.contains_key(required))
            .unwrap_or(false);
        if !present {
            return Err(format!("{path}: missing required property {required:?}"));
        }
    }

    if let Some(map) = value.as_object() {
        for (key, child_schema) in &schema.properties {
            if let Some(child) = map.get(key) {
                check_schema(child_schema, child, &format!("{path}.{key}"))?;
            }
        }
    }

    if let (Some(items_schema), Some(items)) = (&schema.items, value.as_array()) {
        for (idx, item) in items.iter().enumerate() {
            check_schema(items_schema, item, &format!("{path}[{idx}]"))?;
        }
    }

    Ok(())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn build_regex(pattern: &str, flags: Option<&str>) -> Result<regex::Regex, String> {
    let mut builder = regex::RegexBuilder::new(pattern);
    if let Some(flags) = flags {
        for flag in flags.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                'x' => {
                    builder.ignore_whitespace(true);
                }
                other => return Err(format!("unsupported regex flag {other:?}")),
            }
        }
    }
    builder.build().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn word_count(min: Option<usize>, max: Option<usize>) -> GateDef {
        GateDef::WordCount { name: None, min, max }
    }

    #[tokio::test]
    async fn empty_gate_list_yields_no_outcomes() {
        let runner = GateRunner::new();
        let outcomes = runner.run(&[], &json!({}), "", GateMode::ShortCircuit).await;
        assert!(outcomes.is_empty());
        assert!(outcomes.iter().all(|o| o.passed));
    }

    #[tokio::test]
    async fn word_count_bounds() {
        let runner = GateRunner::new();
        let gates = [word_count(Some(5), None)];

        let outcomes = runner.run(&gates, &json!({}), "too short", GateMode::ShortCircuit).await;
        assert!(!outcomes[0].passed);
        assert_eq!(
            outcomes[0].reason.as_deref(),
            Some("Word count 2 is below min 5")
        );

        let outcomes = runner
            .run(&gates, &json!({}), "this is a longer answer", GateMode::ShortCircuit)
            .await;
        assert!(outcomes[0].passed);

        let gates = [word_count(None, Some(2))];
        let outcomes = runner.run(&gates, &json!({}), "one two three", GateMode::ShortCircuit).await;
        assert_eq!(
            outcomes[0].reason.as_deref(),
            Some("Word count 3 is above max 2")
        );
    }

    #[tokio::test]
    async fn short_circuit_stops_run_all_continues() {
        let runner = GateRunner::new();
        let gates = [word_count(Some(100), None), word_count(None, Some(100))];

        let outcomes = runner.run(&gates, &json!({}), "short", GateMode::ShortCircuit).await;
        assert_eq!(outcomes.len(), 1);

        let outcomes = runner.run(&gates, &json!({}), "short", GateMode::RunAll).await;
        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].passed);
        assert!(outcomes[1].passed);
    }

    #[tokio::test]
    async fn expression_gate() {
        let runner = GateRunner::new();
        let gates = [GateDef::Expression {
            name: None,
            expr: "data.score >= 0.5 && raw.includes('ok')".to_string(),
        }];

        let outcomes = runner
            .run(&gates, &json!({"score": 0.7}), "looks ok", GateMode::ShortCircuit)
            .await;
        assert!(outcomes[0].passed);

        let outcomes = runner
            .run(&gates, &json!({"score": 0.2}), "looks ok", GateMode::ShortCircuit)
            .await;
        assert!(!outcomes[0].passed);
    }

    #[tokio::test]
    async fn expression_errors_are_captured_not_raised() {
        let runner = GateRunner::new();
        let gates = [GateDef::Expression {
            name: None,
            expr: "process.exit".to_string(),
        }];
        let outcomes = runner.run(&gates, &json!({}), "", GateMode::ShortCircuit).await;
        assert!(!outcomes[0].passed);
        assert!(outcomes[0].reason.is_some());
    }

    #[tokio::test]
    async fn regex_gate_with_invert_and_flags() {
        let runner = GateRunner::new();
        let gates = [GateDef::Regex {
            name: None,
            pattern: "^error".to_string(),
            flags: Some("i".to_string()),
            invert: true,
        }];

        let outcomes = runner.run(&gates, &json!({}), "all good", GateMode::ShortCircuit).await;
        assert!(outcomes[0].passed);

        let outcomes = runner.run(&gates, &json!({}), "Error: boom", GateMode::ShortCircuit).await;
        assert!(!outcomes[0].passed);
    }

    #[tokio::test]
    async fn schema_gate_reports_first_failure_path() {
        let runner = GateRunner::new();
        let schema: SchemaDef = serde_json::from_value(json!({
            "type": "object",
            "required": ["name", "score"],
            "properties": {
                "score": {"type": "number"},
                "tags": {"type": "array", "items": {"type": "string"}}
            }
        }))
        .unwrap();
        let gates = [GateDef::Schema { name: None, schema }];

        let outcomes = runner
            .run(&gates, &json!({"name": "a", "score": 1, "tags": ["x"]}), "", GateMode::ShortCircuit)
            .await;
        assert!(outcomes[0].passed);

        let outcomes = runner
            .run(&gates, &json!({"name": "a"}), "", GateMode::ShortCircuit)
            .await;
        assert!(outcomes[0].reason.as_deref().unwrap().contains("score"));

        let outcomes = runner
            .run(&gates, &json!({"name": "a", "score": 1, "tags": [2]}), "", GateMode::ShortCircuit)
            .await;
        assert!(outcomes[0].reason.as_deref().unwrap().contains("$.tags[0]"));
    }

    #[tokio::test]
    async fn command_gate_exit_codes() {
        let runner = GateRunner::new();
        let gates = [GateDef::Command {
            name: None,
            command: "exit 0".to_string(),
            cwd: None,
            env: Default::default(),
            timeout_ms: None,
            expect_exit: 0,
        }];
        let outcomes = runner.run(&gates, &json!({}), "", GateMode::ShortCircuit).await;
        assert!(outcomes[0].passed);

        let gates = [GateDef::Command {
            name: None,
            command: "exit 2".to_string(),
            cwd: None,
            env: Default::default(),
            timeout_ms: None,
            expect_exit: 0,
        }];
        let outcomes = runner.run(&gates, &json!({}), "", GateMode::ShortCircuit).await;
        assert!(!outcomes[0].passed);
        assert!(outcomes[0].reason.as_deref().unwrap().contains("exit code 2"));
    }

    #[tokio::test]
    async fn command_gate_sees_gate_data() {
        let runner = GateRunner::new();
        let gates = [GateDef::Command {
            name: None,
            command: r#"echo "$GATE_DATA" | grep -q '"ok":true'"#.to_string(),
            cwd: None,
            env: Default::default(),
            timeout_ms: None,
            expect_exit: 0,
        }];
        let outcomes = runner.run(&gates, &json!({"ok": true}), "", GateMode::ShortCircuit).await;
        assert!(outcomes[0].passed, "{:?}", outcomes[0].reason);
    }

    #[tokio::test]
    async fn command_gate_timeout_has_dedicated_reason() {
        let runner = GateRunner::new();
        let gates = [GateDef::Command {
            name: None,
            command: "sleep 5".to_string(),
            cwd: None,
            env: Default::default(),
            timeout_ms: Some(50),
            expect_exit: 0,
        }];
        let outcomes = runner.run(&gates, &json!({}), "", GateMode::ShortCircuit).await;
        assert!(!outcomes[0].passed);
        assert!(outcomes[0].reason.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn external_review_without_provider_fails() {
        let runner = GateRunner::new();
        let gates = [GateDef::ExternalReview {
            name: None,
            criteria: vec!["clear".to_string()],
            threshold: 0.8,
        }];
        let outcomes = runner.run(&gates, &json!({}), "output", GateMode::ShortCircuit).await;
        assert!(!outcomes[0].passed);
        assert_eq!(outcomes[0].reason.as_deref(), Some("no provider"));
    }

    #[tokio::test]
    async fn custom_gate_normalized() {
        let mut runner = GateRunner::new();
        runner.register_custom(
            "has-data",
            Arc::new(|data: &Value, _raw: &str| {
                if data.is_null() {
                    GateOutcome::fail("has-data", "data is null", 0)
                } else {
                    GateOutcome::pass("has-data", 0)
                }
            }),
        );
        let gates = [GateDef::Custom { name: "has-data".to_string() }];

        let outcomes = runner.run(&gates, &json!({"x": 1}), "", GateMode::ShortCircuit).await;
        assert!(outcomes[0].passed);

        let outcomes = runner.run(&gates, &json!(null), "", GateMode::ShortCircuit).await;
        assert!(!outcomes[0].passed);

        let gates = [GateDef::Custom { name: "missing".to_string() }];
        let outcomes = runner.run(&gates, &json!({}), "", GateMode::ShortCircuit).await;
        assert!(!outcomes[0].passed);
    }

    #[tokio::test]
    async fn validator_protocol() {
        struct NonEmpty;
        impl StructuralValidator for NonEmpty {
            fn check(&self, input: &Value) -> CheckOutcome {
                let ok = input.as_object().map(|m| !m.is_empty()).unwrap_or(false);
                CheckOutcome {
                    ok,
                    issues: if ok { vec![] } else { vec!["object is empty".to_string()] },
                }
            }
        }

        let mut runner = GateRunner::new();
        runner.register_validator("non-empty", Arc::new(NonEmpty));
        let gates = [GateDef::Validator {
            name: None,
            validator: "non-empty".to_string(),
        }];

        let outcomes = runner.run(&gates, &json!({"a": 1}), "", GateMode::ShortCircuit).await;
        assert!(outcomes[0].passed);

        let outcomes = runner.run(&gates, &json!({}), "", GateMode::ShortCircuit).await;
        assert!(!outcomes[0].passed);
        assert!(outcomes[0].reason.as_deref().unwrap().contains("empty"));
    }
}
