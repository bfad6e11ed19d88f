//! Gate definitions, outcomes, and retry policy.
//!
//! A gate is a deterministic check evaluated against a produced artifact
//! `(data, raw)`. Definitions are data; evaluation lives in
//! [`services::gates`](crate::services::gates).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

fn default_threshold() -> f64 {
    0.8
}

/// JSON type names accepted by the structural schema gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Object,
    Array,
    String,
    Number,
    Boolean,
    Null,
}

impl SchemaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Null => "null",
        }
    }

    /// Whether a JSON value matches this type.
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Null => value.is_null(),
        }
    }
}

/// Recursive structural schema for the schema gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDef {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<SchemaType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, SchemaDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<SchemaDef>>,
}

/// A gate definition: one deterministic check against `(data, raw)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateDef {
    /// Structural schema over `data`
    Schema {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        schema: SchemaDef,
    },
    /// Named external validator registered on the runner
    Validator {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        validator: String,
    },
    /// Safe expression over the scope `{data, raw}`; truthy result passes
    Expression {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        expr: String,
    },
    /// Regex over `raw`
    Regex {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flags: Option<String>,
        #[serde(default)]
        invert: bool,
    },
    /// Whitespace-separated word count of `raw` within [min, max]
    WordCount {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<usize>,
    },
    /// Shell command; passes when the exit code matches `expect_exit`
    Command {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default)]
        expect_exit: i32,
    },
    /// LLM review via the injected reviewer; passes when score ≥ threshold
    ExternalReview {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        criteria: Vec<String>,
        #[serde(default = "default_threshold")]
        threshold: f64,
    },
    /// Caller-registered closure, resolved by name on the runner
    Custom {
        name: String,
    },
}

impl GateDef {
    /// Display name of the gate, falling back to the kind.
    pub fn name(&self) -> &str {
        let explicit = match self {
            Self::Schema { name, .. }
            | Self::Validator { name, .. }
            | Self::Expression { name, .. }
            | Self::Regex { name, .. }
            | Self::WordCount { name, .. }
            | Self::Command { name, .. }
            | Self::ExternalReview { name, .. } => name.as_deref(),
            Self::Custom { name } => Some(name.as_str()),
        };
        explicit.unwrap_or_else(|| self.kind())
    }

    /// Kind discriminator as it serializes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Schema { .. } => "schema",
            Self::Validator { .. } => "validator",
            Self::Expression { .. } => "expression",
            Self::Regex { .. } => "regex",
            Self::WordCount { .. } => "word_count",
            Self::Command { .. } => "command",
            Self::ExternalReview { .. } => "external_review",
            Self::Custom { .. } => "custom",
        }
    }
}

/// Result of evaluating one gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub gate_name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub duration_ms: u64,
}

impl GateOutcome {
    pub fn pass(gate_name: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            gate_name: gate_name.into(),
            passed: true,
            reason: None,
            details: None,
            duration_ms,
        }
    }

    pub fn fail(gate_name: impl Into<String>, reason: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            gate_name: gate_name.into(),
            passed: false,
            reason: Some(reason.into()),
            details: None,
            duration_ms,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// One produce→evaluate attempt in a retry loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    pub gates: Vec<GateOutcome>,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_sent: Option<String>,
    pub duration_ms: u64,
}

/// Backoff policy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    None,
    Linear,
    Exponential,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::None
    }
}

impl Backoff {
    /// Delay before the attempt following `attempt` (1-based), in milliseconds.
    pub fn delay_ms(&self, base_delay_ms: u64, attempt: u32) -> u64 {
        match self {
            Self::None => base_delay_ms,
            Self::Linear => base_delay_ms.saturating_mul(u64::from(attempt)),
            Self::Exponential => {
                base_delay_ms.saturating_mul(1_u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX))
            }
        }
    }
}

/// Retry policy for a produce→evaluate loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySpec {
    /// Maximum attempts; 0 is normalized to 1
    pub max: u32,
    /// Compile gate failures into feedback for the next attempt
    #[serde(default)]
    pub feedback: bool,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max: 1,
            feedback: false,
            delay_ms: 0,
            backoff: Backoff::None,
        }
    }
}

impl RetrySpec {
    /// Effective attempt ceiling: always at least one attempt.
    pub fn effective_max(&self) -> u32 {
        self.max.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delays() {
        assert_eq!(Backoff::None.delay_ms(100, 3), 100);
        assert_eq!(Backoff::Linear.delay_ms(100, 3), 300);
        assert_eq!(Backoff::Exponential.delay_ms(100, 1), 100);
        assert_eq!(Backoff::Exponential.delay_ms(100, 2), 200);
        assert_eq!(Backoff::Exponential.delay_ms(100, 4), 800);
    }

    #[test]
    fn retry_spec_normalizes_zero() {
        let spec = RetrySpec {
            max: 0,
            ..Default::default()
        };
        assert_eq!(spec.effective_max(), 1);
    }

    #[test]
    fn gate_def_names() {
        let gate = GateDef::WordCount {
            name: None,
            min: Some(5),
            max: None,
        };
        assert_eq!(gate.name(), "word_count");

        let gate = GateDef::Regex {
            name: Some("has-header".to_string()),
            pattern: "^#".to_string(),
            flags: None,
            invert: false,
        };
        assert_eq!(gate.name(), "has-header");
    }

    #[test]
    fn gate_def_serde_tagging() {
        let json = serde_json::json!({"kind": "word_count", "min": 5});
        let gate: GateDef = serde_json::from_value(json).unwrap();
        assert!(matches!(gate, GateDef::WordCount { min: Some(5), max: None, .. }));

        let json = serde_json::json!({"kind": "external_review", "criteria": ["clear"]});
        let gate: GateDef = serde_json::from_value(json).unwrap();
        match gate {
            GateDef::ExternalReview { threshold, .. } => assert!((threshold - 0.8).abs() < f64::EPSILON),
            other => panic!("unexpected gate: {other:?}"),
        }
    }

    #[test]
    fn schema_type_matching() {
        assert!(SchemaType::Object.matches(&serde_json::json!({})));
        assert!(SchemaType::Array.matches(&serde_json::json!([])));
        assert!(SchemaType::Number.matches(&serde_json::json!(3.5)));
        assert!(!SchemaType::String.matches(&serde_json::json!(3)));
    }
}
