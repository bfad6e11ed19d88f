//! External reviewer port, consumed by the external-review gate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::errors::DomainResult;
use crate::domain::ports::adapter::CostInfo;

/// What the reviewer is asked to judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub output: String,
    pub criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_prompt: Option<String>,
}

/// Per-criterion verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: String,
    pub passed: bool,
    pub reasoning: String,
}

/// Aggregate reviewer verdict; `score` is in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub passed: bool,
    pub score: f64,
    pub criteria_results: Vec<CriterionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostInfo>,
}

/// An LLM (or otherwise) critique provider.
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, request: ReviewRequest) -> DomainResult<ReviewVerdict>;
}
