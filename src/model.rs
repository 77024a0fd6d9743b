//! Normalized spec model
//!
//! The intermediate shape between the AST and the compiled IR: references
//! have been lowered to semantic names, variables substituted, and repeated
//! `budgets` blocks merged. Produced by the normalizer, consumed by the IR
//! generator.

use crate::ast::Expr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Side-effect classification of a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideEffect {
    Read,
    Write,
}

impl Default for SideEffect {
    fn default() -> Self {
        SideEffect::Read
    }
}

impl fmt::Display for SideEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SideEffect::Read => f.write_str("read"),
            SideEffect::Write => f.write_str("write"),
        }
    }
}

/// The five workflow step kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Llm,
    Call,
    Condition,
    HumanApproval,
    End,
}

impl StepType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "llm" => Some(StepType::Llm),
            "call" => Some(StepType::Call),
            "condition" => Some(StepType::Condition),
            "human_approval" => Some(StepType::HumanApproval),
            "end" => Some(StepType::End),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Llm => "llm",
            StepType::Call => "call",
            StepType::Condition => "condition",
            StepType::HumanApproval => "human_approval",
            StepType::End => "end",
        }
    }
}

/// Model call parameters. Merging is field-by-field: an explicitly set field
/// wins over the base, unset fields fall through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

impl LlmParams {
    /// Overlay `self` on top of `base`, field by field
    pub fn merged_over(&self, base: &LlmParams) -> LlmParams {
        LlmParams {
            temperature: self.temperature.or(base.temperature),
            max_tokens: self.max_tokens.or(base.max_tokens),
            top_p: self.top_p.or(base.top_p),
        }
    }
}

/// Resource ceilings for a policy; each dimension is independently optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost_usd_per_run: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_capability_calls: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
}

/// An LLM provider keyed by its short name (`openai`, `openai_production`)
#[derive(Debug, Clone, Serialize)]
pub struct LlmProviderConfig {
    /// Vendor part of the composite type (`openai` from `llm.openai`)
    pub provider_type: String,
    /// Credential value after variable substitution (`env:NAME` or direct)
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_params: Option<LlmParams>,
}

/// Embedded model choice for an agent. The preferred id may be a conditional
/// expression, evaluated per run.
#[derive(Debug, Clone, Serialize)]
pub struct ModelPreference {
    pub preference: Expr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Expr>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentConfig {
    pub name: String,
    /// Short name of the provider the agent's model runs on
    pub provider: String,
    pub model: ModelPreference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<LlmParams>,
    pub instructions: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerAuthConfig {
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ServerAuthConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityConfig {
    pub name: String,
    pub server: String,
    pub method: String,
    pub side_effect: SideEffect,
    pub requires_approval: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budgets: Option<BudgetConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaConfig {
    pub name: String,
    /// Field name → declared type word (`string`, `list(number)`, ...)
    pub fields: BTreeMap<String, String>,
}

/// One workflow step with only the fields its type uses populated
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<BTreeMap<String, Expr>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<BTreeMap<String, Expr>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Expr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_true: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_false: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Expr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_approve: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_reject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: id.into(),
            step_type,
            agent: None,
            input: None,
            capability: None,
            args: None,
            condition: None,
            on_true: None,
            on_false: None,
            payload: None,
            on_approve: None,
            on_reject: None,
            save_as: None,
            next: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowConfig {
    pub name: String,
    pub entry: String,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowConfig {
    pub fn get_step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// The whole normalized project
#[derive(Debug, Clone, Serialize)]
pub struct SpecModel {
    pub version: String,
    pub project: ProjectConfig,
    pub providers: BTreeMap<String, LlmProviderConfig>,
    pub servers: Vec<ServerConfig>,
    pub capabilities: Vec<CapabilityConfig>,
    pub policies: Vec<PolicyConfig>,
    pub schemas: Vec<SchemaConfig>,
    pub agents: Vec<AgentConfig>,
    pub workflows: Vec<WorkflowConfig>,
}
