//! Compiled intermediate representation
//!
//! `CompiledSpec` is the only artifact that crosses into the runtime: fully
//! resolved, credential-resolved, and name-indexed. The engine treats it as
//! immutable for the lifetime of a run. All collections are BTreeMaps so
//! repeated compiles serialize identically.

use crate::ast::Expr;
use crate::model::{BudgetConfig, LlmParams, SideEffect};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

static LIST_TYPE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^list\((\w+)\)$").expect("valid pattern"));

/// Parse a `list(T)` type word, returning the item type
pub fn parse_list_type(type_word: &str) -> Option<String> {
    LIST_TYPE_PATTERN
        .captures(type_word)
        .map(|caps| caps[1].to_string())
}

/// A credential after resolution: which env var it came from (or the
/// `DIRECT_VALUE` marker) and the resolved value, if any.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedCredential {
    pub env_var: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedProvider {
    pub name: String,
    pub provider_type: String,
    pub api_key: ResolvedCredential,
    pub default_params: LlmParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedServer {
    pub name: String,
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<ResolvedCredential>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedCapability {
    pub name: String,
    pub server_name: String,
    pub method_name: String,
    /// Populated by live tool-server introspection, not at compile time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_schema: Option<Value>,
    pub side_effect: SideEffect,
    pub requires_approval: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedPolicy {
    pub name: String,
    pub budgets: BudgetConfig,
}

/// One schema field: a scalar type or a homogeneous list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaField {
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
}

impl SchemaField {
    /// Parse a declared type word (`string`, `number`, `list(boolean)`, ...)
    pub fn parse(type_word: &str) -> Self {
        match parse_list_type(type_word) {
            Some(item_type) => Self {
                field_type: "list".to_string(),
                item_type: Some(item_type),
            },
            None => Self {
                field_type: type_word.to_string(),
                item_type: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedSchema {
    pub name: String,
    pub fields: BTreeMap<String, SchemaField>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedAgent {
    pub name: String,
    pub provider_name: String,
    /// Preferred model id; may be a conditional expression evaluated per run
    pub model_preference: Expr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_fallback: Option<Expr>,
    /// Agent overrides merged over provider defaults, field by field
    pub params: LlmParams,
    pub instructions: String,
    pub allowed_capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema_name: Option<String>,
}

/// One compiled workflow step. A closed union: each variant carries only the
/// fields its type uses, so the engine dispatches exhaustively.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolvedStep {
    Llm {
        id: String,
        agent_name: String,
        input_mapping: BTreeMap<String, Expr>,
        #[serde(skip_serializing_if = "Option::is_none")]
        save_as: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_step: Option<String>,
    },
    Call {
        id: String,
        capability_name: String,
        args_mapping: BTreeMap<String, Expr>,
        #[serde(skip_serializing_if = "Option::is_none")]
        save_as: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_step: Option<String>,
    },
    Condition {
        id: String,
        condition: Expr,
        on_true_step: String,
        on_false_step: String,
    },
    HumanApproval {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Expr>,
        on_approve_step: String,
        on_reject_step: String,
    },
    End {
        id: String,
    },
}

impl ResolvedStep {
    pub fn id(&self) -> &str {
        match self {
            ResolvedStep::Llm { id, .. }
            | ResolvedStep::Call { id, .. }
            | ResolvedStep::Condition { id, .. }
            | ResolvedStep::HumanApproval { id, .. }
            | ResolvedStep::End { id } => id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ResolvedStep::Llm { .. } => "llm",
            ResolvedStep::Call { .. } => "call",
            ResolvedStep::Condition { .. } => "condition",
            ResolvedStep::HumanApproval { .. } => "human_approval",
            ResolvedStep::End { .. } => "end",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedWorkflow {
    pub name: String,
    pub entry_step: String,
    /// Steps indexed by id for O(1) engine lookup
    pub steps: BTreeMap<String, ResolvedStep>,
}

/// The fully compiled project
#[derive(Debug, Clone, Serialize)]
pub struct CompiledSpec {
    pub version: String,
    pub project_name: String,
    pub providers: BTreeMap<String, ResolvedProvider>,
    pub servers: BTreeMap<String, ResolvedServer>,
    pub capabilities: BTreeMap<String, ResolvedCapability>,
    pub policies: BTreeMap<String, ResolvedPolicy>,
    pub schemas: BTreeMap<String, ResolvedSchema>,
    pub agents: BTreeMap<String, ResolvedAgent>,
    pub workflows: BTreeMap<String, ResolvedWorkflow>,
}

impl CompiledSpec {
    /// Render the spec as a JSON tree for inspection. Credential values are
    /// stripped to null unless `expose_secrets` is set.
    pub fn to_json(&self, expose_secrets: bool) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);

        if !expose_secrets {
            if let Some(providers) = value.get_mut("providers").and_then(Value::as_object_mut) {
                for provider in providers.values_mut() {
                    if let Some(api_key) = provider.get_mut("api_key") {
                        api_key["value"] = Value::Null;
                    }
                }
            }
            if let Some(servers) = value.get_mut("servers").and_then(Value::as_object_mut) {
                for server in servers.values_mut() {
                    if let Some(token) = server.get_mut("auth_token") {
                        if !token.is_null() {
                            token["value"] = Value::Null;
                        }
                    }
                }
            }
        }

        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_type() {
        assert_eq!(parse_list_type("list(string)").as_deref(), Some("string"));
        assert_eq!(parse_list_type("list(number)").as_deref(), Some("number"));
        assert_eq!(parse_list_type("string"), None);
        assert_eq!(parse_list_type("list()"), None);
    }

    #[test]
    fn test_schema_field_parse() {
        let scalar = SchemaField::parse("string");
        assert_eq!(scalar.field_type, "string");
        assert_eq!(scalar.item_type, None);

        let list = SchemaField::parse("list(boolean)");
        assert_eq!(list.field_type, "list");
        assert_eq!(list.item_type.as_deref(), Some("boolean"));
    }

    #[test]
    fn test_to_json_strips_credentials() {
        let mut providers = BTreeMap::new();
        providers.insert(
            "openai".to_string(),
            ResolvedProvider {
                name: "openai".to_string(),
                provider_type: "openai".to_string(),
                api_key: ResolvedCredential {
                    env_var: "OPENAI_API_KEY".to_string(),
                    value: Some("sk-secret".to_string()),
                },
                default_params: LlmParams::default(),
            },
        );

        let spec = CompiledSpec {
            version: "0.1".to_string(),
            project_name: "test".to_string(),
            providers,
            servers: BTreeMap::new(),
            capabilities: BTreeMap::new(),
            policies: BTreeMap::new(),
            schemas: BTreeMap::new(),
            agents: BTreeMap::new(),
            workflows: BTreeMap::new(),
        };

        let redacted = spec.to_json(false);
        assert_eq!(
            redacted["providers"]["openai"]["api_key"]["value"],
            Value::Null
        );
        assert_eq!(
            redacted["providers"]["openai"]["api_key"]["env_var"],
            "OPENAI_API_KEY"
        );

        let exposed = spec.to_json(true);
        assert_eq!(
            exposed["providers"]["openai"]["api_key"]["value"],
            "sk-secret"
        );
    }

    #[test]
    fn test_step_accessors() {
        let step = ResolvedStep::Condition {
            id: "check".to_string(),
            condition: Expr::Bool(true),
            on_true_step: "a".to_string(),
            on_false_step: "b".to_string(),
        };
        assert_eq!(step.id(), "check");
        assert_eq!(step.type_name(), "condition");
    }
}
