//! Normalization: AST → spec model
//!
//! Lowers references to semantic names (provider short names, embedded model
//! preferences, bare step ids), substitutes variables from the caller's map
//! or declared defaults, merges repeated `budgets` blocks, and folds loaded
//! modules into the caller's namespace under a `module.<name>.` prefix.

use crate::ast::{AgentflowFile, Expr, NestedBlock, Reference, StateRef, StateRoot};
use crate::model::{
    AgentConfig, BudgetConfig, CapabilityConfig, LlmParams, LlmProviderConfig, ModelPreference,
    PolicyConfig, ProjectConfig, SchemaConfig, ServerAuthConfig, ServerConfig, SideEffect,
    SpecModel, StepType, WorkflowConfig, WorkflowStep,
};
use crate::modules::LoadedModule;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("No value provided for variable '{0}'")]
    MissingVariable(String),

    #[error("Variable '{name}' expects {expected}, got {actual}")]
    VariableType {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Unresolved reference: {0}")]
    Unresolved(String),

    #[error("{path}: {message}")]
    Invalid { path: String, message: String },
}

fn invalid(path: impl Into<String>, message: impl Into<String>) -> NormalizeError {
    NormalizeError::Invalid {
        path: path.into(),
        message: message.into(),
    }
}

/// Everything the normalizer knows about one declared model
#[derive(Debug, Clone)]
struct ModelEntry {
    provider: String,
    id: Expr,
    params: Option<LlmParams>,
}

/// Normalize a merged AST (plus its loaded modules) into the spec model.
///
/// `variables` is the caller-supplied variable map; declared defaults fill
/// the gaps, and a variable that is used but has neither is an error.
pub fn normalize(
    file: &AgentflowFile,
    variables: &BTreeMap<String, Value>,
    modules: &[LoadedModule],
) -> Result<SpecModel, NormalizeError> {
    let metadata = file
        .metadata
        .as_ref()
        .ok_or_else(|| invalid("agentflow", "Missing required 'agentflow' block"))?;

    let mut spec = SpecModel {
        version: metadata
            .version
            .clone()
            .ok_or_else(|| invalid("agentflow.version", "Missing required attribute 'version'"))?,
        project: ProjectConfig {
            name: metadata.project.clone().ok_or_else(|| {
                invalid("agentflow.project", "Missing required attribute 'project'")
            })?,
        },
        providers: BTreeMap::new(),
        servers: Vec::new(),
        capabilities: Vec::new(),
        policies: Vec::new(),
        schemas: Vec::new(),
        agents: Vec::new(),
        workflows: Vec::new(),
    };

    let valuation = build_valuation(file, variables)?;
    let mut model_table: BTreeMap<String, ModelEntry> = BTreeMap::new();

    normalize_namespace(
        file,
        &valuation,
        "",
        modules,
        &mut spec,
        &mut model_table,
    )?;

    tracing::debug!(
        providers = spec.providers.len(),
        agents = spec.agents.len(),
        workflows = spec.workflows.len(),
        "normalization complete"
    );

    Ok(spec)
}

/// Build the variable valuation: supplied values (type-checked against the
/// declaration) with declared defaults filling the rest. Variables without
/// either stay absent and only fail if actually referenced.
pub(crate) fn build_valuation(
    file: &AgentflowFile,
    supplied: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, NormalizeError> {
    let mut valuation = BTreeMap::new();

    for variable in &file.variables {
        if let Some(value) = supplied.get(&variable.name) {
            if let Some(declared) = &variable.var_type {
                let actual = match value {
                    Value::String(_) => "string",
                    Value::Number(_) => "number",
                    Value::Bool(_) => "boolean",
                    Value::Array(_) => "array",
                    Value::Object(_) => "object",
                    Value::Null => "null",
                };
                if actual != declared.as_str() {
                    return Err(NormalizeError::VariableType {
                        name: variable.name.clone(),
                        expected: declared.clone(),
                        actual: actual.to_string(),
                    });
                }
            }
            valuation.insert(variable.name.clone(), value.clone());
        } else if let Some(default) = variable.default.as_ref().and_then(|e| e.literal_value()) {
            valuation.insert(variable.name.clone(), default);
        }
    }

    Ok(valuation)
}

fn normalize_namespace(
    file: &AgentflowFile,
    variables: &BTreeMap<String, Value>,
    prefix: &str,
    children: &[LoadedModule],
    spec: &mut SpecModel,
    model_table: &mut BTreeMap<String, ModelEntry>,
) -> Result<(), NormalizeError> {
    // Children first: their providers/policies/models must exist before this
    // namespace's agents can reference them.
    for child in children {
        let child_prefix = format!("{}module.{}.", prefix, child.name);
        normalize_namespace(
            &child.ast,
            &child.parameters,
            &child_prefix,
            &child.children,
            spec,
            model_table,
        )?;
    }

    normalize_providers(file, variables, prefix, spec)?;
    collect_models(file, variables, prefix, model_table)?;
    normalize_policies(file, prefix, spec)?;
    normalize_servers(file, variables, prefix, spec)?;
    normalize_capabilities(file, prefix, spec)?;
    normalize_schemas(file, prefix, spec);
    normalize_agents(file, variables, prefix, spec, model_table)?;
    normalize_workflows(file, variables, prefix, spec)?;

    Ok(())
}

// ============================================================================
// NAME LOWERING
// ============================================================================

/// Short provider name: vendor for the `default` instance, `vendor_instance`
/// otherwise. `llm.openai` + `production` → `openai_production`.
fn provider_short_name(provider_type: &str, instance: &str) -> String {
    let vendor = provider_vendor(provider_type);
    if instance == "default" {
        vendor.to_string()
    } else {
        format!("{}_{}", vendor, instance)
    }
}

fn provider_vendor(provider_type: &str) -> &str {
    provider_type
        .rsplit('.')
        .next()
        .unwrap_or(provider_type)
}

/// Lower a provider reference (`provider.llm.openai.default`, possibly
/// module-qualified) to its short name within `prefix`.
fn provider_ref_name(prefix: &str, reference: &Reference) -> Result<String, NormalizeError> {
    let parts = &reference.parts;
    let idx = parts
        .iter()
        .position(|p| p == "provider")
        .ok_or_else(|| NormalizeError::Unresolved(reference.path()))?;
    if parts.len() < idx + 3 {
        return Err(NormalizeError::Unresolved(reference.path()));
    }

    let namespace = parts[..idx].join(".");
    let composite = &parts[idx + 1..parts.len() - 1];
    let instance = &parts[parts.len() - 1];
    let short = provider_short_name(&composite.join("."), instance);

    if namespace.is_empty() {
        Ok(format!("{}{}", prefix, short))
    } else {
        Ok(format!("{}{}.{}", prefix, namespace, short))
    }
}

/// Lower an entity reference (`policy.default`, `module.llm.policy.standard`)
/// to its namespaced short name: the kind segment drops out, the module path
/// stays. Within a namespace, `prefix` is prepended.
fn entity_ref_name(prefix: &str, reference: &Reference) -> String {
    let parts = &reference.parts;
    let name = if parts[0] == "module" && parts.len() >= 2 {
        let kind_idx = parts.len() - 2;
        let mut kept: Vec<&str> = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            if i != kind_idx {
                kept.push(part);
            }
        }
        kept.join(".")
    } else {
        parts[1..].join(".")
    };
    format!("{}{}", prefix, name)
}

/// Bare step id from a `step.X` reference
fn step_ref_id(reference: &Reference) -> String {
    reference.parts[1..].join(".")
}

// ============================================================================
// EXPRESSION LOWERING
// ============================================================================

fn value_to_expr(value: &Value, name: &str) -> Result<Expr, NormalizeError> {
    match value {
        Value::String(s) => Ok(Expr::Str(s.clone())),
        Value::Bool(b) => Ok(Expr::Bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Expr::Int(i))
            } else {
                Ok(Expr::Float(n.as_f64().unwrap_or_default()))
            }
        }
        Value::Array(items) => items
            .iter()
            .map(|v| value_to_expr(v, name))
            .collect::<Result<Vec<_>, _>>()
            .map(Expr::Array),
        other => Err(NormalizeError::VariableType {
            name: name.to_string(),
            expected: "string, number, or boolean".to_string(),
            actual: match other {
                Value::Object(_) => "object".to_string(),
                _ => "null".to_string(),
            },
        }),
    }
}

/// Substitute variable references and lower `input.x`/`state.x` data-flow
/// references to state references, recursively through the whole tree.
fn lower_expr(
    expr: &Expr,
    variables: &BTreeMap<String, Value>,
) -> Result<Expr, NormalizeError> {
    match expr {
        Expr::VarRef(var_ref) => match variables.get(&var_ref.name) {
            Some(value) => value_to_expr(value, &var_ref.name),
            None => Err(NormalizeError::MissingVariable(var_ref.name.clone())),
        },
        Expr::Reference(reference) if reference.root() == "input" => Ok(Expr::StateRef(StateRef {
            root: StateRoot::Input,
            path: reference.parts[1..].to_vec(),
        })),
        Expr::Reference(reference) if reference.root() == "state" => Ok(Expr::StateRef(StateRef {
            root: StateRoot::State,
            path: reference.parts[1..].to_vec(),
        })),
        Expr::Array(items) => items
            .iter()
            .map(|item| lower_expr(item, variables))
            .collect::<Result<Vec<_>, _>>()
            .map(Expr::Array),
        Expr::Comparison { op, left, right } => Ok(Expr::Comparison {
            op: *op,
            left: Box::new(lower_expr(left, variables)?),
            right: Box::new(lower_expr(right, variables)?),
        }),
        Expr::And(operands) => operands
            .iter()
            .map(|o| lower_expr(o, variables))
            .collect::<Result<Vec<_>, _>>()
            .map(Expr::And),
        Expr::Or(operands) => operands
            .iter()
            .map(|o| lower_expr(o, variables))
            .collect::<Result<Vec<_>, _>>()
            .map(Expr::Or),
        Expr::Not(inner) => Ok(Expr::Not(Box::new(lower_expr(inner, variables)?))),
        Expr::Conditional {
            condition,
            true_value,
            false_value,
        } => Ok(Expr::Conditional {
            condition: Box::new(lower_expr(condition, variables)?),
            true_value: Box::new(lower_expr(true_value, variables)?),
            false_value: Box::new(lower_expr(false_value, variables)?),
        }),
        other => Ok(other.clone()),
    }
}

fn lower_string(
    expr: &Expr,
    variables: &BTreeMap<String, Value>,
    path: &str,
) -> Result<String, NormalizeError> {
    match lower_expr(expr, variables)? {
        Expr::Str(s) => Ok(s),
        other => Err(invalid(path, format!("expected a string, got {}", other.kind_name()))),
    }
}

fn lower_mapping(
    block: &NestedBlock,
    variables: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Expr>, NormalizeError> {
    let mut mapping = BTreeMap::new();
    for attr in &block.body.attributes {
        mapping.insert(attr.name.clone(), lower_expr(&attr.value, variables)?);
    }
    Ok(mapping)
}

fn parse_params(block: &NestedBlock, path: &str) -> Result<LlmParams, NormalizeError> {
    let mut params = LlmParams::default();
    for attr in &block.body.attributes {
        let field_path = format!("{}.{}", path, attr.name);
        match attr.name.as_str() {
            "temperature" => params.temperature = Some(number_value(&attr.value, &field_path)?),
            "max_tokens" => {
                params.max_tokens = Some(number_value(&attr.value, &field_path)? as u64)
            }
            "top_p" => params.top_p = Some(number_value(&attr.value, &field_path)?),
            other => {
                tracing::warn!(param = other, path = %path, "ignoring unknown model parameter");
            }
        }
    }
    Ok(params)
}

fn number_value(expr: &Expr, path: &str) -> Result<f64, NormalizeError> {
    match expr {
        Expr::Int(n) => Ok(*n as f64),
        Expr::Float(n) => Ok(*n),
        other => Err(invalid(path, format!("expected a number, got {}", other.kind_name()))),
    }
}

// ============================================================================
// PER-KIND NORMALIZATION
// ============================================================================

fn normalize_providers(
    file: &AgentflowFile,
    variables: &BTreeMap<String, Value>,
    prefix: &str,
    spec: &mut SpecModel,
) -> Result<(), NormalizeError> {
    for provider in &file.providers {
        let path = format!("provider.{}", provider.full_name());
        let short = provider_short_name(&provider.provider_type, &provider.name);
        let key = format!("{}{}", prefix, short);

        let api_key_expr = provider
            .body
            .get_attribute("api_key")
            .ok_or_else(|| invalid(format!("{}.api_key", path), "Missing required attribute 'api_key'"))?;
        let api_key = lower_string(api_key_expr, variables, &format!("{}.api_key", path))?;

        let default_params = provider
            .body
            .get_block("params")
            .map(|block| parse_params(block, &format!("{}.params", path)))
            .transpose()?;

        spec.providers.insert(
            key,
            LlmProviderConfig {
                provider_type: provider_vendor(&provider.provider_type).to_string(),
                api_key,
                default_params,
            },
        );
    }
    Ok(())
}

fn collect_models(
    file: &AgentflowFile,
    variables: &BTreeMap<String, Value>,
    prefix: &str,
    model_table: &mut BTreeMap<String, ModelEntry>,
) -> Result<(), NormalizeError> {
    for model in &file.models {
        let path = format!("model.{}", model.name);

        let provider = match model.body.get_attribute("provider") {
            Some(Expr::Reference(reference)) => provider_ref_name(prefix, reference)?,
            Some(other) => {
                return Err(invalid(
                    format!("{}.provider", path),
                    format!("expected a provider reference, got {}", other.kind_name()),
                ))
            }
            None => {
                return Err(invalid(
                    format!("{}.provider", path),
                    "Missing required attribute 'provider'",
                ))
            }
        };

        let id = model
            .body
            .get_attribute("id")
            .ok_or_else(|| invalid(format!("{}.id", path), "Missing required attribute 'id'"))?;
        let id = lower_expr(id, variables)?;

        let params = model
            .body
            .get_block("params")
            .map(|block| parse_params(block, &format!("{}.params", path)))
            .transpose()?;

        model_table.insert(
            format!("{}model.{}", prefix, model.name),
            ModelEntry { provider, id, params },
        );
    }
    Ok(())
}

fn normalize_policies(
    file: &AgentflowFile,
    prefix: &str,
    spec: &mut SpecModel,
) -> Result<(), NormalizeError> {
    for policy in &file.policies {
        let path = format!("policy.{}", policy.name);
        let budget_blocks = policy.body.get_blocks("budgets");

        let budgets = if budget_blocks.is_empty() {
            None
        } else {
            let mut merged = BudgetConfig::default();
            for block in budget_blocks {
                for attr in &block.body.attributes {
                    let field_path = format!("{}.budgets.{}", path, attr.name);
                    match attr.name.as_str() {
                        "max_cost_usd_per_run" => {
                            merged.max_cost_usd_per_run =
                                Some(number_value(&attr.value, &field_path)?)
                        }
                        "max_capability_calls" => {
                            merged.max_capability_calls =
                                Some(number_value(&attr.value, &field_path)? as u64)
                        }
                        "timeout_seconds" => {
                            merged.timeout_seconds =
                                Some(number_value(&attr.value, &field_path)? as u64)
                        }
                        other => {
                            tracing::warn!(budget = other, "ignoring unknown budget dimension");
                        }
                    }
                }
            }
            Some(merged)
        };

        spec.policies.push(PolicyConfig {
            name: format!("{}{}", prefix, policy.name),
            budgets,
        });
    }
    Ok(())
}

fn normalize_servers(
    file: &AgentflowFile,
    variables: &BTreeMap<String, Value>,
    prefix: &str,
    spec: &mut SpecModel,
) -> Result<(), NormalizeError> {
    for server in &file.servers {
        let path = format!("server.{}", server.name);

        let command = match server.body.get_attribute("command") {
            Some(Expr::Array(items)) => {
                let mut command = Vec::new();
                for item in items {
                    command.push(lower_string(item, variables, &format!("{}.command", path))?);
                }
                command
            }
            _ => {
                return Err(invalid(
                    format!("{}.command", path),
                    "command must be an array of strings",
                ))
            }
        };

        let auth = server
            .body
            .get_block("auth")
            .and_then(|block| block.body.get_attribute("token").cloned())
            .map(|token| {
                lower_string(&token, variables, &format!("{}.auth.token", path))
                    .map(|token| ServerAuthConfig { token })
            })
            .transpose()?;

        spec.servers.push(ServerConfig {
            name: format!("{}{}", prefix, server.name),
            server_type: server
                .body
                .get_attribute("type")
                .and_then(|e| e.as_str())
                .map(str::to_string),
            transport: server
                .body
                .get_attribute("transport")
                .and_then(|e| e.as_str())
                .map(str::to_string),
            command,
            auth,
        });
    }
    Ok(())
}

fn normalize_capabilities(
    file: &AgentflowFile,
    prefix: &str,
    spec: &mut SpecModel,
) -> Result<(), NormalizeError> {
    for capability in &file.capabilities {
        let path = format!("capability.{}", capability.name);

        let server = match capability.body.get_attribute("server") {
            Some(Expr::Reference(reference)) => entity_ref_name(prefix, reference),
            _ => {
                return Err(invalid(
                    format!("{}.server", path),
                    "Missing required attribute 'server'",
                ))
            }
        };
        let method = capability
            .body
            .get_attribute("method")
            .and_then(|e| e.as_str())
            .ok_or_else(|| invalid(format!("{}.method", path), "Missing required attribute 'method'"))?
            .to_string();

        let side_effect = match capability
            .body
            .get_attribute("side_effect")
            .and_then(|e| e.as_str())
        {
            Some("write") => SideEffect::Write,
            _ => SideEffect::Read,
        };

        spec.capabilities.push(CapabilityConfig {
            name: format!("{}{}", prefix, capability.name),
            server,
            method,
            side_effect,
            requires_approval: capability
                .body
                .get_attribute("requires_approval")
                .and_then(|e| e.as_bool())
                .unwrap_or(false),
        });
    }
    Ok(())
}

fn normalize_schemas(file: &AgentflowFile, prefix: &str, spec: &mut SpecModel) {
    for schema in &file.schemas {
        let fields = schema
            .fields()
            .into_iter()
            .map(|(name, ty)| (name.to_string(), ty.to_string()))
            .collect();
        spec.schemas.push(SchemaConfig {
            name: format!("{}{}", prefix, schema.name),
            fields,
        });
    }
}

fn normalize_agents(
    file: &AgentflowFile,
    variables: &BTreeMap<String, Value>,
    prefix: &str,
    spec: &mut SpecModel,
    model_table: &BTreeMap<String, ModelEntry>,
) -> Result<(), NormalizeError> {
    for agent in &file.agents {
        let path = format!("agent.{}", agent.name);

        let model_ref = match agent.body.get_attribute("model") {
            Some(Expr::Reference(reference)) => reference,
            _ => {
                return Err(invalid(
                    format!("{}.model", path),
                    "Missing required attribute 'model'",
                ))
            }
        };
        let model_key = format!("{}{}", prefix, model_ref.path());
        let entry = model_table
            .get(&model_key)
            .ok_or_else(|| NormalizeError::Unresolved(model_key.clone()))?;

        // First declared fallback model wins
        let fallback = match agent.body.get_attribute("fallback_models") {
            Some(Expr::Array(items)) => match items.first() {
                Some(Expr::Reference(reference)) => {
                    let key = format!("{}{}", prefix, reference.path());
                    let fallback_entry = model_table
                        .get(&key)
                        .ok_or_else(|| NormalizeError::Unresolved(key.clone()))?;
                    Some(fallback_entry.id.clone())
                }
                _ => None,
            },
            _ => None,
        };

        let own_params = agent
            .body
            .get_block("params")
            .map(|block| parse_params(block, &format!("{}.params", path)))
            .transpose()?;
        let params = match (&own_params, &entry.params) {
            (Some(own), Some(base)) => Some(own.merged_over(base)),
            (Some(own), None) => Some(own.clone()),
            (None, base) => base.clone(),
        };

        let instructions = agent
            .body
            .get_attribute("instructions")
            .map(|e| lower_string(e, variables, &format!("{}.instructions", path)))
            .transpose()?
            .unwrap_or_default();

        let allow = match agent.body.get_attribute("allow") {
            Some(Expr::Array(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Expr::Reference(reference) => Some(entity_ref_name(prefix, reference)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        let policy = match agent.body.get_attribute("policy") {
            Some(Expr::Reference(reference)) => Some(entity_ref_name(prefix, reference)),
            _ => None,
        };

        let output_schema = match agent.body.get_attribute("output_schema") {
            Some(Expr::Reference(reference)) => Some(entity_ref_name(prefix, reference)),
            _ => None,
        };

        spec.agents.push(AgentConfig {
            name: format!("{}{}", prefix, agent.name),
            provider: entry.provider.clone(),
            model: ModelPreference {
                preference: entry.id.clone(),
                fallback,
            },
            params,
            instructions,
            allow,
            policy,
            output_schema,
        });
    }
    Ok(())
}

fn normalize_workflows(
    file: &AgentflowFile,
    variables: &BTreeMap<String, Value>,
    prefix: &str,
    spec: &mut SpecModel,
) -> Result<(), NormalizeError> {
    for workflow in &file.workflows {
        let path = format!("workflow.{}", workflow.name);

        let entry = match workflow.body.get_attribute("entry") {
            Some(Expr::Reference(reference)) => step_ref_id(reference),
            _ => {
                return Err(invalid(
                    format!("{}.entry", path),
                    "Missing required attribute 'entry'",
                ))
            }
        };

        let mut steps = Vec::new();
        for step in &workflow.steps {
            let step_path = format!("{}.step.{}", path, step.step_id);
            let step_type = step
                .step_type()
                .and_then(StepType::parse)
                .ok_or_else(|| invalid(format!("{}.type", step_path), "Invalid step type"))?;

            let mut normalized = WorkflowStep::new(&step.step_id, step_type);

            let step_target = |attr: &str| -> Option<String> {
                match step.body.get_attribute(attr) {
                    Some(Expr::Reference(reference)) => Some(step_ref_id(reference)),
                    _ => None,
                }
            };

            normalized.save_as = step
                .output_blocks()
                .first()
                .and_then(|block| block.label.clone());
            normalized.next = step_target("next");

            match step_type {
                StepType::Llm => {
                    normalized.agent = match step.body.get_attribute("agent") {
                        Some(Expr::Reference(reference)) => Some(entity_ref_name(prefix, reference)),
                        _ => None,
                    };
                    normalized.input = step
                        .input_block()
                        .map(|block| lower_mapping(block, variables))
                        .transpose()?;
                }
                StepType::Call => {
                    normalized.capability = match step.body.get_attribute("capability") {
                        Some(Expr::Reference(reference)) => Some(entity_ref_name(prefix, reference)),
                        _ => None,
                    };
                    normalized.args = step
                        .args_block()
                        .map(|block| lower_mapping(block, variables))
                        .transpose()?;
                }
                StepType::Condition => {
                    normalized.condition = step
                        .body
                        .get_attribute("condition")
                        .map(|e| lower_expr(e, variables))
                        .transpose()?;
                    normalized.on_true = step_target("on_true");
                    normalized.on_false = step_target("on_false");
                }
                StepType::HumanApproval => {
                    normalized.payload = step
                        .body
                        .get_attribute("payload")
                        .map(|e| lower_expr(e, variables))
                        .transpose()?;
                    normalized.on_approve = step_target("on_approve");
                    normalized.on_reject = step_target("on_reject");
                }
                StepType::End => {}
            }

            steps.push(normalized);
        }

        spec.workflows.push(WorkflowConfig {
            name: format!("{}{}", prefix, workflow.name),
            entry,
            steps,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn normalize_source(source: &str) -> SpecModel {
        let file = parse(source, None).unwrap();
        normalize(&file, &BTreeMap::new(), &[]).unwrap()
    }

    #[test]
    fn test_normalizes_provider_short_name() {
        let spec = normalize_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            variable "openai_api_key" { default = "env:OPENAI_API_KEY" }

            provider "llm.openai" "default" {
                api_key = var.openai_api_key
            }
            "#,
        );

        assert!(spec.providers.contains_key("openai"));
        assert_eq!(spec.providers["openai"].api_key, "env:OPENAI_API_KEY");
        assert_eq!(spec.providers["openai"].provider_type, "openai");
    }

    #[test]
    fn test_normalizes_custom_instance_name() {
        let spec = normalize_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            variable "openai_prod_key" { default = "env:OPENAI_PROD_KEY" }

            provider "llm.openai" "production" {
                api_key = var.openai_prod_key
            }
            "#,
        );

        assert!(spec.providers.contains_key("openai_production"));
    }

    #[test]
    fn test_model_info_embedded_in_agent() {
        let spec = normalize_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            variable "openai_api_key" { default = "env:OPENAI_API_KEY" }

            provider "llm.openai" "default" {
                api_key = var.openai_api_key
            }

            model "gpt4" {
                provider = provider.llm.openai.default
                id = "gpt-4o"
                params { temperature = 0.7 }
            }

            agent "assistant" {
                model = model.gpt4
                instructions = "test"
            }

            workflow "ask" {
                entry = step.end
                step "end" { type = "end" }
            }
            "#,
        );

        assert_eq!(spec.agents.len(), 1);
        let agent = &spec.agents[0];
        assert_eq!(agent.provider, "openai");
        assert_eq!(agent.model.preference, Expr::Str("gpt-4o".into()));
        assert_eq!(agent.params.as_ref().unwrap().temperature, Some(0.7));
    }

    #[test]
    fn test_fallback_model_normalized() {
        let spec = normalize_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            variable "openai_api_key" { default = "env:OPENAI_API_KEY" }

            provider "llm.openai" "default" {
                api_key = var.openai_api_key
            }

            model "gpt4" { provider = provider.llm.openai.default id = "gpt-4o" }
            model "gpt4_mini" { provider = provider.llm.openai.default id = "gpt-4o-mini" }

            agent "assistant" {
                model = model.gpt4_mini
                fallback_models = [model.gpt4]
                instructions = "test"
            }

            workflow "ask" {
                entry = step.end
                step "end" { type = "end" }
            }
            "#,
        );

        let agent = &spec.agents[0];
        assert_eq!(agent.model.preference, Expr::Str("gpt-4o-mini".into()));
        assert_eq!(agent.model.fallback, Some(Expr::Str("gpt-4o".into())));
    }

    #[test]
    fn test_normalizes_server() {
        let spec = normalize_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            server "filesystem" {
                type = "mcp"
                transport = "stdio"
                command = ["npx", "server", "/path"]
            }
            "#,
        );

        assert_eq!(spec.servers.len(), 1);
        let server = &spec.servers[0];
        assert_eq!(server.name, "filesystem");
        assert_eq!(server.server_type.as_deref(), Some("mcp"));
        assert_eq!(server.command, vec!["npx", "server", "/path"]);
    }

    #[test]
    fn test_normalizes_capability() {
        let spec = normalize_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            server "fs" { command = ["npx", "server"] }

            capability "write_file" {
                server = server.fs
                method = "write_file"
                side_effect = "write"
                requires_approval = true
            }
            "#,
        );

        let cap = &spec.capabilities[0];
        assert_eq!(cap.name, "write_file");
        assert_eq!(cap.server, "fs");
        assert_eq!(cap.method, "write_file");
        assert_eq!(cap.side_effect, SideEffect::Write);
        assert!(cap.requires_approval);
    }

    #[test]
    fn test_merges_repeated_budgets_blocks() {
        let spec = normalize_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            policy "default" {
                budgets { max_cost_usd_per_run = 0.50 }
                budgets { timeout_seconds = 60 }
                budgets { max_capability_calls = 10 }
            }
            "#,
        );

        let policy = &spec.policies[0];
        assert_eq!(policy.name, "default");
        let budgets = policy.budgets.as_ref().unwrap();
        assert_eq!(budgets.max_cost_usd_per_run, Some(0.50));
        assert_eq!(budgets.timeout_seconds, Some(60));
        assert_eq!(budgets.max_capability_calls, Some(10));
    }

    #[test]
    fn test_normalizes_workflow_steps() {
        let spec = normalize_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            variable "api_key" { default = "env:KEY" }

            provider "llm.openai" "default" { api_key = var.api_key }

            model "gpt4" { provider = provider.llm.openai.default id = "gpt-4o" }

            agent "assistant" {
                model = model.gpt4
                instructions = "test"
            }

            workflow "ask" {
                entry = step.process

                step "process" {
                    type = "llm"
                    agent = agent.assistant
                    input { question = input.question }
                    output "answer" { from = result.text }
                    next = step.end
                }

                step "end" { type = "end" }
            }
            "#,
        );

        let workflow = &spec.workflows[0];
        assert_eq!(workflow.entry, "process");

        let process = workflow.get_step("process").unwrap();
        assert_eq!(process.step_type, StepType::Llm);
        assert_eq!(process.agent.as_deref(), Some("assistant"));
        let input = process.input.as_ref().unwrap();
        assert_eq!(
            input["question"],
            Expr::StateRef(StateRef {
                root: StateRoot::Input,
                path: vec!["question".into()],
            })
        );
        assert_eq!(process.save_as.as_deref(), Some("answer"));
        assert_eq!(process.next.as_deref(), Some("end"));

        assert_eq!(workflow.get_step("end").unwrap().step_type, StepType::End);
    }

    #[test]
    fn test_normalizes_call_step() {
        let spec = normalize_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            server "fs" { command = ["npx", "server"] }

            capability "read_file" {
                server = server.fs
                method = "read"
            }

            workflow "read" {
                entry = step.call

                step "call" {
                    type = "call"
                    capability = capability.read_file
                    args { path = input.file_path }
                    output "content" { from = result.data }
                    next = step.end
                }

                step "end" { type = "end" }
            }
            "#,
        );

        let call = spec.workflows[0].get_step("call").unwrap();
        assert_eq!(call.step_type, StepType::Call);
        assert_eq!(call.capability.as_deref(), Some("read_file"));
        let args = call.args.as_ref().unwrap();
        assert_eq!(
            args["path"],
            Expr::StateRef(StateRef {
                root: StateRoot::Input,
                path: vec!["file_path".into()],
            })
        );
        assert_eq!(call.save_as.as_deref(), Some("content"));
    }

    #[test]
    fn test_normalizes_condition_step() {
        let spec = normalize_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            workflow "route" {
                entry = step.check

                step "check" {
                    type = "condition"
                    condition = $state.value > 0
                    on_true = step.yes
                    on_false = step.no
                }

                step "yes" { type = "end" }
                step "no" { type = "end" }
            }
            "#,
        );

        let check = spec.workflows[0].get_step("check").unwrap();
        assert_eq!(check.step_type, StepType::Condition);
        assert!(check.condition.is_some());
        assert_eq!(check.on_true.as_deref(), Some("yes"));
        assert_eq!(check.on_false.as_deref(), Some("no"));
    }

    #[test]
    fn test_variable_substitution_from_caller() {
        let file = parse(
            r#"
            agentflow { version = "0.1" project = "test" }

            variable "api_key" { type = string sensitive = true }

            provider "llm.openai" "default" { api_key = var.api_key }
            "#,
            None,
        )
        .unwrap();

        let mut variables = BTreeMap::new();
        variables.insert("api_key".to_string(), Value::String("sk-supplied".into()));

        let spec = normalize(&file, &variables, &[]).unwrap();
        assert_eq!(spec.providers["openai"].api_key, "sk-supplied");
    }

    #[test]
    fn test_missing_variable_value_fails() {
        let file = parse(
            r#"
            agentflow { version = "0.1" project = "test" }

            variable "api_key" { type = string sensitive = true }

            provider "llm.openai" "default" { api_key = var.api_key }
            "#,
            None,
        )
        .unwrap();

        let err = normalize(&file, &BTreeMap::new(), &[]).unwrap_err();
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn test_supplied_variable_type_checked() {
        let file = parse(
            r#"
            agentflow { version = "0.1" project = "test" }

            variable "temperature" { type = number }
            "#,
            None,
        )
        .unwrap();

        let mut variables = BTreeMap::new();
        variables.insert("temperature".to_string(), Value::String("hot".into()));

        let err = normalize(&file, &variables, &[]).unwrap_err();
        assert!(err.to_string().contains("expects number"));
    }

    #[test]
    fn test_complete_spec_normalization() {
        let spec = normalize_source(
            r#"
            agentflow { version = "0.2" project = "complete-test" }

            variable "openai_api_key" { default = "env:OPENAI_API_KEY" }

            provider "llm.openai" "default" {
                api_key = var.openai_api_key
            }

            policy "default" {
                budgets { max_cost_usd_per_run = 0.50 }
                budgets { timeout_seconds = 60 }
            }

            model "gpt4_mini" {
                provider = provider.llm.openai.default
                id = "gpt-4o-mini"
                params {
                    temperature = 0.7
                    max_tokens = 2000
                }
            }

            model "gpt4" {
                provider = provider.llm.openai.default
                id = "gpt-4o"
            }

            agent "assistant" {
                model = model.gpt4_mini
                fallback_models = [model.gpt4]
                instructions = "Answer clearly."
                policy = policy.default
            }

            workflow "ask" {
                entry = step.process

                step "process" {
                    type = "llm"
                    agent = agent.assistant
                    input { question = input.question }
                    output "answer" { from = result.text }
                    next = step.end
                }

                step "end" { type = "end" }
            }
            "#,
        );

        assert_eq!(spec.version, "0.2");
        assert_eq!(spec.project.name, "complete-test");
        assert!(spec.providers.contains_key("openai"));
        assert_eq!(spec.policies.len(), 1);

        let agent = &spec.agents[0];
        assert_eq!(agent.name, "assistant");
        assert_eq!(agent.model.preference, Expr::Str("gpt-4o-mini".into()));
        assert_eq!(agent.model.fallback, Some(Expr::Str("gpt-4o".into())));
        assert_eq!(agent.policy.as_deref(), Some("default"));

        assert_eq!(spec.workflows.len(), 1);
        assert_eq!(spec.workflows[0].steps.len(), 2);
    }

    #[test]
    fn test_conditional_model_id_survives() {
        let spec = normalize_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            variable "k" { default = "env:K" }
            provider "llm.openai" "default" { api_key = var.k }

            model "dynamic" {
                provider = provider.llm.openai.default
                id = $input.use_mini ? "gpt-4o-mini" : "gpt-4o"
            }

            agent "assistant" {
                model = model.dynamic
                instructions = "x"
            }

            workflow "ask" {
                entry = step.end
                step "end" { type = "end" }
            }
            "#,
        );

        assert!(matches!(
            spec.agents[0].model.preference,
            Expr::Conditional { .. }
        ));
    }
}
