//! Structural validation of a merged AST
//!
//! Per-block-kind rules producing path-qualified errors (fatal) and warnings
//! (advisory, never block compilation). Reference existence/kind problems are
//! the resolver's job; this pass checks the shape of each block.

use crate::ast::{AgentflowFile, Expr, StepBlock, WorkflowBlock};
use crate::resolver::Resolution;
use std::fmt;

const VALID_STEP_TYPES: &[&str] = &["llm", "call", "condition", "human_approval", "end"];
const VALID_SCALAR_TYPES: &[&str] = &["string", "number", "boolean"];

/// One validation finding, anchored to a dotted config path
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validation outcome. `is_valid` depends on errors only.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Validate a merged AST against the per-block structural rules.
///
/// `check_env` additionally warns about `env:VAR` defaults whose variable is
/// not present in the process environment.
pub fn validate(file: &AgentflowFile, resolution: &Resolution, check_env: bool) -> ValidationResult {
    let mut result = ValidationResult::default();

    validate_metadata(file, &mut result);
    validate_variables(file, check_env, &mut result);
    validate_providers(file, &mut result);
    validate_models(file, &mut result);
    validate_agents(file, &mut result);
    validate_schemas(file, &mut result);
    validate_capabilities(file, &mut result);
    validate_servers(file, &mut result);
    for workflow in &file.workflows {
        validate_workflow(workflow, &mut result);
    }

    // Resolution problems are fatal too; surface them alongside the
    // structural findings so a single report covers everything.
    for issue in &resolution.errors {
        result.error(issue.path.clone(), issue.message.clone());
    }

    tracing::debug!(
        errors = result.errors.len(),
        warnings = result.warnings.len(),
        "validation complete"
    );

    result
}

fn validate_metadata(file: &AgentflowFile, result: &mut ValidationResult) {
    match &file.metadata {
        None => result.error("agentflow", "Missing required 'agentflow' block"),
        Some(metadata) => {
            if metadata.version.is_none() {
                result.error("agentflow.version", "Missing required attribute 'version'");
            }
            if metadata.project.is_none() {
                result.error("agentflow.project", "Missing required attribute 'project'");
            }
        }
    }
}

fn validate_variables(file: &AgentflowFile, check_env: bool, result: &mut ValidationResult) {
    for variable in &file.variables {
        let path = format!("variable.{}", variable.name);

        if let Some(var_type) = &variable.var_type {
            if !VALID_SCALAR_TYPES.contains(&var_type.as_str()) {
                result.error(
                    format!("{}.type", path),
                    format!(
                        "Invalid variable type '{}' (expected string, number, or boolean)",
                        var_type
                    ),
                );
            }
        }

        match &variable.default {
            None if !variable.sensitive => {
                result.warn(
                    path.clone(),
                    format!("Variable '{}' has no default value", variable.name),
                );
            }
            Some(Expr::Str(default)) if check_env => {
                if let Some(env_var) = crate::credentials::env_var_name(default) {
                    if std::env::var(&env_var).is_err() {
                        result.warn(
                            format!("{}.default", path),
                            format!("Environment variable '{}' is not set", env_var),
                        );
                    }
                }
            }
            _ => {}
        }
    }
}

fn validate_providers(file: &AgentflowFile, result: &mut ValidationResult) {
    for provider in &file.providers {
        let path = format!("provider.{}", provider.full_name());

        match provider.body.get_attribute("api_key") {
            None => result.error(
                format!("{}.api_key", path),
                "Missing required attribute 'api_key'",
            ),
            Some(Expr::VarRef(_)) => {}
            Some(_) => result.error(
                format!("{}.api_key", path),
                "api_key must be a variable reference (var.<name>), not a literal",
            ),
        }
    }
}

fn validate_models(file: &AgentflowFile, result: &mut ValidationResult) {
    for model in &file.models {
        let path = format!("model.{}", model.name);

        if !model.body.has_attribute("provider") {
            result.error(
                format!("{}.provider", path),
                "Missing required attribute 'provider'",
            );
        }
        if !model.body.has_attribute("id") {
            result.error(format!("{}.id", path), "Missing required attribute 'id'");
        }
    }
}

fn validate_agents(file: &AgentflowFile, result: &mut ValidationResult) {
    for agent in &file.agents {
        let path = format!("agent.{}", agent.name);

        if !agent.body.has_attribute("model") {
            result.error(
                format!("{}.model", path),
                "Missing required attribute 'model'",
            );
        }
        if !agent.body.has_attribute("instructions") {
            result.error(
                format!("{}.instructions", path),
                "Missing required attribute 'instructions'",
            );
        }

        if let Some(output_schema) = agent.body.get_attribute("output_schema") {
            let ok = matches!(output_schema, Expr::Reference(r) if r.root() == "schema");
            if !ok {
                result.error(
                    format!("{}.output_schema", path),
                    "output_schema must be a schema reference (schema.<name>)",
                );
            }
        }
    }
}

fn validate_schemas(file: &AgentflowFile, result: &mut ValidationResult) {
    for schema in &file.schemas {
        let path = format!("schema.{}", schema.name);

        if schema.body.attributes.is_empty() {
            result.error(path.clone(), "Schema must declare at least one field");
            continue;
        }

        for attr in &schema.body.attributes {
            let field_path = format!("{}.{}", path, attr.name);
            match attr.value.as_str() {
                Some(type_word) => {
                    if VALID_SCALAR_TYPES.contains(&type_word) {
                        continue;
                    }
                    match crate::ir::parse_list_type(type_word) {
                        Some(item) if VALID_SCALAR_TYPES.contains(&item.as_str()) => {}
                        Some(item) => result.error(
                            field_path,
                            format!("Invalid list item type '{}'", item),
                        ),
                        None => result.error(
                            field_path,
                            format!("Invalid field type '{}'", type_word),
                        ),
                    }
                }
                None => result.error(
                    field_path,
                    format!("Invalid field type '{}'", attr.value),
                ),
            }
        }
    }
}

fn validate_capabilities(file: &AgentflowFile, result: &mut ValidationResult) {
    for capability in &file.capabilities {
        let path = format!("capability.{}", capability.name);

        if !capability.body.has_attribute("server") {
            result.error(
                format!("{}.server", path),
                "Missing required attribute 'server'",
            );
        }
        if !capability.body.has_attribute("method") {
            result.error(
                format!("{}.method", path),
                "Missing required attribute 'method'",
            );
        }
        if let Some(side_effect) = capability
            .body
            .get_attribute("side_effect")
            .and_then(|e| e.as_str())
        {
            if side_effect != "read" && side_effect != "write" {
                result.error(
                    format!("{}.side_effect", path),
                    format!("Invalid side effect '{}' (expected read or write)", side_effect),
                );
            }
        }
    }
}

fn validate_servers(file: &AgentflowFile, result: &mut ValidationResult) {
    for server in &file.servers {
        let path = format!("server.{}", server.name);

        match server.body.get_attribute("command") {
            None => result.error(
                format!("{}.command", path),
                "Missing required attribute 'command'",
            ),
            Some(Expr::Array(_)) => {}
            Some(_) => result.error(
                format!("{}.command", path),
                "command must be an array of strings",
            ),
        }
    }
}

fn validate_workflow(workflow: &WorkflowBlock, result: &mut ValidationResult) {
    let path = format!("workflow.{}", workflow.name);

    if !workflow.body.has_attribute("entry") {
        result.error(
            format!("{}.entry", path),
            "Missing required attribute 'entry'",
        );
    }
    if workflow.steps.is_empty() {
        result.error(path.clone(), "Workflow must contain at least one step");
    }

    for step in &workflow.steps {
        validate_step(&path, step, result);
    }
}

fn validate_step(workflow_path: &str, step: &StepBlock, result: &mut ValidationResult) {
    let path = format!("{}.step.{}", workflow_path, step.step_id);

    let step_type = match step.step_type() {
        None => {
            result.error(format!("{}.type", path), "Missing required attribute 'type'");
            return;
        }
        Some(t) => t,
    };

    if !VALID_STEP_TYPES.contains(&step_type) {
        result.error(
            format!("{}.type", path),
            format!(
                "Invalid step type '{}' (expected one of: {})",
                step_type,
                VALID_STEP_TYPES.join(", ")
            ),
        );
        return;
    }

    let require = |name: &str, result: &mut ValidationResult| {
        if !step.body.has_attribute(name) {
            result.error(
                format!("{}.{}", path, name),
                format!("Missing required attribute '{}'", name),
            );
        }
    };

    match step_type {
        "llm" => require("agent", result),
        "call" => require("capability", result),
        "condition" => {
            require("condition", result);
            require("on_true", result);
            require("on_false", result);
        }
        "human_approval" => {
            require("on_approve", result);
            require("on_reject", result);
        }
        "end" => {}
        _ => unreachable!("step type checked above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::resolver::resolve;

    fn validate_source(source: &str) -> ValidationResult {
        let file = parse(source, None).unwrap();
        let resolution = resolve(&file);
        validate(&file, &resolution, false)
    }

    #[test]
    fn test_missing_metadata_block() {
        let result = validate_source(
            r#"
            variable "api_key" { type = string }
            provider "llm.openai" "default" { api_key = var.api_key }
            "#,
        );

        assert!(!result.is_valid());
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("Missing required 'agentflow' block")));
    }

    #[test]
    fn test_missing_version_and_project_paths() {
        let result = validate_source("agentflow { project = \"test\" }");
        assert!(result.errors.iter().any(|e| e.path.contains("version")));

        let result = validate_source("agentflow { version = \"0.1\" }");
        assert!(result.errors.iter().any(|e| e.path.contains("project")));
    }

    #[test]
    fn test_provider_missing_api_key() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            provider "llm.openai" "default" { }
            "#,
        );

        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.path.contains("api_key")));
    }

    #[test]
    fn test_provider_api_key_must_be_var_ref() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            provider "llm.openai" "default" { api_key = "hardcoded-key" }
            "#,
        );

        assert!(!result.is_valid());
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("variable reference")));
    }

    #[test]
    fn test_model_requires_provider_and_id() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            model "gpt4" { id = "gpt-4o" }
            "#,
        );
        assert!(result.errors.iter().any(|e| e.path.contains("provider")));

        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            variable "k" { default = "x" }
            provider "llm.openai" "default" { api_key = var.k }
            model "gpt4" { provider = provider.llm.openai.default }
            "#,
        );
        assert!(result.errors.iter().any(|e| e.path.contains("id")));
    }

    #[test]
    fn test_agent_requires_model_and_instructions() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            agent "assistant" { instructions = "test" }
            "#,
        );
        assert!(result.errors.iter().any(|e| e.path.contains("model")));

        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            variable "k" { default = "x" }
            provider "llm.openai" "default" { api_key = var.k }
            model "gpt4" { provider = provider.llm.openai.default id = "x" }
            agent "assistant" { model = model.gpt4 }
            "#,
        );
        assert!(result.errors.iter().any(|e| e.path.contains("instructions")));
    }

    #[test]
    fn test_agent_output_schema_must_be_reference() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            variable "k" { default = "x" }
            provider "llm.openai" "default" { api_key = var.k }
            model "gpt4" { provider = provider.llm.openai.default id = "x" }
            agent "assistant" {
                model = model.gpt4
                instructions = "x"
                output_schema = "person"
            }
            "#,
        );

        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("schema reference")));
    }

    #[test]
    fn test_workflow_requires_entry_and_steps() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            workflow "ask" {
                step "process" { type = "end" }
            }
            "#,
        );
        assert!(result.errors.iter().any(|e| e.path.contains("entry")));

        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            workflow "ask" {
                entry = step.process
            }
            "#,
        );
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("at least one step")));
    }

    #[test]
    fn test_step_requires_type() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            workflow "ask" {
                entry = step.process
                step "process" {
                }
            }
            "#,
        );

        assert!(result
            .errors
            .iter()
            .any(|e| e.path.contains("type") && e.message.contains("Missing")));
    }

    #[test]
    fn test_invalid_step_type() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            workflow "ask" {
                entry = step.process
                step "process" {
                    type = "invalid_type"
                }
            }
            "#,
        );

        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("Invalid step type")));
    }

    #[test]
    fn test_llm_step_requires_agent() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            workflow "ask" {
                entry = step.process
                step "process" { type = "llm" }
            }
            "#,
        );

        assert!(result.errors.iter().any(|e| e.path.ends_with(".agent")));
    }

    #[test]
    fn test_call_step_requires_capability() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            workflow "ask" {
                entry = step.call
                step "call" { type = "call" }
            }
            "#,
        );

        assert!(result.errors.iter().any(|e| e.path.ends_with(".capability")));
    }

    #[test]
    fn test_condition_step_requires_condition() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            workflow "ask" {
                entry = step.route
                step "route" {
                    type = "condition"
                    on_true = step.a
                    on_false = step.b
                }
                step "a" { type = "end" }
                step "b" { type = "end" }
            }
            "#,
        );

        assert!(result.errors.iter().any(|e| e.path.ends_with(".condition")));
    }

    #[test]
    fn test_approval_step_requires_branches() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            workflow "ask" {
                entry = step.gate
                step "gate" { type = "human_approval" }
            }
            "#,
        );

        assert!(result.errors.iter().any(|e| e.path.ends_with(".on_approve")));
        assert!(result.errors.iter().any(|e| e.path.ends_with(".on_reject")));
    }

    #[test]
    fn test_invalid_variable_type() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            variable "test" { type = invalid_type }
            "#,
        );

        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("Invalid variable type")));
    }

    #[test]
    fn test_variable_without_default_warns() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            variable "test" { type = string }
            "#,
        );

        assert!(result.is_valid());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("no default value")));
    }

    #[test]
    fn test_sensitive_variable_without_default_is_quiet() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            variable "secret" { type = string sensitive = true }
            "#,
        );

        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_schema_needs_fields() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            schema "empty" { }
            "#,
        );

        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("at least one field")));
    }

    #[test]
    fn test_schema_field_types() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            schema "data" {
                ok_scalar = string
                ok_list = list(number)
                bad = banana
                bad_list = list(banana)
            }
            "#,
        );

        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("Invalid field type 'banana'")));
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("Invalid list item type 'banana'")));
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_valid_minimal_spec_passes() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            variable "openai_api_key" {
                type = string
                sensitive = true
            }

            provider "llm.openai" "default" {
                api_key = var.openai_api_key
            }

            model "gpt4" {
                provider = provider.llm.openai.default
                id = "gpt-4o"
            }

            agent "assistant" {
                model = model.gpt4
                instructions = "Answer clearly."
            }

            workflow "ask" {
                entry = step.process
                step "process" {
                    type = "llm"
                    agent = agent.assistant
                    next = step.end
                }
                step "end" { type = "end" }
            }
            "#,
        );

        assert!(result.is_valid(), "errors: {:?}", result.errors);
    }

    #[test]
    fn test_resolution_errors_are_included() {
        let result = validate_source(
            r#"
            agentflow { version = "0.1" project = "test" }
            agent "assistant" {
                model = model.nonexistent
                instructions = "test"
            }
            "#,
        );

        assert!(!result.is_valid());
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("Unresolved reference")));
    }
}
