//! Symbol resolution
//!
//! Two passes over the merged AST: a registration pass that builds the flat
//! symbol table (fully-qualified dotted name → kind + declaring location),
//! then a reference pass that checks every Reference/VarRef expression
//! against it. All problems are accumulated so one compile attempt reports
//! every resolution error at once; the table is immutable afterwards.

use crate::ast::{AgentflowFile, BlockBody, Expr, Reference, WorkflowBlock};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// What kind of entity a symbol names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Variable,
    Provider,
    Model,
    Agent,
    Policy,
    Server,
    Capability,
    Schema,
    Module,
    Workflow,
    Step,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Variable => "variable",
            SymbolKind::Provider => "provider",
            SymbolKind::Model => "model",
            SymbolKind::Agent => "agent",
            SymbolKind::Policy => "policy",
            SymbolKind::Server => "server",
            SymbolKind::Capability => "capability",
            SymbolKind::Schema => "schema",
            SymbolKind::Module => "module",
            SymbolKind::Workflow => "workflow",
            SymbolKind::Step => "step",
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared symbol and where it came from
#[derive(Debug, Clone)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub file: Option<String>,
    pub line: usize,
    /// Owning workflow for step symbols
    pub parent: Option<String>,
}

/// One resolution problem
#[derive(Debug, Clone)]
pub struct ResolutionIssue {
    /// Dotted path or symbol name the issue is about
    pub path: String,
    pub message: String,
}

impl fmt::Display for ResolutionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Result of symbol resolution. Immutable once built; validation and
/// normalization only read it.
#[derive(Debug, Default)]
pub struct Resolution {
    pub symbols: BTreeMap<String, Symbol>,
    pub errors: Vec<ResolutionIssue>,
    pub warnings: Vec<ResolutionIssue>,
}

impl Resolution {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn get(&self, full_name: &str) -> Option<&Symbol> {
        self.symbols.get(full_name)
    }
}

/// Resolve a merged file with no loaded modules
pub fn resolve(file: &AgentflowFile) -> Resolution {
    resolve_with_modules(file, &[])
}

/// Resolve a merged file, injecting each loaded module's symbols under a
/// `module.<name>.` prefix before the reference pass runs.
pub fn resolve_with_modules(
    file: &AgentflowFile,
    modules: &[(String, &AgentflowFile)],
) -> Resolution {
    let mut resolution = Resolution::default();

    register_symbols(file, &mut resolution);
    for (name, module_ast) in modules {
        add_module_symbols(&mut resolution, name, module_ast);
    }
    check_references(file, &mut resolution);

    tracing::debug!(
        symbols = resolution.symbols.len(),
        errors = resolution.errors.len(),
        "symbol resolution complete"
    );

    resolution
}

/// Inject a loaded module's declared symbols under `module.<name>.`.
/// Namespacing is purely textual prefixing; the module side needs no nesting.
pub fn add_module_symbols(resolution: &mut Resolution, module_name: &str, module_ast: &AgentflowFile) {
    let mut inner = Resolution::default();
    register_symbols(module_ast, &mut inner);

    for (key, symbol) in inner.symbols {
        resolution
            .symbols
            .entry(format!("module.{}.{}", module_name, key))
            .or_insert(symbol);
    }
}

// ============================================================================
// REGISTRATION PASS
// ============================================================================

fn register_symbols(file: &AgentflowFile, resolution: &mut Resolution) {
    for block in &file.variables {
        register(
            resolution,
            SymbolKind::Variable,
            format!("var.{}", block.name),
            &block.name,
            file.file_label.as_deref(),
            block.line,
            None,
        );
    }
    for block in &file.providers {
        register(
            resolution,
            SymbolKind::Provider,
            format!("provider.{}", block.full_name()),
            &block.full_name(),
            file.file_label.as_deref(),
            block.line,
            None,
        );
    }
    for block in &file.models {
        register(
            resolution,
            SymbolKind::Model,
            format!("model.{}", block.name),
            &block.name,
            file.file_label.as_deref(),
            block.line,
            None,
        );
    }
    for block in &file.agents {
        register(
            resolution,
            SymbolKind::Agent,
            format!("agent.{}", block.name),
            &block.name,
            file.file_label.as_deref(),
            block.line,
            None,
        );
    }
    for block in &file.policies {
        register(
            resolution,
            SymbolKind::Policy,
            format!("policy.{}", block.name),
            &block.name,
            file.file_label.as_deref(),
            block.line,
            None,
        );
    }
    for block in &file.servers {
        register(
            resolution,
            SymbolKind::Server,
            format!("server.{}", block.name),
            &block.name,
            file.file_label.as_deref(),
            block.line,
            None,
        );
    }
    for block in &file.capabilities {
        register(
            resolution,
            SymbolKind::Capability,
            format!("capability.{}", block.name),
            &block.name,
            file.file_label.as_deref(),
            block.line,
            None,
        );
    }
    for block in &file.schemas {
        register(
            resolution,
            SymbolKind::Schema,
            format!("schema.{}", block.name),
            &block.name,
            file.file_label.as_deref(),
            block.line,
            None,
        );
    }
    for block in &file.modules {
        register(
            resolution,
            SymbolKind::Module,
            format!("module.{}", block.name),
            &block.name,
            file.file_label.as_deref(),
            block.line,
            None,
        );
    }
    for workflow in &file.workflows {
        register(
            resolution,
            SymbolKind::Workflow,
            format!("workflow.{}", workflow.name),
            &workflow.name,
            file.file_label.as_deref(),
            workflow.line,
            None,
        );

        // Step IDs are scoped per workflow: the same ID may appear in two
        // different workflows, but not twice within one.
        let mut seen_steps: HashSet<&str> = HashSet::new();
        for step in &workflow.steps {
            if !seen_steps.insert(&step.step_id) {
                resolution.errors.push(ResolutionIssue {
                    path: format!("step.{}", step.step_id),
                    message: format!(
                        "Duplicate step '{}' in workflow '{}'",
                        step.step_id, workflow.name
                    ),
                });
                continue;
            }
            resolution
                .symbols
                .entry(format!("step.{}", step.step_id))
                .or_insert(Symbol {
                    kind: SymbolKind::Step,
                    file: file.file_label.clone(),
                    line: step.line,
                    parent: Some(workflow.name.clone()),
                });
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn register(
    resolution: &mut Resolution,
    kind: SymbolKind,
    key: String,
    display_name: &str,
    file: Option<&str>,
    line: usize,
    parent: Option<String>,
) {
    if resolution.symbols.contains_key(&key) {
        resolution.errors.push(ResolutionIssue {
            path: key,
            message: format!("Duplicate {} '{}'", kind, display_name),
        });
        return;
    }
    resolution.symbols.insert(
        key,
        Symbol {
            kind,
            file: file.map(str::to_string),
            line,
            parent,
        },
    );
}

// ============================================================================
// REFERENCE PASS
// ============================================================================

/// Expected symbol kind for a (block kind, attribute name) position
fn expected_kind(block: &str, attr: &str) -> Option<SymbolKind> {
    match (block, attr) {
        ("model", "provider") => Some(SymbolKind::Provider),
        ("agent", "model") | ("agent", "fallback_models") => Some(SymbolKind::Model),
        ("agent", "policy") => Some(SymbolKind::Policy),
        ("agent", "allow") => Some(SymbolKind::Capability),
        ("agent", "output_schema") => Some(SymbolKind::Schema),
        ("capability", "server") => Some(SymbolKind::Server),
        ("step", "agent") => Some(SymbolKind::Agent),
        ("step", "capability") => Some(SymbolKind::Capability),
        _ => None,
    }
}

/// Reference roots that address runtime data flow rather than symbols
/// (`input { question = input.question }`, `output "x" { from = result.text }`)
fn is_data_flow_root(root: &str) -> bool {
    matches!(root, "input" | "result" | "state")
}

fn check_references(file: &AgentflowFile, resolution: &mut Resolution) {
    for block in &file.providers {
        check_body(&block.body, "provider", None, resolution);
    }
    for block in &file.models {
        check_body(&block.body, "model", None, resolution);
    }
    for block in &file.agents {
        check_body(&block.body, "agent", None, resolution);
    }
    for block in &file.policies {
        check_body(&block.body, "policy", None, resolution);
    }
    for block in &file.servers {
        check_body(&block.body, "server", None, resolution);
    }
    for block in &file.capabilities {
        check_body(&block.body, "capability", None, resolution);
    }
    for variable in &file.variables {
        if let Some(default) = &variable.default {
            check_expr(default, None, None, resolution);
        }
    }
    for workflow in &file.workflows {
        check_body(&workflow.body, "workflow", Some(workflow), resolution);
        for step in &workflow.steps {
            check_body(&step.body, "step", Some(workflow), resolution);
        }
    }
}

fn check_body(
    body: &BlockBody,
    block_kind: &str,
    workflow: Option<&WorkflowBlock>,
    resolution: &mut Resolution,
) {
    for attr in &body.attributes {
        let expected = if block_kind == "workflow" && attr.name == "entry" {
            Some(SymbolKind::Step)
        } else if block_kind == "step"
            && matches!(
                attr.name.as_str(),
                "next" | "on_true" | "on_false" | "on_approve" | "on_reject"
            )
        {
            Some(SymbolKind::Step)
        } else {
            expected_kind(block_kind, &attr.name)
        };
        check_expr(&attr.value, expected, workflow, resolution);
    }

    // Nested mapping blocks (input/args/output/params/budgets/auth) carry
    // data-flow expressions; only symbol references inside them are checked.
    for nested in &body.blocks {
        for attr in &nested.body.attributes {
            check_expr(&attr.value, None, workflow, resolution);
        }
    }
}

fn check_expr(
    expr: &Expr,
    expected: Option<SymbolKind>,
    workflow: Option<&WorkflowBlock>,
    resolution: &mut Resolution,
) {
    match expr {
        Expr::Reference(reference) => {
            check_reference(reference, expected, workflow, resolution)
        }
        Expr::VarRef(var_ref) => {
            let key = format!("var.{}", var_ref.name);
            if !resolution.symbols.contains_key(&key) {
                resolution.errors.push(ResolutionIssue {
                    path: key.clone(),
                    message: format!("Unresolved reference: {}", key),
                });
            }
        }
        Expr::Array(items) => {
            for item in items {
                check_expr(item, expected, workflow, resolution);
            }
        }
        Expr::Comparison { left, right, .. } => {
            check_expr(left, None, workflow, resolution);
            check_expr(right, None, workflow, resolution);
        }
        Expr::And(operands) | Expr::Or(operands) => {
            for operand in operands {
                check_expr(operand, None, workflow, resolution);
            }
        }
        Expr::Not(inner) => check_expr(inner, None, workflow, resolution),
        Expr::Conditional {
            condition,
            true_value,
            false_value,
        } => {
            check_expr(condition, None, workflow, resolution);
            check_expr(true_value, None, workflow, resolution);
            check_expr(false_value, None, workflow, resolution);
        }
        Expr::Str(_) | Expr::Int(_) | Expr::Float(_) | Expr::Bool(_) | Expr::StateRef(_) => {}
    }
}

fn check_reference(
    reference: &Reference,
    expected: Option<SymbolKind>,
    workflow: Option<&WorkflowBlock>,
    resolution: &mut Resolution,
) {
    let root = reference.root();

    if is_data_flow_root(root) {
        return;
    }

    // Step references resolve against the enclosing workflow's own steps.
    // The bare id `end` is a terminator sentinel and always resolves.
    if root == "step" {
        let target = reference.parts[1..].join(".");
        let found = target == "end"
            || workflow
                .map(|w| w.get_step(&target).is_some())
                .unwrap_or(false)
            || resolution.symbols.contains_key(&reference.path());
        if !found {
            resolution.errors.push(ResolutionIssue {
                path: reference.path(),
                message: format!("Unresolved reference: {}", reference.path()),
            });
        }
        return;
    }

    // Module-namespaced references: if the fully-qualified symbol is known,
    // kind-check it; otherwise an existing module defers checking to load
    // time, and a missing module is an error.
    if root == "module" {
        if let Some(symbol) = resolution.symbols.get(&reference.path()) {
            check_kind(reference, symbol.kind, expected, resolution);
        } else if reference.parts.len() >= 2 {
            let module_key = format!("module.{}", reference.parts[1]);
            if !resolution.symbols.contains_key(&module_key) {
                resolution.errors.push(ResolutionIssue {
                    path: reference.path(),
                    message: format!("Unresolved reference: {}", reference.path()),
                });
            }
        }
        return;
    }

    match resolution.symbols.get(&reference.path()) {
        Some(symbol) => check_kind(reference, symbol.kind, expected, resolution),
        None => resolution.errors.push(ResolutionIssue {
            path: reference.path(),
            message: format!("Unresolved reference: {}", reference.path()),
        }),
    }
}

fn check_kind(
    reference: &Reference,
    actual: SymbolKind,
    expected: Option<SymbolKind>,
    resolution: &mut Resolution,
) {
    if let Some(expected) = expected {
        if actual != expected {
            resolution.errors.push(ResolutionIssue {
                path: reference.path(),
                message: format!(
                    "Reference '{}' has wrong kind: expected {}, got {}",
                    reference.path(),
                    expected,
                    actual
                ),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn resolve_source(source: &str) -> Resolution {
        resolve(&parse(source, None).unwrap())
    }

    #[test]
    fn test_builds_provider_symbols() {
        let resolution = resolve_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            variable "openai_api_key" { default = "env:OPENAI_API_KEY" }
            variable "anthropic_api_key" { default = "env:ANTHROPIC_API_KEY" }

            provider "llm.openai" "default" {
                api_key = var.openai_api_key
            }

            provider "llm.anthropic" "default" {
                api_key = var.anthropic_api_key
            }
            "#,
        );

        assert!(resolution.symbols.contains_key("provider.llm.openai.default"));
        assert!(resolution.symbols.contains_key("provider.llm.anthropic.default"));
        assert_eq!(
            resolution.symbols["provider.llm.openai.default"].kind,
            SymbolKind::Provider
        );
    }

    #[test]
    fn test_builds_workflow_and_step_symbols() {
        let resolution = resolve_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            agent "test" { model = model.gpt4 instructions = "x" }
            model "gpt4" { provider = provider.llm.openai.default id = "gpt-4o" }
            variable "k" { default = "env:K" }
            provider "llm.openai" "default" { api_key = var.k }

            workflow "ask" {
                entry = step.process
                step "process" { type = "llm" agent = agent.test next = step.end }
                step "end" { type = "end" }
            }
            "#,
        );

        assert!(resolution.symbols.contains_key("workflow.ask"));
        assert!(resolution.symbols.contains_key("step.process"));
        assert!(resolution.symbols.contains_key("step.end"));
        assert_eq!(resolution.symbols["step.process"].kind, SymbolKind::Step);
        assert_eq!(
            resolution.symbols["step.process"].parent.as_deref(),
            Some("ask")
        );
    }

    #[test]
    fn test_detects_duplicate_providers() {
        let resolution = resolve_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            variable "key1" { default = "env:KEY1" }
            variable "key2" { default = "env:KEY2" }

            provider "llm.openai" "default" { api_key = var.key1 }
            provider "llm.openai" "default" { api_key = var.key2 }
            "#,
        );

        assert!(!resolution.is_valid());
        assert!(resolution
            .errors
            .iter()
            .any(|e| e.message.contains("Duplicate provider")));
    }

    #[test]
    fn test_detects_duplicate_models() {
        let resolution = resolve_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            model "gpt4" { provider = provider.llm.openai.default id = "gpt-4o" }
            model "gpt4" { provider = provider.llm.openai.default id = "gpt-4o-mini" }
            "#,
        );

        assert!(!resolution.is_valid());
        assert!(resolution
            .errors
            .iter()
            .any(|e| e.message.contains("Duplicate model")));
    }

    #[test]
    fn test_detects_duplicate_steps_in_workflow() {
        let resolution = resolve_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            workflow "test" {
                entry = step.start
                step "start" { type = "llm" agent = agent.test }
                step "start" { type = "end" }
            }
            "#,
        );

        assert!(!resolution.is_valid());
        assert!(resolution
            .errors
            .iter()
            .any(|e| e.message.contains("Duplicate step")));
    }

    #[test]
    fn test_same_step_id_in_different_workflows_is_fine() {
        let resolution = resolve_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            workflow "a" {
                entry = step.go
                step "go" { type = "end" }
            }
            workflow "b" {
                entry = step.go
                step "go" { type = "end" }
            }
            "#,
        );

        assert!(resolution.is_valid(), "errors: {:?}", resolution.errors);
    }

    #[test]
    fn test_detects_unresolved_provider_reference() {
        let resolution = resolve_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            model "gpt4" {
                provider = provider.llm.nonexistent.default
                id = "gpt-4o"
            }
            "#,
        );

        assert!(!resolution.is_valid());
        assert!(resolution
            .errors
            .iter()
            .any(|e| e.message.contains("Unresolved reference")));
    }

    #[test]
    fn test_detects_unresolved_model_reference() {
        let resolution = resolve_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            agent "assistant" {
                model = model.nonexistent
                instructions = "test"
            }
            "#,
        );

        assert!(!resolution.is_valid());
        assert!(resolution
            .errors
            .iter()
            .any(|e| e.message == "Unresolved reference: model.nonexistent"));
    }

    #[test]
    fn test_detects_unresolved_step_reference() {
        let resolution = resolve_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            workflow "test" {
                entry = step.nonexistent
                step "start" { type = "end" }
            }
            "#,
        );

        assert!(!resolution.is_valid());
        assert!(resolution
            .errors
            .iter()
            .any(|e| e.message.contains("Unresolved reference: step.nonexistent")));
    }

    #[test]
    fn test_detects_wrong_reference_kind() {
        let resolution = resolve_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            policy "default" {
                budgets { timeout_seconds = 60 }
            }

            agent "assistant" {
                model = policy.default
                instructions = "test"
            }
            "#,
        );

        assert!(!resolution.is_valid());
        assert!(resolution
            .errors
            .iter()
            .any(|e| e.message.contains("expected model")));
    }

    #[test]
    fn test_module_symbol_registered() {
        let resolution = resolve_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            module "my-module" {
                source = "./modules/test"
            }
            "#,
        );

        assert!(resolution.symbols.contains_key("module.my-module"));
        assert_eq!(
            resolution.symbols["module.my-module"].kind,
            SymbolKind::Module
        );
    }

    #[test]
    fn test_reference_into_existing_module_defers() {
        let resolution = resolve_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            module "existing" {
                source = "./modules/test"
            }

            policy "default" { budgets { timeout_seconds = 60 } }

            agent "test" {
                model = module.existing.model.default
                policy = policy.default
                instructions = "x"
            }
            "#,
        );

        assert!(resolution.is_valid(), "errors: {:?}", resolution.errors);
    }

    #[test]
    fn test_reference_into_missing_module_fails() {
        let resolution = resolve_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            policy "default" { budgets { timeout_seconds = 60 } }

            agent "test" {
                model = module.nonexistent.model.default
                policy = policy.default
                instructions = "x"
            }
            "#,
        );

        assert!(!resolution.is_valid());
        assert!(resolution
            .errors
            .iter()
            .any(|e| e.message.contains("nonexistent")));
    }

    #[test]
    fn test_add_module_symbols_namespaces() {
        let module_ast = parse(
            r#"
            agentflow { version = "0.1" project = "test-module" }

            variable "k" { default = "env:K" }
            provider "llm.openai" "default" { api_key = var.k }
            model "gpt4" { provider = provider.llm.openai.default id = "gpt-4o" }
            agent "assistant" { model = model.gpt4 policy = policy.default instructions = "x" }
            policy "default" { budgets { timeout_seconds = 60 } }
            "#,
            None,
        )
        .unwrap();

        let main_ast = parse(
            r#"
            agentflow { version = "0.1" project = "main" }

            module "llm" { source = "./modules/llm" }
            "#,
            None,
        )
        .unwrap();

        let mut resolution = resolve(&main_ast);
        add_module_symbols(&mut resolution, "llm", &module_ast);

        assert!(resolution
            .symbols
            .contains_key("module.llm.provider.llm.openai.default"));
        assert!(resolution.symbols.contains_key("module.llm.model.gpt4"));
        assert!(resolution.symbols.contains_key("module.llm.agent.assistant"));
        assert!(resolution.symbols.contains_key("module.llm.policy.default"));
    }

    #[test]
    fn test_unresolved_var_ref() {
        let resolution = resolve_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            provider "llm.openai" "default" {
                api_key = var.never_declared
            }
            "#,
        );

        assert!(!resolution.is_valid());
        assert!(resolution
            .errors
            .iter()
            .any(|e| e.message.contains("var.never_declared")));
    }

    #[test]
    fn test_complete_valid_spec_resolves() {
        let resolution = resolve_source(
            r#"
            agentflow { version = "0.1" project = "test" }

            variable "openai_api_key" { default = "env:OPENAI_API_KEY" }

            provider "llm.openai" "default" {
                api_key = var.openai_api_key
            }

            policy "default" {
                budgets { timeout_seconds = 60 }
            }

            model "gpt4" { provider = provider.llm.openai.default id = "gpt-4o" }
            model "gpt4_mini" { provider = provider.llm.openai.default id = "gpt-4o-mini" }

            agent "assistant" {
                model = model.gpt4_mini
                fallback_models = [model.gpt4]
                instructions = "test"
                policy = policy.default
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

        assert!(resolution.is_valid(), "errors: {:?}", resolution.errors);
        assert!(resolution.errors.is_empty());
    }
}
