//! IR generation from the normalized spec model
//!
//! Resolves credentials (env-var indirection), merges agent parameter
//! overrides onto provider defaults field by field, and indexes workflow
//! steps by id. Validation has already run; anything structural that fails
//! here is a defensive invariant violation.

use crate::credentials::{env_var_name, resolve_env_var, DIRECT_VALUE};
use crate::ir::{
    CompiledSpec, ResolvedAgent, ResolvedCapability, ResolvedCredential, ResolvedPolicy,
    ResolvedProvider, ResolvedSchema, ResolvedServer, ResolvedStep, ResolvedWorkflow, SchemaField,
};
use crate::model::{LlmParams, SpecModel, StepType, WorkflowStep};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IrGenError {
    #[error("Provider '{provider}' not found for agent '{agent}'")]
    MissingProvider { provider: String, agent: String },

    #[error("Step '{step}' in workflow '{workflow}' is missing required field '{field}'")]
    IncompleteStep {
        workflow: String,
        step: String,
        field: &'static str,
    },
}

/// Generate the compiled spec.
///
/// `resolve_credentials` controls whether `env:NAME` indirections are looked
/// up in the process environment; absence leaves the value unresolved.
pub fn generate_ir(spec: &SpecModel, resolve_credentials: bool) -> Result<CompiledSpec, IrGenError> {
    let mut providers = BTreeMap::new();
    for (name, provider) in &spec.providers {
        providers.insert(
            name.clone(),
            ResolvedProvider {
                name: name.clone(),
                provider_type: provider.provider_type.clone(),
                api_key: resolve_credential(&provider.api_key, resolve_credentials),
                default_params: provider.default_params.clone().unwrap_or_default(),
            },
        );
    }

    let mut servers = BTreeMap::new();
    for server in &spec.servers {
        servers.insert(
            server.name.clone(),
            ResolvedServer {
                name: server.name.clone(),
                command: server.command.clone(),
                auth_token: server
                    .auth
                    .as_ref()
                    .map(|auth| resolve_credential(&auth.token, resolve_credentials)),
            },
        );
    }

    let mut capabilities = BTreeMap::new();
    for capability in &spec.capabilities {
        capabilities.insert(
            capability.name.clone(),
            ResolvedCapability {
                name: capability.name.clone(),
                server_name: capability.server.clone(),
                method_name: capability.method.clone(),
                method_schema: None, // populated by live server introspection
                side_effect: capability.side_effect,
                requires_approval: capability.requires_approval,
            },
        );
    }

    let mut policies = BTreeMap::new();
    for policy in &spec.policies {
        policies.insert(
            policy.name.clone(),
            ResolvedPolicy {
                name: policy.name.clone(),
                budgets: policy.budgets.clone().unwrap_or_default(),
            },
        );
    }

    let mut schemas = BTreeMap::new();
    for schema in &spec.schemas {
        let fields: BTreeMap<String, SchemaField> = schema
            .fields
            .iter()
            .map(|(name, type_word)| (name.clone(), SchemaField::parse(type_word)))
            .collect();
        schemas.insert(
            schema.name.clone(),
            ResolvedSchema {
                name: schema.name.clone(),
                fields,
            },
        );
    }

    let mut agents = BTreeMap::new();
    for agent in &spec.agents {
        let provider = providers.get(&agent.provider).ok_or_else(|| {
            // Unreachable if validation ran; kept as an invariant check
            IrGenError::MissingProvider {
                provider: agent.provider.clone(),
                agent: agent.name.clone(),
            }
        })?;

        let params = match &agent.params {
            Some(own) => own.merged_over(&provider.default_params),
            None => provider.default_params.clone(),
        };

        agents.insert(
            agent.name.clone(),
            ResolvedAgent {
                name: agent.name.clone(),
                provider_name: agent.provider.clone(),
                model_preference: agent.model.preference.clone(),
                model_fallback: agent.model.fallback.clone(),
                params,
                instructions: agent.instructions.clone(),
                allowed_capabilities: agent.allow.clone(),
                policy_name: agent.policy.clone(),
                output_schema_name: agent.output_schema.clone(),
            },
        );
    }

    let mut workflows = BTreeMap::new();
    for workflow in &spec.workflows {
        let mut steps = BTreeMap::new();
        for step in &workflow.steps {
            steps.insert(step.id.clone(), resolve_step(&workflow.name, step)?);
        }
        workflows.insert(
            workflow.name.clone(),
            ResolvedWorkflow {
                name: workflow.name.clone(),
                entry_step: workflow.entry.clone(),
                steps,
            },
        );
    }

    tracing::debug!(
        project = %spec.project.name,
        providers = providers.len(),
        agents = agents.len(),
        workflows = workflows.len(),
        "IR generation complete"
    );

    Ok(CompiledSpec {
        version: spec.version.clone(),
        project_name: spec.project.name.clone(),
        providers,
        servers,
        capabilities,
        policies,
        schemas,
        agents,
        workflows,
    })
}

fn resolve_credential(raw: &str, resolve: bool) -> ResolvedCredential {
    match env_var_name(raw) {
        Some(env_var) => {
            let value = if resolve {
                resolve_env_var(raw, false).ok().flatten()
            } else {
                None
            };
            ResolvedCredential { env_var, value }
        }
        // Direct value, already substituted by variable resolution
        None => ResolvedCredential {
            env_var: DIRECT_VALUE.to_string(),
            value: Some(raw.to_string()),
        },
    }
}

fn resolve_step(workflow: &str, step: &WorkflowStep) -> Result<ResolvedStep, IrGenError> {
    let missing = |field: &'static str| IrGenError::IncompleteStep {
        workflow: workflow.to_string(),
        step: step.id.clone(),
        field,
    };

    Ok(match step.step_type {
        StepType::Llm => ResolvedStep::Llm {
            id: step.id.clone(),
            agent_name: step.agent.clone().ok_or_else(|| missing("agent"))?,
            input_mapping: step.input.clone().unwrap_or_default(),
            save_as: step.save_as.clone(),
            next_step: step.next.clone(),
        },
        StepType::Call => ResolvedStep::Call {
            id: step.id.clone(),
            capability_name: step.capability.clone().ok_or_else(|| missing("capability"))?,
            args_mapping: step.args.clone().unwrap_or_default(),
            save_as: step.save_as.clone(),
            next_step: step.next.clone(),
        },
        StepType::Condition => ResolvedStep::Condition {
            id: step.id.clone(),
            condition: step.condition.clone().ok_or_else(|| missing("condition"))?,
            on_true_step: step.on_true.clone().ok_or_else(|| missing("on_true"))?,
            on_false_step: step.on_false.clone().ok_or_else(|| missing("on_false"))?,
        },
        StepType::HumanApproval => ResolvedStep::HumanApproval {
            id: step.id.clone(),
            payload: step.payload.clone(),
            on_approve_step: step.on_approve.clone().ok_or_else(|| missing("on_approve"))?,
            on_reject_step: step.on_reject.clone().ok_or_else(|| missing("on_reject"))?,
        },
        StepType::End => ResolvedStep::End {
            id: step.id.clone(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expr;
    use crate::model::{
        AgentConfig, BudgetConfig, CapabilityConfig, LlmProviderConfig, ModelPreference,
        PolicyConfig, ProjectConfig, ServerAuthConfig, ServerConfig, SideEffect, SpecModel,
    };

    fn minimal_spec() -> SpecModel {
        SpecModel {
            version: "0.1".to_string(),
            project: ProjectConfig {
                name: "test".to_string(),
            },
            providers: BTreeMap::new(),
            servers: Vec::new(),
            capabilities: Vec::new(),
            policies: Vec::new(),
            schemas: Vec::new(),
            agents: Vec::new(),
            workflows: Vec::new(),
        }
    }

    #[test]
    fn test_minimal_spec() {
        let ir = generate_ir(&minimal_spec(), false).unwrap();

        assert_eq!(ir.version, "0.1");
        assert_eq!(ir.project_name, "test");
        assert!(ir.providers.is_empty());
        assert!(ir.servers.is_empty());
        assert!(ir.capabilities.is_empty());
        assert!(ir.policies.is_empty());
        assert!(ir.agents.is_empty());
        assert!(ir.workflows.is_empty());
    }

    #[test]
    fn test_provider_credential_resolution() {
        std::env::set_var("AGENTFLOW_IRGEN_KEY", "sk-test123");

        let mut spec = minimal_spec();
        spec.providers.insert(
            "openai".to_string(),
            LlmProviderConfig {
                provider_type: "openai".to_string(),
                api_key: "env:AGENTFLOW_IRGEN_KEY".to_string(),
                default_params: Some(LlmParams {
                    temperature: Some(0.7),
                    max_tokens: Some(2000),
                    top_p: None,
                }),
            },
        );

        let ir = generate_ir(&spec, true).unwrap();
        let provider = &ir.providers["openai"];
        assert_eq!(provider.api_key.env_var, "AGENTFLOW_IRGEN_KEY");
        assert_eq!(provider.api_key.value.as_deref(), Some("sk-test123"));
        assert_eq!(provider.default_params.temperature, Some(0.7));

        std::env::remove_var("AGENTFLOW_IRGEN_KEY");
    }

    #[test]
    fn test_provider_without_credential_resolution() {
        let mut spec = minimal_spec();
        spec.providers.insert(
            "openai".to_string(),
            LlmProviderConfig {
                provider_type: "openai".to_string(),
                api_key: "env:OPENAI_API_KEY".to_string(),
                default_params: None,
            },
        );

        let ir = generate_ir(&spec, false).unwrap();
        let provider = &ir.providers["openai"];
        assert_eq!(provider.api_key.env_var, "OPENAI_API_KEY");
        assert_eq!(provider.api_key.value, None);
    }

    #[test]
    fn test_direct_value_credential() {
        let mut spec = minimal_spec();
        spec.providers.insert(
            "openai".to_string(),
            LlmProviderConfig {
                provider_type: "openai".to_string(),
                api_key: "sk-direct".to_string(),
                default_params: None,
            },
        );

        let ir = generate_ir(&spec, false).unwrap();
        let provider = &ir.providers["openai"];
        assert_eq!(provider.api_key.env_var, DIRECT_VALUE);
        assert_eq!(provider.api_key.value.as_deref(), Some("sk-direct"));
    }

    #[test]
    fn test_server_with_auth() {
        std::env::set_var("AGENTFLOW_IRGEN_TOKEN", "ghp-test");

        let mut spec = minimal_spec();
        spec.servers.push(ServerConfig {
            name: "github".to_string(),
            server_type: None,
            transport: None,
            command: vec!["gh".to_string()],
            auth: Some(ServerAuthConfig {
                token: "env:AGENTFLOW_IRGEN_TOKEN".to_string(),
            }),
        });

        let ir = generate_ir(&spec, true).unwrap();
        let server = &ir.servers["github"];
        let token = server.auth_token.as_ref().unwrap();
        assert_eq!(token.env_var, "AGENTFLOW_IRGEN_TOKEN");
        assert_eq!(token.value.as_deref(), Some("ghp-test"));

        std::env::remove_var("AGENTFLOW_IRGEN_TOKEN");
    }

    #[test]
    fn test_capability_resolution() {
        let mut spec = minimal_spec();
        spec.servers.push(ServerConfig {
            name: "fs".to_string(),
            server_type: None,
            transport: None,
            command: vec!["node".to_string(), "fs".to_string()],
            auth: None,
        });
        spec.capabilities.push(CapabilityConfig {
            name: "read_file".to_string(),
            server: "fs".to_string(),
            method: "readFile".to_string(),
            side_effect: SideEffect::Read,
            requires_approval: false,
        });
        spec.capabilities.push(CapabilityConfig {
            name: "write_file".to_string(),
            server: "fs".to_string(),
            method: "writeFile".to_string(),
            side_effect: SideEffect::Write,
            requires_approval: true,
        });

        let ir = generate_ir(&spec, false).unwrap();
        assert_eq!(ir.capabilities.len(), 2);

        let read_cap = &ir.capabilities["read_file"];
        assert_eq!(read_cap.server_name, "fs");
        assert_eq!(read_cap.method_name, "readFile");
        assert_eq!(read_cap.side_effect, SideEffect::Read);
        assert!(!read_cap.requires_approval);
        assert!(read_cap.method_schema.is_none());

        let write_cap = &ir.capabilities["write_file"];
        assert_eq!(write_cap.side_effect, SideEffect::Write);
        assert!(write_cap.requires_approval);
    }

    #[test]
    fn test_policy_resolution() {
        let mut spec = minimal_spec();
        spec.policies.push(PolicyConfig {
            name: "default".to_string(),
            budgets: Some(BudgetConfig {
                max_cost_usd_per_run: Some(1.00),
                max_capability_calls: Some(50),
                timeout_seconds: Some(120),
            }),
        });
        spec.policies.push(PolicyConfig {
            name: "unlimited".to_string(),
            budgets: None,
        });

        let ir = generate_ir(&spec, false).unwrap();

        let default = &ir.policies["default"];
        assert_eq!(default.budgets.max_cost_usd_per_run, Some(1.00));
        assert_eq!(default.budgets.max_capability_calls, Some(50));
        assert_eq!(default.budgets.timeout_seconds, Some(120));

        assert_eq!(ir.policies["unlimited"].budgets.max_cost_usd_per_run, None);
    }

    #[test]
    fn test_agent_params_merge_over_provider_defaults() {
        let mut spec = minimal_spec();
        spec.providers.insert(
            "openai".to_string(),
            LlmProviderConfig {
                provider_type: "openai".to_string(),
                api_key: "env:KEY".to_string(),
                default_params: Some(LlmParams {
                    temperature: Some(0.7),
                    max_tokens: Some(2000),
                    top_p: Some(0.95),
                }),
            },
        );
        spec.agents.push(AgentConfig {
            name: "assistant".to_string(),
            provider: "openai".to_string(),
            model: ModelPreference {
                preference: Expr::Str("gpt-4o".into()),
                fallback: None,
            },
            params: Some(LlmParams {
                temperature: Some(0.2),
                max_tokens: None,
                top_p: None,
            }),
            instructions: "test".to_string(),
            allow: vec![],
            policy: None,
            output_schema: None,
        });

        let ir = generate_ir(&spec, false).unwrap();
        let agent = &ir.agents["assistant"];
        // Agent value wins only where set; provider defaults fill the rest
        assert_eq!(agent.params.temperature, Some(0.2));
        assert_eq!(agent.params.max_tokens, Some(2000));
        assert_eq!(agent.params.top_p, Some(0.95));
    }

    #[test]
    fn test_agent_with_missing_provider_fails() {
        let mut spec = minimal_spec();
        spec.agents.push(AgentConfig {
            name: "assistant".to_string(),
            provider: "ghost".to_string(),
            model: ModelPreference {
                preference: Expr::Str("gpt-4o".into()),
                fallback: None,
            },
            params: None,
            instructions: "test".to_string(),
            allow: vec![],
            policy: None,
            output_schema: None,
        });

        let err = generate_ir(&spec, false).unwrap_err();
        assert!(err.to_string().contains("Provider 'ghost' not found"));
    }

    #[test]
    fn test_schema_generation() {
        let mut spec = minimal_spec();
        spec.schemas.push(crate::model::SchemaConfig {
            name: "person".to_string(),
            fields: [
                ("name".to_string(), "string".to_string()),
                ("age".to_string(), "number".to_string()),
                ("tags".to_string(), "list(string)".to_string()),
            ]
            .into_iter()
            .collect(),
        });

        let ir = generate_ir(&spec, false).unwrap();
        let schema = &ir.schemas["person"];
        assert_eq!(schema.fields["name"].field_type, "string");
        assert_eq!(schema.fields["age"].field_type, "number");
        assert_eq!(schema.fields["tags"].field_type, "list");
        assert_eq!(schema.fields["tags"].item_type.as_deref(), Some("string"));
    }

    #[test]
    fn test_workflow_steps_indexed_by_id() {
        let mut spec = minimal_spec();
        let mut llm = WorkflowStep::new("process", StepType::Llm);
        llm.agent = Some("assistant".to_string());
        llm.save_as = Some("answer".to_string());
        llm.next = Some("end".to_string());

        spec.providers.insert(
            "openai".to_string(),
            LlmProviderConfig {
                provider_type: "openai".to_string(),
                api_key: "env:KEY".to_string(),
                default_params: None,
            },
        );
        spec.agents.push(AgentConfig {
            name: "assistant".to_string(),
            provider: "openai".to_string(),
            model: ModelPreference {
                preference: Expr::Str("gpt-4o".into()),
                fallback: None,
            },
            params: None,
            instructions: "x".to_string(),
            allow: vec![],
            policy: None,
            output_schema: None,
        });
        spec.workflows.push(crate::model::WorkflowConfig {
            name: "ask".to_string(),
            entry: "process".to_string(),
            steps: vec![llm, WorkflowStep::new("end", StepType::End)],
        });

        let ir = generate_ir(&spec, false).unwrap();
        let workflow = &ir.workflows["ask"];
        assert_eq!(workflow.entry_step, "process");
        assert!(workflow.steps.contains_key("process"));
        assert!(workflow.steps.contains_key("end"));

        match &workflow.steps["process"] {
            ResolvedStep::Llm {
                agent_name,
                save_as,
                next_step,
                ..
            } => {
                assert_eq!(agent_name, "assistant");
                assert_eq!(save_as.as_deref(), Some("answer"));
                assert_eq!(next_step.as_deref(), Some("end"));
            }
            other => panic!("expected llm step, got {:?}", other),
        }
    }
}
