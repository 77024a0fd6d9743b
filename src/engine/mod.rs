//! Workflow execution engine
//!
//! Interprets a compiled workflow as a step-indexed state machine: walks
//! from the entry step, dispatches on step type, resolves data-flow
//! expressions against the run's `{input, state}`, enforces policy budgets
//! before capability calls, suspends at approval gates, and emits a trace.
//!
//! The engine never mutates the compiled spec. Per-run state, the policy
//! context, and the tracer are created fresh for every run, so one engine
//! instance safely serves concurrent runs of different workflows.

pub mod approval;
pub mod llm;
pub mod output;
pub mod policy;
pub mod state;
pub mod trace;

use crate::ir::{CompiledSpec, ResolvedStep, ResolvedWorkflow};
use anyhow::anyhow;
use approval::ApprovalHandler;
use async_trait::async_trait;
use llm::LlmExecutor;
use policy::{PolicyEnforcer, PolicyViolation};
use serde_json::{Map, Value};
use state::{ExprError, WorkflowState};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use trace::{TraceExport, Tracer};
use uuid::Uuid;

/// Step id that terminates a run even without a declared `end` step
const END_SENTINEL: &str = "end";

/// The capability/tool collaborator boundary: call method M on server S
/// with arguments A, get back a result or an error.
#[async_trait]
pub trait CapabilityInvoker: Send + Sync {
    async fn call(&self, server: &str, method: &str, args: Value) -> anyhow::Result<Value>;
}

/// What a completed run hands back to the caller
#[derive(Debug)]
pub struct WorkflowResult {
    /// The last stored step result
    pub output: Value,
    /// `{input, state}` at the end of the run
    pub state: Value,
    pub trace: TraceExport,
}

/// Typed run failure. Policy violations are distinguished from collaborator
/// failures and from expression-resolution failures so callers can tell
/// "ran out of budget" from "tool failed".
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("Step '{step_id}' not found in workflow '{workflow}'")]
    UnknownStep { workflow: String, step_id: String },

    #[error("Expression error in step '{step_id}' of workflow '{workflow}': {source}")]
    Expression {
        workflow: String,
        step_id: String,
        #[source]
        source: ExprError,
    },

    #[error("Policy violation in step '{step_id}' of workflow '{workflow}': {source}")]
    Policy {
        workflow: String,
        step_id: String,
        #[source]
        source: PolicyViolation,
    },

    #[error("Step '{step_id}' failed in workflow '{workflow}': {source}")]
    Step {
        workflow: String,
        step_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl WorkflowError {
    /// Stable kind tag recorded in trace error events
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::WorkflowNotFound(_) => "WorkflowNotFound",
            WorkflowError::UnknownStep { .. } => "UnknownStep",
            WorkflowError::Expression { .. } => "ExpressionError",
            WorkflowError::Policy { .. } => "PolicyViolation",
            WorkflowError::Step { .. } => "StepError",
        }
    }
}

/// The engine. Create once per compiled spec and reuse across runs; tool
/// server connections owned by the invoker stay alive between runs.
pub struct WorkflowEngine {
    spec: Arc<CompiledSpec>,
    llm: Arc<dyn LlmExecutor>,
    tools: Arc<dyn CapabilityInvoker>,
    approvals: Arc<dyn ApprovalHandler>,
    policies: PolicyEnforcer,
}

impl WorkflowEngine {
    pub fn new(
        spec: Arc<CompiledSpec>,
        llm: Arc<dyn LlmExecutor>,
        tools: Arc<dyn CapabilityInvoker>,
        approvals: Arc<dyn ApprovalHandler>,
    ) -> Self {
        let policies = PolicyEnforcer::new(spec.policies.clone());
        Self {
            spec,
            llm,
            tools,
            approvals,
            policies,
        }
    }

    pub fn spec(&self) -> &CompiledSpec {
        &self.spec
    }

    /// Execute one workflow run to completion (or failure)
    pub async fn run(
        &self,
        workflow_name: &str,
        input: Map<String, Value>,
    ) -> Result<WorkflowResult, WorkflowError> {
        let workflow = self
            .spec
            .workflows
            .get(workflow_name)
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_name.to_string()))?;

        let run_id = Uuid::new_v4().to_string();
        let tracer = Tracer::new(&workflow.name);
        let mut state = WorkflowState::new(input.clone());

        self.policies.start_context(&run_id);
        tracer.workflow_start(&input);
        tracing::info!(workflow = %workflow.name, run = %run_id, "workflow run started");

        let outcome = self.drive(workflow, &mut state, &tracer, &run_id).await;
        self.policies.end_context(&run_id);

        match outcome {
            Ok(output) => {
                tracer.workflow_end(&output);
                tracing::info!(workflow = %workflow.name, run = %run_id, "workflow run complete");
                Ok(WorkflowResult {
                    output,
                    state: state.to_json(),
                    trace: tracer.export(),
                })
            }
            Err(error) => {
                tracer.workflow_error(error.kind(), &error.to_string());
                tracing::warn!(
                    workflow = %workflow.name,
                    run = %run_id,
                    error = %error,
                    "workflow run failed"
                );
                Err(error)
            }
        }
    }

    async fn drive(
        &self,
        workflow: &ResolvedWorkflow,
        state: &mut WorkflowState,
        tracer: &Tracer,
        run_id: &str,
    ) -> Result<Value, WorkflowError> {
        let policy_name = governing_policy(&self.spec, workflow);
        let mut current = workflow.entry_step.clone();
        let mut last_output = Value::Null;

        loop {
            let step = match workflow.steps.get(&current) {
                Some(step) => step,
                None if current == END_SENTINEL => return Ok(last_output),
                None => {
                    return Err(WorkflowError::UnknownStep {
                        workflow: workflow.name.clone(),
                        step_id: current,
                    })
                }
            };

            tracer.step_start(step.id(), step.type_name());

            let next = match step {
                ResolvedStep::Llm {
                    id,
                    agent_name,
                    input_mapping,
                    save_as,
                    next_step,
                } => {
                    let value = self
                        .run_llm_step(
                            workflow, id, agent_name, input_mapping, state, tracer, run_id,
                        )
                        .await
                        .map_err(|e| self.trace_failure(tracer, id, e))?;
                    if let Some(key) = save_as {
                        state.set(key.clone(), value.clone());
                        tracer.state_update(id, key);
                    }
                    last_output = value;
                    tracer.step_end(id, &last_output);
                    next_step.clone()
                }

                ResolvedStep::Call {
                    id,
                    capability_name,
                    args_mapping,
                    save_as,
                    next_step,
                } => {
                    let value = self
                        .run_call_step(
                            workflow,
                            id,
                            capability_name,
                            args_mapping,
                            policy_name.as_deref(),
                            state,
                            tracer,
                            run_id,
                        )
                        .await
                        .map_err(|e| self.trace_failure(tracer, id, e))?;
                    if let Some(key) = save_as {
                        state.set(key.clone(), value.clone());
                        tracer.state_update(id, key);
                    }
                    last_output = value;
                    tracer.step_end(id, &last_output);
                    next_step.clone()
                }

                ResolvedStep::Condition {
                    id,
                    condition,
                    on_true_step,
                    on_false_step,
                } => {
                    let taken = state
                        .eval_condition(condition)
                        .map_err(|source| WorkflowError::Expression {
                            workflow: workflow.name.clone(),
                            step_id: id.clone(),
                            source,
                        })
                        .map_err(|e| self.trace_failure(tracer, id, e))?;
                    tracer.step_end(id, &Value::Bool(taken));
                    Some(if taken {
                        on_true_step.clone()
                    } else {
                        on_false_step.clone()
                    })
                }

                ResolvedStep::HumanApproval {
                    id,
                    payload,
                    on_approve_step,
                    on_reject_step,
                } => {
                    let payload_value = match payload {
                        Some(expr) => state
                            .eval(expr)
                            .map_err(|source| WorkflowError::Expression {
                                workflow: workflow.name.clone(),
                                step_id: id.clone(),
                                source,
                            })
                            .map_err(|e| self.trace_failure(tracer, id, e))?,
                        None => Value::Null,
                    };

                    tracer.approval_request(id, &payload_value);
                    let approved = self
                        .approvals
                        .request(id, &payload_value)
                        .await
                        .map_err(|source| WorkflowError::Step {
                            workflow: workflow.name.clone(),
                            step_id: id.clone(),
                            source,
                        })
                        .map_err(|e| self.trace_failure(tracer, id, e))?;
                    tracer.approval_response(id, approved);
                    tracer.step_end(id, &Value::Bool(approved));

                    Some(if approved {
                        on_approve_step.clone()
                    } else {
                        on_reject_step.clone()
                    })
                }

                ResolvedStep::End { id } => {
                    tracer.step_end(id, &last_output);
                    return Ok(last_output);
                }
            };

            match next {
                Some(step_id) => current = step_id,
                // A chain without an explicit next terminates normally
                None => return Ok(last_output),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_llm_step(
        &self,
        workflow: &ResolvedWorkflow,
        step_id: &str,
        agent_name: &str,
        input_mapping: &BTreeMap<String, crate::ast::Expr>,
        state: &WorkflowState,
        tracer: &Tracer,
        run_id: &str,
    ) -> Result<Value, WorkflowError> {
        let step_error = |source: anyhow::Error| WorkflowError::Step {
            workflow: workflow.name.clone(),
            step_id: step_id.to_string(),
            source,
        };
        let expr_error = |source: ExprError| WorkflowError::Expression {
            workflow: workflow.name.clone(),
            step_id: step_id.to_string(),
            source,
        };

        let agent = self
            .spec
            .agents
            .get(agent_name)
            .ok_or_else(|| step_error(anyhow!("Agent '{}' not found", agent_name)))?;

        let resolved_input = state.resolve_mapping(input_mapping).map_err(expr_error)?;

        // Model ids may be conditional expressions; evaluate them per run
        let mut models = vec![model_id(state, &agent.model_preference).map_err(expr_error)?];
        if let Some(fallback) = &agent.model_fallback {
            models.push(model_id(state, fallback).map_err(expr_error)?);
        }

        let outcome = self
            .llm
            .execute(agent, &models, &resolved_input)
            .await
            .map_err(step_error)?;

        if let Some(usage) = &outcome.usage {
            self.policies
                .add_tokens(run_id, &outcome.model, usage.total_tokens);
        }

        let prompt_preview =
            serde_json::to_string(&Value::Object(resolved_input)).unwrap_or_default();
        let response_preview = match &outcome.response {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        tracer.llm_call(
            step_id,
            &outcome.model,
            &prompt_preview,
            &response_preview,
            outcome.usage.as_ref().map(|u| u.total_tokens),
        );

        Ok(outcome.response)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_call_step(
        &self,
        workflow: &ResolvedWorkflow,
        step_id: &str,
        capability_name: &str,
        args_mapping: &BTreeMap<String, crate::ast::Expr>,
        policy_name: Option<&str>,
        state: &WorkflowState,
        tracer: &Tracer,
        run_id: &str,
    ) -> Result<Value, WorkflowError> {
        let step_error = |source: anyhow::Error| WorkflowError::Step {
            workflow: workflow.name.clone(),
            step_id: step_id.to_string(),
            source,
        };
        let policy_error = |source: PolicyViolation| WorkflowError::Policy {
            workflow: workflow.name.clone(),
            step_id: step_id.to_string(),
            source,
        };

        let capability = self
            .spec
            .capabilities
            .get(capability_name)
            .ok_or_else(|| step_error(anyhow!("Capability '{}' not found", capability_name)))?;

        let args = state
            .resolve_mapping(args_mapping)
            .map_err(|source| WorkflowError::Expression {
                workflow: workflow.name.clone(),
                step_id: step_id.to_string(),
                source,
            })?;
        let args_value = Value::Object(args);

        // Budget checks happen before the call; the wall-clock budget is
        // cooperative and only checked at these boundaries.
        if let Some(policy) = policy_name {
            tracer.policy_check(step_id, policy, "max_capability_calls");
        }
        self.policies
            .check_timeout(run_id, policy_name)
            .map_err(policy_error)?;
        self.policies
            .check_before_capability_call(run_id, policy_name)
            .map_err(policy_error)?;

        // Approval-gated capabilities suspend for a decision first
        if capability.requires_approval {
            tracer.approval_request(step_id, &args_value);
            let approved = self
                .approvals
                .request(step_id, &args_value)
                .await
                .map_err(step_error)?;
            tracer.approval_response(step_id, approved);
            if !approved {
                return Err(step_error(anyhow!(
                    "Capability '{}' call rejected by approver",
                    capability_name
                )));
            }
        }

        let result = self
            .tools
            .call(&capability.server_name, &capability.method_name, args_value.clone())
            .await
            .map_err(step_error)?;

        self.policies.record_capability_call(run_id);

        let result_preview = match &result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        tracer.capability_call(step_id, capability_name, &args_value, &result_preview);

        Ok(result)
    }

    fn trace_failure(
        &self,
        tracer: &Tracer,
        step_id: &str,
        error: WorkflowError,
    ) -> WorkflowError {
        tracer.step_error(step_id, error.kind(), &error.to_string());
        error
    }
}

/// Evaluate a model-id expression to a concrete model string
fn model_id(state: &WorkflowState, expr: &crate::ast::Expr) -> Result<String, ExprError> {
    match state.eval(expr)? {
        Value::String(model) => Ok(model),
        other => Err(ExprError::UnresolvedReference(format!(
            "model id evaluated to {} instead of a string",
            other
        ))),
    }
}

/// The policy governing a run: the first policy declared by any agent the
/// workflow's llm steps reference (step order by id). Budgets are attached
/// to agents; capability calls count against the run as a whole.
fn governing_policy(spec: &CompiledSpec, workflow: &ResolvedWorkflow) -> Option<String> {
    for step in workflow.steps.values() {
        if let ResolvedStep::Llm { agent_name, .. } = step {
            if let Some(policy) = spec
                .agents
                .get(agent_name)
                .and_then(|agent| agent.policy_name.clone())
            {
                return Some(policy);
            }
        }
    }
    None
}
