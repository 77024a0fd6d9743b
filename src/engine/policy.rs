//! Policy and budget enforcement
//!
//! A policy is a set of per-run resource ceilings (cost, capability calls,
//! wall-clock seconds). The enforcer holds the resolved policies plus one
//! mutable context per active run, keyed by a run-unique id so concurrent
//! runs never share counters. Checks are cooperative: the engine asks before
//! capability calls; nothing is preempted.

use crate::ir::ResolvedPolicy;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::time::Instant;
use thiserror::Error;

/// A budget ceiling was exceeded. Carries which policy and which dimension
/// so callers can tell "ran out of budget" from "tool failed".
#[derive(Debug, Error)]
#[error("Policy '{policy_name}' violated ({constraint}): {message}")]
pub struct PolicyViolation {
    pub policy_name: String,
    pub constraint: &'static str,
    pub message: String,
}

/// Mutable per-run counters
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub capability_calls: u64,
    pub total_cost_usd: f64,
    pub token_usage: BTreeMap<String, u64>,
    pub start_time: Instant,
}

impl Default for PolicyContext {
    fn default() -> Self {
        Self {
            capability_calls: 0,
            total_cost_usd: 0.0,
            token_usage: BTreeMap::new(),
            start_time: Instant::now(),
        }
    }
}

impl PolicyContext {
    pub fn add_capability_call(&mut self) {
        self.capability_calls += 1;
    }

    pub fn add_cost(&mut self, cost_usd: f64) {
        self.total_cost_usd += cost_usd;
    }

    pub fn add_tokens(&mut self, model: &str, tokens: u64) {
        *self.token_usage.entry(model.to_string()).or_insert(0) += tokens;
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

/// Enforces policies across concurrent runs. Each run owns a context keyed
/// by its id; unknown policies and missing contexts make checks pass.
pub struct PolicyEnforcer {
    policies: BTreeMap<String, ResolvedPolicy>,
    contexts: DashMap<String, PolicyContext>,
}

impl PolicyEnforcer {
    pub fn new(policies: BTreeMap<String, ResolvedPolicy>) -> Self {
        Self {
            policies,
            contexts: DashMap::new(),
        }
    }

    /// Start tracking a run
    pub fn start_context(&self, context_id: impl Into<String>) {
        self.contexts
            .insert(context_id.into(), PolicyContext::default());
    }

    /// Drop a run's counters
    pub fn end_context(&self, context_id: &str) {
        self.contexts.remove(context_id);
    }

    /// Snapshot a run's counters (None once the context ended)
    pub fn context(&self, context_id: &str) -> Option<PolicyContext> {
        self.contexts.get(context_id).map(|c| c.clone())
    }

    /// Check the capability-call ceiling before invoking a capability
    pub fn check_before_capability_call(
        &self,
        context_id: &str,
        policy_name: Option<&str>,
    ) -> Result<(), PolicyViolation> {
        let (policy, context) = match self.lookup(context_id, policy_name) {
            Some(pair) => pair,
            None => return Ok(()),
        };

        if let Some(max_calls) = policy.budgets.max_capability_calls {
            if context.capability_calls >= max_calls {
                return Err(PolicyViolation {
                    policy_name: policy.name.clone(),
                    constraint: "max_capability_calls",
                    message: format!(
                        "capability call limit of {} reached ({} made)",
                        max_calls, context.capability_calls
                    ),
                });
            }
        }
        Ok(())
    }

    /// Record a completed capability call
    pub fn record_capability_call(&self, context_id: &str) {
        if let Some(mut context) = self.contexts.get_mut(context_id) {
            context.add_capability_call();
        }
    }

    /// Record a cost and check the cumulative ceiling. The cost is recorded
    /// even without a policy so totals stay accurate.
    pub fn check_cost(
        &self,
        context_id: &str,
        policy_name: Option<&str>,
        cost_usd: f64,
    ) -> Result<(), PolicyViolation> {
        let total = match self.contexts.get_mut(context_id) {
            Some(mut context) => {
                context.add_cost(cost_usd);
                context.total_cost_usd
            }
            None => return Ok(()),
        };

        if let Some(policy) = policy_name.and_then(|name| self.policies.get(name)) {
            if let Some(max_cost) = policy.budgets.max_cost_usd_per_run {
                if total > max_cost {
                    return Err(PolicyViolation {
                        policy_name: policy.name.clone(),
                        constraint: "max_cost_usd_per_run",
                        message: format!(
                            "cumulative cost ${:.4} exceeds budget ${:.4}",
                            total, max_cost
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Check the wall-clock budget (measured from run start)
    pub fn check_timeout(
        &self,
        context_id: &str,
        policy_name: Option<&str>,
    ) -> Result<(), PolicyViolation> {
        let (policy, context) = match self.lookup(context_id, policy_name) {
            Some(pair) => pair,
            None => return Ok(()),
        };

        if let Some(timeout) = policy.budgets.timeout_seconds {
            let elapsed = context.elapsed_seconds();
            if elapsed > timeout as f64 {
                return Err(PolicyViolation {
                    policy_name: policy.name.clone(),
                    constraint: "timeout_seconds",
                    message: format!(
                        "elapsed {:.1}s exceeds budget of {}s",
                        elapsed, timeout
                    ),
                });
            }
        }
        Ok(())
    }

    /// Record token usage for a model
    pub fn add_tokens(&self, context_id: &str, model: &str, tokens: u64) {
        if let Some(mut context) = self.contexts.get_mut(context_id) {
            context.add_tokens(model, tokens);
        }
    }

    fn lookup(
        &self,
        context_id: &str,
        policy_name: Option<&str>,
    ) -> Option<(&ResolvedPolicy, PolicyContext)> {
        let policy = self.policies.get(policy_name?)?;
        let context = self.contexts.get(context_id)?.clone();
        Some((policy, context))
    }
}
