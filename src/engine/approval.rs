//! Human-approval collaborator boundary
//!
//! The engine suspends at `human_approval` steps (and before
//! approval-gated capability calls) and asks a handler for a decision.
//! Whether the handler is synchronous, asynchronous, or interactive is its
//! own business; the engine only sees approve/reject.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;

#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Decide on the given payload; true approves, false rejects
    async fn request(&self, step_id: &str, payload: &Value) -> Result<bool>;
}

/// Handler with a fixed decision, recording every request. Used for
/// headless runs and tests.
pub struct AutoApprovalHandler {
    decision: bool,
    requests: Mutex<Vec<(String, Value)>>,
}

impl AutoApprovalHandler {
    pub fn new(decision: bool) -> Self {
        Self {
            decision,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// All (step_id, payload) pairs this handler was asked about
    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().expect("handler poisoned").clone()
    }
}

#[async_trait]
impl ApprovalHandler for AutoApprovalHandler {
    async fn request(&self, step_id: &str, payload: &Value) -> Result<bool> {
        self.requests
            .lock()
            .expect("handler poisoned")
            .push((step_id.to_string(), payload.clone()));
        tracing::info!(step = step_id, decision = self.decision, "auto approval");
        Ok(self.decision)
    }
}
