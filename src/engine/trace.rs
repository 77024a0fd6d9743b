//! Execution tracing
//!
//! An ordered, timestamped log of workflow lifecycle and step-level events,
//! produced once per run. Long prompt/response/result previews are truncated
//! so traces stay readable.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Mutex;
use std::time::Instant;
use uuid::Uuid;

/// Maximum preview length for prompts, responses, and tool results
const PREVIEW_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStart,
    WorkflowEnd,
    WorkflowError,
    StepStart,
    StepEnd,
    StepError,
    LlmCall,
    CapabilityCall,
    ApprovalRequest,
    ApprovalResponse,
    PolicyCheck,
    StateUpdate,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkflowStart => "workflow_start",
            EventType::WorkflowEnd => "workflow_end",
            EventType::WorkflowError => "workflow_error",
            EventType::StepStart => "step_start",
            EventType::StepEnd => "step_end",
            EventType::StepError => "step_error",
            EventType::LlmCall => "llm_call",
            EventType::CapabilityCall => "capability_call",
            EventType::ApprovalRequest => "approval_request",
            EventType::ApprovalResponse => "approval_response",
            EventType::PolicyCheck => "policy_check",
            EventType::StateUpdate => "state_update",
        }
    }
}

/// One trace event
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Unix timestamp, seconds
    pub timestamp: f64,
    pub workflow_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub data: Map<String, Value>,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// The exported trace handed back to callers
#[derive(Debug, Clone, Serialize)]
pub struct TraceExport {
    pub trace_id: String,
    pub workflow_name: String,
    pub events: Vec<TraceEvent>,
}

/// Collects events for one workflow run. Thread-safe and append-only.
pub struct Tracer {
    workflow_name: String,
    trace_id: String,
    events: Mutex<Vec<TraceEvent>>,
    started: Instant,
}

impl Tracer {
    pub fn new(workflow_name: impl Into<String>) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            trace_id: Uuid::new_v4().to_string(),
            events: Mutex::new(Vec::new()),
            started: Instant::now(),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    /// Append an event and return a copy of it
    pub fn emit(
        &self,
        event_type: EventType,
        step_id: Option<&str>,
        data: Map<String, Value>,
    ) -> TraceEvent {
        let event = TraceEvent {
            event_type,
            timestamp: Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            workflow_name: self.workflow_name.clone(),
            step_id: step_id.map(str::to_string),
            data,
            trace_id: self.trace_id.clone(),
            parent_id: None,
        };

        tracing::debug!(
            event = event_type.as_str(),
            step = step_id.unwrap_or("-"),
            "trace event"
        );

        self.events.lock().expect("tracer poisoned").push(event.clone());
        event
    }

    pub fn workflow_start(&self, input: &Map<String, Value>) -> TraceEvent {
        let mut data = Map::new();
        data.insert("input".to_string(), Value::Object(input.clone()));
        self.emit(EventType::WorkflowStart, None, data)
    }

    pub fn workflow_end(&self, output: &Value) -> TraceEvent {
        let mut data = Map::new();
        data.insert("output".to_string(), output.clone());
        data.insert(
            "duration_seconds".to_string(),
            Value::from(self.started.elapsed().as_secs_f64()),
        );
        self.emit(EventType::WorkflowEnd, None, data)
    }

    pub fn workflow_error(&self, error_type: &str, message: &str) -> TraceEvent {
        let mut data = Map::new();
        data.insert("error".to_string(), Value::String(message.to_string()));
        data.insert(
            "error_type".to_string(),
            Value::String(error_type.to_string()),
        );
        self.emit(EventType::WorkflowError, None, data)
    }

    pub fn step_start(&self, step_id: &str, step_type: &str) -> TraceEvent {
        let mut data = Map::new();
        data.insert(
            "step_type".to_string(),
            Value::String(step_type.to_string()),
        );
        self.emit(EventType::StepStart, Some(step_id), data)
    }

    pub fn step_end(&self, step_id: &str, output: &Value) -> TraceEvent {
        let mut data = Map::new();
        data.insert("output".to_string(), output.clone());
        self.emit(EventType::StepEnd, Some(step_id), data)
    }

    pub fn step_error(&self, step_id: &str, error_type: &str, message: &str) -> TraceEvent {
        let mut data = Map::new();
        data.insert("error".to_string(), Value::String(message.to_string()));
        data.insert(
            "error_type".to_string(),
            Value::String(error_type.to_string()),
        );
        self.emit(EventType::StepError, Some(step_id), data)
    }

    pub fn llm_call(
        &self,
        step_id: &str,
        model: &str,
        prompt: &str,
        response: &str,
        tokens: Option<u64>,
    ) -> TraceEvent {
        let mut data = Map::new();
        data.insert("model".to_string(), Value::String(model.to_string()));
        data.insert(
            "prompt_preview".to_string(),
            Value::String(truncate(prompt)),
        );
        data.insert(
            "response_preview".to_string(),
            Value::String(truncate(response)),
        );
        if let Some(tokens) = tokens {
            data.insert("tokens".to_string(), Value::from(tokens));
        }
        self.emit(EventType::LlmCall, Some(step_id), data)
    }

    pub fn capability_call(
        &self,
        step_id: &str,
        capability: &str,
        args: &Value,
        result: &str,
    ) -> TraceEvent {
        let mut data = Map::new();
        data.insert(
            "capability".to_string(),
            Value::String(capability.to_string()),
        );
        data.insert("args".to_string(), args.clone());
        data.insert("result_preview".to_string(), Value::String(truncate(result)));
        self.emit(EventType::CapabilityCall, Some(step_id), data)
    }

    pub fn approval_request(&self, step_id: &str, payload: &Value) -> TraceEvent {
        let mut data = Map::new();
        data.insert("payload".to_string(), payload.clone());
        self.emit(EventType::ApprovalRequest, Some(step_id), data)
    }

    pub fn approval_response(&self, step_id: &str, approved: bool) -> TraceEvent {
        let mut data = Map::new();
        data.insert("approved".to_string(), Value::Bool(approved));
        self.emit(EventType::ApprovalResponse, Some(step_id), data)
    }

    pub fn policy_check(&self, step_id: &str, policy: &str, constraint: &str) -> TraceEvent {
        let mut data = Map::new();
        data.insert("policy".to_string(), Value::String(policy.to_string()));
        data.insert(
            "constraint".to_string(),
            Value::String(constraint.to_string()),
        );
        self.emit(EventType::PolicyCheck, Some(step_id), data)
    }

    pub fn state_update(&self, step_id: &str, key: &str) -> TraceEvent {
        let mut data = Map::new();
        data.insert("key".to_string(), Value::String(key.to_string()));
        self.emit(EventType::StateUpdate, Some(step_id), data)
    }

    /// All events so far (cloned)
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().expect("tracer poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("tracer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Final export handed to the caller
    pub fn export(&self) -> TraceExport {
        TraceExport {
            trace_id: self.trace_id.clone(),
            workflow_name: self.workflow_name.clone(),
            events: self.events(),
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.export()).unwrap_or(Value::Null)
    }
}

fn truncate(text: &str) -> String {
    text.chars().take(PREVIEW_MAX_CHARS).collect()
}
