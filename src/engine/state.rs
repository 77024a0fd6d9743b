//! Per-run workflow state and expression evaluation
//!
//! State is two maps: `$input` (the data the run started with) and `$state`
//! (step results accumulated under `save_as` keys). Expressions from the IR
//! evaluate against these maps only; the engine never consults the symbol
//! table at runtime.

use crate::ast::{CompareOp, Expr, StateRef, StateRoot};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("Path '{0}' not found")]
    PathNotFound(String),

    #[error("Cannot access '{segment}' on {value_type} at '{path}'")]
    InvalidTraversal {
        segment: String,
        value_type: String,
        path: String,
    },

    #[error("Cannot compare {left} {op} {right}")]
    Incomparable {
        op: &'static str,
        left: String,
        right: String,
    },

    #[error("Reference '{0}' cannot be evaluated at runtime")]
    UnresolvedReference(String),
}

/// Mutable state for one workflow run
#[derive(Debug, Default)]
pub struct WorkflowState {
    input: Map<String, Value>,
    state: Map<String, Value>,
}

impl WorkflowState {
    pub fn new(input: Map<String, Value>) -> Self {
        Self {
            input,
            state: Map::new(),
        }
    }

    pub fn input(&self) -> &Map<String, Value> {
        &self.input
    }

    pub fn state(&self) -> &Map<String, Value> {
        &self.state
    }

    /// Store a step result (typically under its `save_as` key)
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.state.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    /// Walk a dotted path through nested mappings. A missing intermediate or
    /// leaf key is an error, never silently defaulted.
    pub fn resolve_ref(&self, state_ref: &StateRef) -> Result<Value, ExprError> {
        let root: &Map<String, Value> = match state_ref.root {
            StateRoot::Input => &self.input,
            StateRoot::State => &self.state,
        };

        let mut walked = format!("${}", state_ref.root.as_str());
        let mut current: Option<&Value> = None;

        for segment in &state_ref.path {
            walked.push('.');
            walked.push_str(segment);

            let next = match current {
                None => root.get(segment),
                Some(Value::Object(map)) => map.get(segment),
                Some(other) => {
                    return Err(ExprError::InvalidTraversal {
                        segment: segment.clone(),
                        value_type: type_name(other).to_string(),
                        path: walked,
                    })
                }
            };

            current = Some(next.ok_or_else(|| ExprError::PathNotFound(walked.clone()))?);
        }

        Ok(match current {
            Some(value) => value.clone(),
            // Bare `$input` / `$state` yields the whole map
            None => Value::Object(root.clone()),
        })
    }

    /// Evaluate an expression tree to a value
    pub fn eval(&self, expr: &Expr) -> Result<Value, ExprError> {
        match expr {
            Expr::Str(s) => Ok(Value::String(s.clone())),
            Expr::Int(n) => Ok(Value::from(*n)),
            Expr::Float(n) => Ok(serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Array(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::StateRef(state_ref) => self.resolve_ref(state_ref),
            Expr::Reference(reference) => {
                Err(ExprError::UnresolvedReference(reference.path()))
            }
            Expr::VarRef(var_ref) => Err(ExprError::UnresolvedReference(format!(
                "var.{}",
                var_ref.name
            ))),
            Expr::Comparison { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                compare(*op, &left, &right).map(Value::Bool)
            }
            Expr::And(operands) => {
                // Short-circuit: the first falsy operand decides
                for operand in operands {
                    if !truthy(&self.eval(operand)?) {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Or(operands) => {
                for operand in operands {
                    if truthy(&self.eval(operand)?) {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&self.eval(inner)?))),
            Expr::Conditional {
                condition,
                true_value,
                false_value,
            } => {
                if truthy(&self.eval(condition)?) {
                    self.eval(true_value)
                } else {
                    self.eval(false_value)
                }
            }
        }
    }

    /// Evaluate a boolean condition with truthiness coercion
    pub fn eval_condition(&self, expr: &Expr) -> Result<bool, ExprError> {
        Ok(truthy(&self.eval(expr)?))
    }

    /// Resolve a field→expression mapping to a concrete value map
    pub fn resolve_mapping(
        &self,
        mapping: &BTreeMap<String, Expr>,
    ) -> Result<Map<String, Value>, ExprError> {
        let mut resolved = Map::new();
        for (key, expr) in mapping {
            resolved.insert(key.clone(), self.eval(expr)?);
        }
        Ok(resolved)
    }

    /// Serialize to the `{input, state}` shape returned to callers
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "input": Value::Object(self.input.clone()),
            "state": Value::Object(self.state.clone()),
        })
    }
}

/// Truthiness coercion: empty string/array/object and zero are false; any
/// other non-null value is its own truth value.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Equality that treats integer and float representations of the same
/// number as equal (`200 == 200.0`)
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, ExprError> {
    match op {
        CompareOp::Eq => return Ok(values_equal(left, right)),
        CompareOp::Ne => return Ok(!values_equal(left, right)),
        _ => {}
    }

    // Ordering comparisons work on numbers and on strings
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return Ok(match op {
            CompareOp::Lt => l < r,
            CompareOp::Le => l <= r,
            CompareOp::Gt => l > r,
            CompareOp::Ge => l >= r,
            CompareOp::Eq | CompareOp::Ne => unreachable!(),
        });
    }
    if let (Value::String(l), Value::String(r)) = (left, right) {
        return Ok(match op {
            CompareOp::Lt => l < r,
            CompareOp::Le => l <= r,
            CompareOp::Gt => l > r,
            CompareOp::Ge => l >= r,
            CompareOp::Eq | CompareOp::Ne => unreachable!(),
        });
    }

    Err(ExprError::Incomparable {
        op: op.as_str(),
        left: type_name(left).to_string(),
        right: type_name(right).to_string(),
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn input(json: Value) -> WorkflowState {
        match json {
            Value::Object(map) => WorkflowState::new(map),
            _ => panic!("input must be an object"),
        }
    }

    /// Parse an attribute expression through the real parser
    fn expr(source: &str) -> Expr {
        let wrapped = format!(
            "agentflow {{ version = \"0.1\" project = \"t\" }}\nmodel \"m\" {{ probe = {} }}",
            source
        );
        let file = parse(&wrapped, None).unwrap();
        file.models[0].body.get_attribute("probe").unwrap().clone()
    }

    #[test]
    fn test_resolve_input_path() {
        let state = input(serde_json::json!({"name": "Alice"}));
        let value = state.eval(&expr("$input.name")).unwrap();
        assert_eq!(value, "Alice");
    }

    #[test]
    fn test_resolve_nested_state_path() {
        let mut state = input(serde_json::json!({}));
        state.set("result", serde_json::json!({"status": "success", "code": 200}));

        assert_eq!(
            state.eval(&expr("$state.result.status")).unwrap(),
            "success"
        );
        assert_eq!(state.eval(&expr("$state.result.code")).unwrap(), 200);
    }

    #[test]
    fn test_missing_path_fails() {
        let state = input(serde_json::json!({"a": 1}));
        let err = state.eval(&expr("$input.b")).unwrap_err();
        assert!(err.to_string().contains("$input.b"));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_missing_intermediate_path_fails() {
        let state = input(serde_json::json!({"a": {"b": 1}}));
        let err = state.eval(&expr("$input.a.x.y")).unwrap_err();
        assert!(err.to_string().contains("$input.a.x"));
    }

    #[test]
    fn test_traversal_through_scalar_fails() {
        let state = input(serde_json::json!({"a": 5}));
        let err = state.eval(&expr("$input.a.b")).unwrap_err();
        assert!(matches!(err, ExprError::InvalidTraversal { .. }));
    }

    #[test]
    fn test_comparison_boundary_table() {
        let state = input(serde_json::json!({"count": 5}));
        assert!(!state.eval_condition(&expr("$input.count > 5")).unwrap());
        assert!(state.eval_condition(&expr("$input.count >= 5")).unwrap());
        assert!(state.eval_condition(&expr("$input.count > 3")).unwrap());
        assert!(state.eval_condition(&expr("$input.count < 10")).unwrap());
        assert!(state.eval_condition(&expr("$input.count <= 5")).unwrap());
    }

    #[test]
    fn test_equality_operators() {
        let state = input(serde_json::json!({"env": "prod", "status": "success"}));
        assert!(state.eval_condition(&expr("$input.env == \"prod\"")).unwrap());
        assert!(!state.eval_condition(&expr("$input.env == \"dev\"")).unwrap());
        assert!(state
            .eval_condition(&expr("$input.status != \"error\""))
            .unwrap());
    }

    #[test]
    fn test_int_float_equality() {
        let mut state = input(serde_json::json!({}));
        state.set("result", serde_json::json!({"code": 200}));
        assert!(state
            .eval_condition(&expr("$state.result.code == 200"))
            .unwrap());
    }

    #[test]
    fn test_logical_operators() {
        let state = input(serde_json::json!({"a": true, "b": false}));
        assert!(!state.eval_condition(&expr("$input.a && $input.b")).unwrap());
        assert!(state.eval_condition(&expr("$input.a || $input.b")).unwrap());
        assert!(state.eval_condition(&expr("!$input.b")).unwrap());
        assert!(!state.eval_condition(&expr("!$input.a")).unwrap());
    }

    #[test]
    fn test_and_or_precedence() {
        // (a && b) || c with a=true, b=false, c=true
        let state = input(serde_json::json!({"a": true, "b": false, "c": true}));
        assert!(state
            .eval_condition(&expr("$input.a && $input.b || $input.c"))
            .unwrap());
    }

    #[test]
    fn test_short_circuit_skips_bad_paths() {
        let state = input(serde_json::json!({"a": false}));
        // $input.missing would fail, but && short-circuits on the false
        assert!(!state
            .eval_condition(&expr("$input.a && $input.missing"))
            .unwrap());
    }

    #[test]
    fn test_truthiness() {
        let state = input(serde_json::json!({
            "filled": "hello",
            "empty": "",
            "yes": true,
            "no": false,
            "zero": 0,
            "one": 1,
        }));

        assert!(state.eval_condition(&expr("$input.filled")).unwrap());
        assert!(!state.eval_condition(&expr("$input.empty")).unwrap());
        assert!(state.eval_condition(&expr("$input.yes")).unwrap());
        assert!(!state.eval_condition(&expr("$input.no")).unwrap());
        assert!(!state.eval_condition(&expr("$input.zero")).unwrap());
        assert!(state.eval_condition(&expr("$input.one")).unwrap());
    }

    #[test]
    fn test_conditional_expression() {
        let state = input(serde_json::json!({"use_mini": true}));
        let value = state
            .eval(&expr("$input.use_mini ? \"gpt-4o-mini\" : \"gpt-4o\""))
            .unwrap();
        assert_eq!(value, "gpt-4o-mini");

        let state = input(serde_json::json!({"use_mini": false}));
        let value = state
            .eval(&expr("$input.use_mini ? \"gpt-4o-mini\" : \"gpt-4o\""))
            .unwrap();
        assert_eq!(value, "gpt-4o");
    }

    #[test]
    fn test_resolve_mapping() {
        let mut state = input(serde_json::json!({"name": "Alice"}));
        state.set("count", serde_json::json!(10));

        let mut mapping = BTreeMap::new();
        mapping.insert("greeting".to_string(), expr("$input.name"));
        mapping.insert("total".to_string(), expr("$state.count"));
        mapping.insert("literal".to_string(), expr("\"hello\""));

        let resolved = state.resolve_mapping(&mapping).unwrap();
        assert_eq!(resolved["greeting"], "Alice");
        assert_eq!(resolved["total"], 10);
        assert_eq!(resolved["literal"], "hello");
    }

    #[test]
    fn test_state_and_input_combined() {
        let mut state = input(serde_json::json!({"threshold": 10}));
        state.set("metrics", serde_json::json!({"count": 15}));

        assert!(state
            .eval_condition(&expr("$state.metrics.count > 10"))
            .unwrap());
        assert!(!state
            .eval_condition(&expr("$state.metrics.count > 20"))
            .unwrap());
    }

    #[test]
    fn test_to_json_shape() {
        let mut state = input(serde_json::json!({"k": "v"}));
        state.set("answer", serde_json::json!("Paris"));

        let json = state.to_json();
        assert_eq!(json["input"]["k"], "v");
        assert_eq!(json["state"]["answer"], "Paris");
    }

    #[test]
    fn test_incomparable_types_error() {
        let state = input(serde_json::json!({"s": "text", "n": 5}));
        let err = state.eval(&expr("$input.s > $input.n")).unwrap_err();
        assert!(matches!(err, ExprError::Incomparable { .. }));
    }
}
