//! AST for the Agentflow configuration language
//!
//! One typed block per source block kind, plus the closed expression algebra
//! used for attribute values. Everything here is immutable after parsing;
//! later pipeline stages only read it.

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::fmt;

// ============================================================================
// EXPRESSIONS
// ============================================================================

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// Root namespace of a `$...` state reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateRoot {
    Input,
    State,
}

impl StateRoot {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateRoot::Input => "input",
            StateRoot::State => "state",
        }
    }
}

/// Dotted reference to a declared symbol (`model.gpt4`, `step.process`, ...)
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub parts: Vec<String>,
}

impl Reference {
    pub fn new(parts: Vec<String>) -> Self {
        Self { parts }
    }

    /// Full dotted path
    pub fn path(&self) -> String {
        self.parts.join(".")
    }

    /// Leading namespace part (`model`, `step`, `module`, ...)
    pub fn root(&self) -> &str {
        &self.parts[0]
    }
}

/// Reference to a declared variable (`var.api_key`)
#[derive(Debug, Clone, PartialEq)]
pub struct VarRef {
    pub name: String,
}

/// Reference into the runtime environment (`$input.a.b`, `$state.x.y`)
#[derive(Debug, Clone, PartialEq)]
pub struct StateRef {
    pub root: StateRoot,
    pub path: Vec<String>,
}

impl StateRef {
    /// Render back to source form: `$input.a.b`
    pub fn display(&self) -> String {
        let mut out = format!("${}", self.root.as_str());
        for seg in &self.path {
            out.push('.');
            out.push_str(seg);
        }
        out
    }
}

/// Attribute value expression. A closed algebra: literals, arrays,
/// references, comparisons, boolean logic, and conditionals. Trees never
/// contain cycles and evaluation only needs the `{input, state}` environment.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<Expr>),
    Reference(Reference),
    VarRef(VarRef),
    StateRef(StateRef),
    Comparison {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Conditional {
        condition: Box<Expr>,
        true_value: Box<Expr>,
        false_value: Box<Expr>,
    },
}

impl Expr {
    /// Literal string content, if this is a string literal
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Expr::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Expr::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Convert a pure literal (string/number/boolean/array-of-literal) to a
    /// JSON value. Returns None for references and operators.
    pub fn literal_value(&self) -> Option<Value> {
        match self {
            Expr::Str(s) => Some(Value::String(s.clone())),
            Expr::Int(n) => Some(Value::from(*n)),
            Expr::Float(n) => serde_json::Number::from_f64(*n).map(Value::Number),
            Expr::Bool(b) => Some(Value::Bool(*b)),
            Expr::Array(items) => items
                .iter()
                .map(|e| e.literal_value())
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            _ => None,
        }
    }

    /// Short name of the expression kind, for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Str(_) => "string",
            Expr::Int(_) | Expr::Float(_) => "number",
            Expr::Bool(_) => "boolean",
            Expr::Array(_) => "array",
            Expr::Reference(_) => "reference",
            Expr::VarRef(_) => "variable reference",
            Expr::StateRef(_) => "state reference",
            Expr::Comparison { .. } => "comparison",
            Expr::And(_) | Expr::Or(_) | Expr::Not(_) => "boolean expression",
            Expr::Conditional { .. } => "conditional",
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Str(s) => write!(f, "\"{}\"", s),
            Expr::Int(n) => write!(f, "{}", n),
            Expr::Float(n) => write!(f, "{}", n),
            Expr::Bool(b) => write!(f, "{}", b),
            Expr::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Expr::Reference(r) => write!(f, "{}", r.path()),
            Expr::VarRef(v) => write!(f, "var.{}", v.name),
            Expr::StateRef(s) => write!(f, "{}", s.display()),
            Expr::Comparison { op, left, right } => {
                write!(f, "{} {} {}", left, op.as_str(), right)
            }
            Expr::And(operands) => {
                let rendered: Vec<String> = operands.iter().map(|e| e.to_string()).collect();
                write!(f, "{}", rendered.join(" && "))
            }
            Expr::Or(operands) => {
                let rendered: Vec<String> = operands.iter().map(|e| e.to_string()).collect();
                write!(f, "{}", rendered.join(" || "))
            }
            Expr::Not(inner) => write!(f, "!{}", inner),
            Expr::Conditional {
                condition,
                true_value,
                false_value,
            } => write!(f, "{} ? {} : {}", condition, true_value, false_value),
        }
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Expr::Str(s) => serializer.serialize_str(s),
            Expr::Int(n) => serializer.serialize_i64(*n),
            Expr::Float(n) => serializer.serialize_f64(*n),
            Expr::Bool(b) => serializer.serialize_bool(*b),
            Expr::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            // References render as their source form so the IR JSON stays
            // readable and deterministic.
            Expr::Reference(r) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("$ref", &r.path())?;
                map.end()
            }
            Expr::VarRef(v) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("$var", &v.name)?;
                map.end()
            }
            Expr::StateRef(s) => serializer.serialize_str(&s.display()),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

// ============================================================================
// BLOCKS
// ============================================================================

/// Attribute inside a block: `name = expr`
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub value: Expr,
    pub line: usize,
}

/// Shared body of any block: its attributes plus nested sub-blocks
#[derive(Debug, Clone, Default)]
pub struct BlockBody {
    pub attributes: Vec<Attribute>,
    pub blocks: Vec<NestedBlock>,
}

impl BlockBody {
    pub fn get_attribute(&self, name: &str) -> Option<&Expr> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.value)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }

    /// First nested block with the given keyword
    pub fn get_block(&self, keyword: &str) -> Option<&NestedBlock> {
        self.blocks.iter().find(|b| b.keyword == keyword)
    }

    /// All nested blocks with the given keyword (e.g. repeated `budgets`)
    pub fn get_blocks(&self, keyword: &str) -> Vec<&NestedBlock> {
        self.blocks.iter().filter(|b| b.keyword == keyword).collect()
    }
}

/// Nested sub-block: anonymous (`params { .. }`) or labeled (`output "x" { .. }`)
#[derive(Debug, Clone)]
pub struct NestedBlock {
    pub keyword: String,
    pub label: Option<String>,
    pub body: BlockBody,
    pub line: usize,
}

/// The `agentflow { version = "..." project = "..." }` metadata block
#[derive(Debug, Clone)]
pub struct MetadataBlock {
    pub version: Option<String>,
    pub project: Option<String>,
    pub line: usize,
}

/// `variable "name" { type = string default = ... sensitive = true }`
#[derive(Debug, Clone)]
pub struct VariableBlock {
    pub name: String,
    pub var_type: Option<String>,
    pub default: Option<Expr>,
    pub sensitive: bool,
    pub description: Option<String>,
    pub line: usize,
}

/// `provider "llm.openai" "default" { ... }`
#[derive(Debug, Clone)]
pub struct ProviderBlock {
    /// Composite type key, e.g. `llm.openai`
    pub provider_type: String,
    /// Instance name, e.g. `default`
    pub name: String,
    pub body: BlockBody,
    pub line: usize,
}

impl ProviderBlock {
    /// Canonical full name: `llm.openai.default`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.provider_type, self.name)
    }
}

/// `model "gpt4" { provider = ... id = ... params { ... } }`
#[derive(Debug, Clone)]
pub struct ModelBlock {
    pub name: String,
    pub body: BlockBody,
    pub line: usize,
}

/// `agent "assistant" { model = ... instructions = ... }`
#[derive(Debug, Clone)]
pub struct AgentBlock {
    pub name: String,
    pub body: BlockBody,
    pub line: usize,
}

/// `policy "default" { budgets { ... } }`
#[derive(Debug, Clone)]
pub struct PolicyBlock {
    pub name: String,
    pub body: BlockBody,
    pub line: usize,
}

/// `server "fs" { command = [...] transport = "stdio" }`
#[derive(Debug, Clone)]
pub struct ServerBlock {
    pub name: String,
    pub body: BlockBody,
    pub line: usize,
}

/// `capability "read_file" { server = ... method = "..." }`
#[derive(Debug, Clone)]
pub struct CapabilityBlock {
    pub name: String,
    pub body: BlockBody,
    pub line: usize,
}

/// `schema "person" { name = string age = number }`
#[derive(Debug, Clone)]
pub struct SchemaBlock {
    pub name: String,
    pub body: BlockBody,
    pub line: usize,
}

impl SchemaBlock {
    /// Field name → declared type word (`string`, `list(number)`, ...)
    pub fn fields(&self) -> Vec<(&str, &str)> {
        self.body
            .attributes
            .iter()
            .filter_map(|a| a.value.as_str().map(|t| (a.name.as_str(), t)))
            .collect()
    }
}

/// `module "llm" { source = "..." version = "..." param = ... }`
#[derive(Debug, Clone)]
pub struct ModuleBlock {
    pub name: String,
    pub body: BlockBody,
    pub line: usize,
}

impl ModuleBlock {
    pub fn source(&self) -> Option<&Expr> {
        self.body.get_attribute("source")
    }

    pub fn version(&self) -> Option<&str> {
        self.body.get_attribute("version").and_then(|e| e.as_str())
    }

    /// Caller-supplied parameters (everything except source/version)
    pub fn parameters(&self) -> Vec<(&str, &Expr)> {
        self.body
            .attributes
            .iter()
            .filter(|a| a.name != "source" && a.name != "version")
            .map(|a| (a.name.as_str(), &a.value))
            .collect()
    }
}

/// `step "id" { type = "llm" ... }` inside a workflow
#[derive(Debug, Clone)]
pub struct StepBlock {
    pub step_id: String,
    pub body: BlockBody,
    pub line: usize,
}

impl StepBlock {
    pub fn step_type(&self) -> Option<&str> {
        self.body.get_attribute("type").and_then(|e| e.as_str())
    }

    pub fn input_block(&self) -> Option<&NestedBlock> {
        self.body.get_block("input")
    }

    pub fn args_block(&self) -> Option<&NestedBlock> {
        self.body.get_block("args")
    }

    pub fn output_blocks(&self) -> Vec<&NestedBlock> {
        self.body.get_blocks("output")
    }
}

/// `workflow "ask" { entry = step.x  step "x" { ... } }`
#[derive(Debug, Clone)]
pub struct WorkflowBlock {
    pub name: String,
    pub body: BlockBody,
    pub steps: Vec<StepBlock>,
    pub line: usize,
}

impl WorkflowBlock {
    pub fn get_step(&self, id: &str) -> Option<&StepBlock> {
        self.steps.iter().find(|s| s.step_id == id)
    }
}

// ============================================================================
// FILE
// ============================================================================

/// A parsed Agentflow source file (or a merged set of files)
#[derive(Debug, Clone, Default)]
pub struct AgentflowFile {
    /// Source label for diagnostics (file name, or None for inline text)
    pub file_label: Option<String>,
    pub metadata: Option<MetadataBlock>,
    pub variables: Vec<VariableBlock>,
    pub providers: Vec<ProviderBlock>,
    pub models: Vec<ModelBlock>,
    pub agents: Vec<AgentBlock>,
    pub policies: Vec<PolicyBlock>,
    pub servers: Vec<ServerBlock>,
    pub capabilities: Vec<CapabilityBlock>,
    pub schemas: Vec<SchemaBlock>,
    pub modules: Vec<ModuleBlock>,
    pub workflows: Vec<WorkflowBlock>,
}

impl AgentflowFile {
    pub fn get_variable(&self, name: &str) -> Option<&VariableBlock> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn get_model(&self, name: &str) -> Option<&ModelBlock> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn get_agent(&self, name: &str) -> Option<&AgentBlock> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn get_schema(&self, name: &str) -> Option<&SchemaBlock> {
        self.schemas.iter().find(|s| s.name == name)
    }

    pub fn get_workflow(&self, name: &str) -> Option<&WorkflowBlock> {
        self.workflows.iter().find(|w| w.name == name)
    }

    pub fn get_module(&self, name: &str) -> Option<&ModuleBlock> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Label used in merge/duplicate diagnostics
    pub fn label(&self) -> &str {
        self.file_label.as_deref().unwrap_or("<input>")
    }
}
