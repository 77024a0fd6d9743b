//! Agentflow - compiler and execution engine for declarative AI-agent workflows
//!
//! The compilation pipeline (lexer/parser → multi-file merge → module
//! loading → symbol resolution → validation → normalization → IR
//! generation) turns `.af` sources into an immutable [`ir::CompiledSpec`];
//! the [`engine::WorkflowEngine`] then executes compiled workflows as a
//! step-indexed state machine with branching, tool calls, policy budgets,
//! and human-approval gates.

pub mod ast;
pub mod compiler;
pub mod credentials;
pub mod engine;
pub mod ir;
pub mod irgen;
pub mod lexer;
pub mod mcp;
pub mod merge;
pub mod model;
pub mod modules;
pub mod normalizer;
pub mod parser;
pub mod resolver;
pub mod validator;

pub use compiler::{
    compile_dir, compile_file, compile_str, validate_dir, validate_file, validate_str,
    CompileError, CompileOptions,
};
pub use engine::approval::{ApprovalHandler, AutoApprovalHandler};
pub use engine::llm::{HttpLlmExecutor, LlmExecutor, LlmOutcome, MockLlmExecutor};
pub use engine::policy::{PolicyEnforcer, PolicyViolation};
pub use engine::trace::{EventType, TraceEvent, Tracer};
pub use engine::{CapabilityInvoker, WorkflowEngine, WorkflowError, WorkflowResult};
pub use ir::CompiledSpec;
pub use mcp::{McpClient, McpError};
