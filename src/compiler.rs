//! Compilation pipeline
//!
//! Ties parsing, merging, module loading, resolution, validation,
//! normalization, and IR generation into single entry points for strings,
//! files, and directories. Compilation is pure and synchronous; the only
//! I/O is reading source files and (optionally) the environment.

use crate::ir::CompiledSpec;
use crate::irgen::{generate_ir, IrGenError};
use crate::merge::{discover_files, merge_files, MergeError};
use crate::modules::{LoadedModule, ModuleError, ModuleLoader};
use crate::normalizer::{build_valuation, normalize, NormalizeError};
use crate::parser::{parse, ParseError};
use crate::resolver::resolve_with_modules;
use crate::validator::{validate, ValidationIssue, ValidationResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The DSL's source file extension
pub const SOURCE_EXTENSION: &str = "af";

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error("Validation failed:\n{}", .errors.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Validation { errors: Vec<ValidationIssue> },

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    IrGen(#[from] IrGenError),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Expected .af file, got '{0}'")]
    WrongExtension(String),

    #[error("No .af files found in directory '{0}'")]
    EmptyDirectory(String),

    #[error("Failed to read '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// Knobs for a compile run
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Warn about unset environment variables at validate time
    pub check_env: bool,
    /// Resolve `env:NAME` credentials against the process environment
    pub resolve_credentials: bool,
    /// Caller-supplied variable values
    pub variables: BTreeMap<String, Value>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            check_env: true,
            resolve_credentials: true,
            variables: BTreeMap::new(),
        }
    }
}

impl CompileOptions {
    /// Options suited to tests: no env checks, no credential resolution
    pub fn offline() -> Self {
        Self {
            check_env: false,
            resolve_credentials: false,
            variables: BTreeMap::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }
}

// ============================================================================
// ENTRY POINTS
// ============================================================================

/// Compile source text to IR. Module sources resolve relative to the
/// current directory.
pub fn compile_str(source: &str, options: &CompileOptions) -> Result<CompiledSpec, CompileError> {
    let file = parse(source, None)?;
    let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    run_pipeline(file, &base, options)
}

/// Compile a single `.af` file to IR
pub fn compile_file(
    path: impl AsRef<Path>,
    options: &CompileOptions,
) -> Result<CompiledSpec, CompileError> {
    let (merged, base) = load_file(path.as_ref())?;
    run_pipeline(merged, &base, options)
}

/// Compile every `.af` file in a directory to one IR
pub fn compile_dir(
    dir: impl AsRef<Path>,
    options: &CompileOptions,
) -> Result<CompiledSpec, CompileError> {
    let merged = load_dir(dir.as_ref())?;
    run_pipeline(merged, dir.as_ref(), options)
}

/// Validate source text without generating IR
pub fn validate_str(
    source: &str,
    options: &CompileOptions,
) -> Result<ValidationResult, CompileError> {
    let file = parse(source, None)?;
    let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    run_validation(file, &base, options)
}

/// Validate a single `.af` file without generating IR.
///
/// Faster than full compilation: no normalization, no IR, no credential
/// resolution.
pub fn validate_file(
    path: impl AsRef<Path>,
    options: &CompileOptions,
) -> Result<ValidationResult, CompileError> {
    let (merged, base) = load_file(path.as_ref())?;
    run_validation(merged, &base, options)
}

/// Validate a project directory without generating IR
pub fn validate_dir(
    dir: impl AsRef<Path>,
    options: &CompileOptions,
) -> Result<ValidationResult, CompileError> {
    let merged = load_dir(dir.as_ref())?;
    run_validation(merged, dir.as_ref(), options)
}

// ============================================================================
// PIPELINE
// ============================================================================

fn load_file(path: &Path) -> Result<(crate::ast::AgentflowFile, PathBuf), CompileError> {
    if !path.exists() {
        return Err(CompileError::FileNotFound(path.display().to_string()));
    }
    let matches_ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(SOURCE_EXTENSION))
        .unwrap_or(false);
    if !matches_ext {
        return Err(CompileError::WrongExtension(path.display().to_string()));
    }

    let source = std::fs::read_to_string(path).map_err(|source| CompileError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let label = path.display().to_string();
    let file = parse(&source, Some(&label))?;

    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((file, base))
}

fn load_dir(dir: &Path) -> Result<crate::ast::AgentflowFile, CompileError> {
    if !dir.is_dir() {
        return Err(CompileError::FileNotFound(dir.display().to_string()));
    }

    let paths = discover_files(dir, false);
    if paths.is_empty() {
        return Err(CompileError::EmptyDirectory(dir.display().to_string()));
    }

    let mut files = Vec::new();
    for path in paths {
        let source = std::fs::read_to_string(&path).map_err(|source| CompileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        files.push(parse(&source, Some(&label))?);
    }

    Ok(merge_files(files)?)
}

fn load_project_modules(
    merged: &crate::ast::AgentflowFile,
    base: &Path,
    options: &CompileOptions,
) -> Result<Vec<LoadedModule>, CompileError> {
    if merged.modules.is_empty() {
        return Ok(Vec::new());
    }

    // Module parameters may be variable references; resolve the importer's
    // valuation first.
    let valuation = build_valuation(merged, &options.variables)?;
    let mut loader = ModuleLoader::new(base);
    Ok(loader.load_modules(&merged.modules, &valuation)?)
}

fn run_pipeline(
    merged: crate::ast::AgentflowFile,
    base: &Path,
    options: &CompileOptions,
) -> Result<CompiledSpec, CompileError> {
    let modules = load_project_modules(&merged, base, options)?;

    let mut namespaces = Vec::new();
    for module in &modules {
        module.namespaces(&mut namespaces);
    }
    let resolution = resolve_with_modules(&merged, &namespaces);

    let validation = validate(&merged, &resolution, options.check_env);
    if !validation.is_valid() {
        return Err(CompileError::Validation {
            errors: validation.errors,
        });
    }

    let spec_model = normalize(&merged, &options.variables, &modules)?;
    let compiled = generate_ir(&spec_model, options.resolve_credentials)?;

    tracing::info!(
        project = %compiled.project_name,
        workflows = compiled.workflows.len(),
        "compiled specification"
    );

    Ok(compiled)
}

fn run_validation(
    merged: crate::ast::AgentflowFile,
    base: &Path,
    options: &CompileOptions,
) -> Result<ValidationResult, CompileError> {
    let modules = load_project_modules(&merged, base, options)?;

    let mut namespaces = Vec::new();
    for module in &modules {
        module.namespaces(&mut namespaces);
    }
    let resolution = resolve_with_modules(&merged, &namespaces);

    Ok(validate(&merged, &resolution, options.check_env))
}
