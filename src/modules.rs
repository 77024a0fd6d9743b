//! Module loading and source resolution
//!
//! A `module` block imports a parameterized sub-project from a local
//! directory or a version-pinned git repository. Remote sources normalize to
//! canonical HTTPS form and land in a content-addressed local cache keyed by
//! a hash of (normalized URL, version-or-HEAD). The loader reads the
//! module's own `variable` blocks as its parameter contract, type-checks
//! every supplied parameter, and recursively loads nested modules while
//! tracking the in-progress chain so cyclic module graphs fail fast.

use crate::ast::{AgentflowFile, Expr, ModuleBlock};
use crate::merge::{discover_files, merge_files, MergeError};
use crate::parser::{parse, ParseError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

static SSH_URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^git@([^:]+):(.+)$").expect("valid pattern"));

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Module '{0}' is missing required 'source'")]
    MissingSource(String),

    #[error("Module '{module}' requires parameter '{parameter}'")]
    MissingParameter { module: String, parameter: String },

    #[error("Module '{module}' parameter '{parameter}' expects {expected}, got {actual}")]
    ParameterType {
        module: String,
        parameter: String,
        expected: String,
        actual: String,
    },

    #[error("Duplicate module name '{0}'")]
    DuplicateName(String),

    #[error("Module path '{0}' does not exist")]
    PathNotFound(String),

    #[error("No .af files found in module source '{0}'")]
    NoSourceFiles(String),

    #[error("Failed to fetch module '{url}': {detail}")]
    Fetch { url: String, detail: String },

    #[error("Module cycle detected: {0}")]
    Cycle(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("Module I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// SOURCE LOCATORS
// ============================================================================

/// Classify a module source locator: git repository vs local path
pub fn is_git_url(source: &str) -> bool {
    if source.starts_with("git@") {
        return true;
    }
    if source.starts_with("http://") || source.starts_with("https://") {
        return true;
    }
    if source.starts_with('/') || source.starts_with("./") || source.starts_with("../") {
        return false;
    }
    // Short form: host/org/repo where the host has a dot
    let parts: Vec<&str> = source.split('/').collect();
    parts.len() >= 3 && parts[0].contains('.')
}

/// Normalize a git locator to canonical HTTPS form
pub fn normalize_git_url(source: &str) -> String {
    if let Some(caps) = SSH_URL_PATTERN.captures(source) {
        return format!("https://{}/{}", &caps[1], &caps[2]);
    }
    if source.starts_with("http://") || source.starts_with("https://") {
        return source.to_string();
    }
    format!("https://{}", source)
}

/// Content-addressed cache key for a (locator, version) pair: a readable
/// prefix plus a hash so distinct versions never collide.
pub fn cache_key(source: &str, version: Option<&str>) -> String {
    let normalized = normalize_git_url(source);
    let readable: String = normalized
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b"@");
    hasher.update(version.unwrap_or("HEAD").as_bytes());
    let digest = hasher.finalize();
    let short: String = digest.iter().take(6).map(|b| format!("{:02x}", b)).collect();

    format!("{}-{}", readable, short)
}

/// Where a module source resolved to on disk
#[derive(Debug, Clone)]
pub struct ResolvedModuleSource {
    pub source: String,
    pub path: PathBuf,
    pub version: Option<String>,
    pub is_local: bool,
}

/// Resolves module locators to local directories, fetching and caching
/// remote repositories. Resolution results are memoized per (locator,
/// version) for the resolver's lifetime, so each key is fetched at most once.
pub struct ModuleResolver {
    base_path: PathBuf,
    cache_root: PathBuf,
    resolved: HashMap<String, ResolvedModuleSource>,
}

impl ModuleResolver {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let cache_root = std::env::var("AGENTFLOW_MODULE_CACHE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::temp_dir().join("agentflow").join("modules")
            });
        Self {
            base_path: base_path.into(),
            cache_root,
            resolved: HashMap::new(),
        }
    }

    pub fn with_cache_root(mut self, cache_root: impl Into<PathBuf>) -> Self {
        self.cache_root = cache_root.into();
        self
    }

    /// Resolve a locator to a local directory containing `.af` files
    pub fn resolve(
        &mut self,
        source: &str,
        version: Option<&str>,
    ) -> Result<ResolvedModuleSource, ModuleError> {
        let memo_key = format!("{}@{}", source, version.unwrap_or("HEAD"));
        if let Some(hit) = self.resolved.get(&memo_key) {
            return Ok(hit.clone());
        }

        let result = if is_git_url(source) {
            self.resolve_remote(source, version)?
        } else {
            self.resolve_local(source, version)?
        };

        self.resolved.insert(memo_key, result.clone());
        Ok(result)
    }

    fn resolve_local(
        &self,
        source: &str,
        version: Option<&str>,
    ) -> Result<ResolvedModuleSource, ModuleError> {
        let raw = Path::new(source);
        let path = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.base_path.join(raw)
        };

        if !path.is_dir() {
            return Err(ModuleError::PathNotFound(path.display().to_string()));
        }
        if discover_files(&path, false).is_empty() {
            return Err(ModuleError::NoSourceFiles(path.display().to_string()));
        }

        Ok(ResolvedModuleSource {
            source: source.to_string(),
            path: path.canonicalize().unwrap_or(path),
            version: version.map(str::to_string),
            is_local: true,
        })
    }

    fn resolve_remote(
        &self,
        source: &str,
        version: Option<&str>,
    ) -> Result<ResolvedModuleSource, ModuleError> {
        let url = normalize_git_url(source);
        // Checked for shape only; clone uses the canonical string
        url::Url::parse(&url).map_err(|e| ModuleError::Fetch {
            url: url.clone(),
            detail: e.to_string(),
        })?;

        let target = self.cache_root.join(cache_key(source, version));

        if !target.is_dir() {
            tracing::info!(url = %url, version = ?version, "fetching module");
            std::fs::create_dir_all(&self.cache_root)?;

            let mut cmd = std::process::Command::new("git");
            cmd.arg("clone").arg("--depth").arg("1");
            if let Some(version) = version {
                cmd.arg("--branch").arg(version);
            }
            cmd.arg(&url).arg(&target);

            let output = cmd.output().map_err(|e| ModuleError::Fetch {
                url: url.clone(),
                detail: e.to_string(),
            })?;
            if !output.status.success() {
                let _ = std::fs::remove_dir_all(&target);
                return Err(ModuleError::Fetch {
                    url,
                    detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
        }

        if discover_files(&target, false).is_empty() {
            return Err(ModuleError::NoSourceFiles(target.display().to_string()));
        }

        Ok(ResolvedModuleSource {
            source: source.to_string(),
            path: target,
            version: version.map(str::to_string),
            is_local: false,
        })
    }
}

// ============================================================================
// LOADED MODULES
// ============================================================================

/// A fully loaded module: its parsed project, resolved parameter values, and
/// recursively loaded child modules.
#[derive(Debug)]
pub struct LoadedModule {
    pub name: String,
    pub path: PathBuf,
    pub version: Option<String>,
    pub is_local: bool,
    /// Complete valuation of the module's declared variables
    pub parameters: BTreeMap<String, Value>,
    pub ast: AgentflowFile,
    pub children: Vec<LoadedModule>,
}

impl LoadedModule {
    /// All (namespace, ast) pairs this module contributes, depth-first.
    /// A child `b` of module `a` appears as namespace `a.module.b` so its
    /// symbols prefix to `module.a.module.b.<sym>`.
    pub fn namespaces<'a>(&'a self, out: &mut Vec<(String, &'a AgentflowFile)>) {
        out.push((self.name.clone(), &self.ast));
        for child in &self.children {
            let mut nested = Vec::new();
            child.namespaces(&mut nested);
            for (ns, ast) in nested {
                out.push((format!("{}.module.{}", self.name, ns), ast));
            }
        }
    }
}

/// Loads module blocks into parsed, parameter-checked projects
pub struct ModuleLoader {
    resolver: ModuleResolver,
}

impl ModuleLoader {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            resolver: ModuleResolver::new(base_path),
        }
    }

    pub fn with_resolver(resolver: ModuleResolver) -> Self {
        Self { resolver }
    }

    /// Load every module block, rejecting duplicate module names
    pub fn load_modules(
        &mut self,
        blocks: &[ModuleBlock],
        variables: &BTreeMap<String, Value>,
    ) -> Result<Vec<LoadedModule>, ModuleError> {
        let mut loaded = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for block in blocks {
            if !seen.insert(block.name.clone()) {
                return Err(ModuleError::DuplicateName(block.name.clone()));
            }
            loaded.push(self.load_module(block, variables)?);
        }

        Ok(loaded)
    }

    /// Load one module block
    pub fn load_module(
        &mut self,
        block: &ModuleBlock,
        variables: &BTreeMap<String, Value>,
    ) -> Result<LoadedModule, ModuleError> {
        let mut chain = Vec::new();
        self.load_inner(block, variables, &mut chain)
    }

    fn load_inner(
        &mut self,
        block: &ModuleBlock,
        variables: &BTreeMap<String, Value>,
        chain: &mut Vec<String>,
    ) -> Result<LoadedModule, ModuleError> {
        let source = block
            .source()
            .and_then(|expr| resolve_param_value(expr, variables))
            .and_then(|value| value.as_str().map(str::to_string))
            .ok_or_else(|| ModuleError::MissingSource(block.name.clone()))?;
        let version = block.version().map(str::to_string);

        let resolved = self.resolver.resolve(&source, version.as_deref())?;

        // Cycle guard: the canonical resolved path identifies a module
        // regardless of how the locator was spelled.
        let identity = format!(
            "{}@{}",
            resolved.path.display(),
            version.as_deref().unwrap_or("HEAD")
        );
        if chain.contains(&identity) {
            chain.push(identity);
            return Err(ModuleError::Cycle(chain.join(" -> ")));
        }
        chain.push(identity);

        let mut files = Vec::new();
        for path in discover_files(&resolved.path, false) {
            let text = std::fs::read_to_string(&path)?;
            let label = path.display().to_string();
            files.push(parse(&text, Some(&label))?);
        }
        let ast = merge_files(files)?;

        let parameters = resolve_parameters(block, &ast, variables)?;

        // Nested modules resolve relative to this module's directory and get
        // the module's own parameter valuation as their variable scope.
        let mut children = Vec::new();
        if !ast.modules.is_empty() {
            let mut nested_loader = ModuleLoader::with_resolver(
                ModuleResolver::new(&resolved.path)
                    .with_cache_root(self.resolver.cache_root.clone()),
            );
            let mut seen = std::collections::HashSet::new();
            for nested in &ast.modules {
                if !seen.insert(nested.name.clone()) {
                    return Err(ModuleError::DuplicateName(nested.name.clone()));
                }
                children.push(nested_loader.load_inner(nested, &parameters, chain)?);
            }
        }

        chain.pop();

        tracing::debug!(
            module = %block.name,
            path = %resolved.path.display(),
            params = parameters.len(),
            "module loaded"
        );

        Ok(LoadedModule {
            name: block.name.clone(),
            path: resolved.path,
            version,
            is_local: resolved.is_local,
            parameters,
            ast,
            children,
        })
    }
}

/// Validate supplied parameters against the module's variable contract and
/// produce the complete valuation (supplied value, else declared default).
fn resolve_parameters(
    block: &ModuleBlock,
    module_ast: &AgentflowFile,
    variables: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, ModuleError> {
    let mut supplied: BTreeMap<String, Value> = BTreeMap::new();
    for (name, expr) in block.parameters() {
        match resolve_param_value(expr, variables) {
            Some(value) => {
                supplied.insert(name.to_string(), value);
            }
            None => {
                return Err(ModuleError::ParameterType {
                    module: block.name.clone(),
                    parameter: name.to_string(),
                    expected: "a literal or variable reference".to_string(),
                    actual: expr.kind_name().to_string(),
                })
            }
        }
    }

    let mut parameters = BTreeMap::new();
    for variable in &module_ast.variables {
        if let Some(value) = supplied.remove(&variable.name) {
            if let Some(declared) = &variable.var_type {
                let actual = json_type_name(&value);
                if actual != declared.as_str() {
                    return Err(ModuleError::ParameterType {
                        module: block.name.clone(),
                        parameter: variable.name.clone(),
                        expected: declared.clone(),
                        actual: actual.to_string(),
                    });
                }
            }
            parameters.insert(variable.name.clone(), value);
        } else if let Some(default) = variable.default.as_ref().and_then(|e| e.literal_value()) {
            parameters.insert(variable.name.clone(), default);
        } else {
            return Err(ModuleError::MissingParameter {
                module: block.name.clone(),
                parameter: variable.name.clone(),
            });
        }
    }

    for unknown in supplied.keys() {
        tracing::warn!(
            module = %block.name,
            parameter = %unknown,
            "ignoring parameter not declared by module"
        );
    }

    Ok(parameters)
}

/// Evaluate a module parameter expression: literals directly, variable
/// references from the importer's valuation.
fn resolve_param_value(expr: &Expr, variables: &BTreeMap<String, Value>) -> Option<Value> {
    match expr {
        Expr::VarRef(var_ref) => variables.get(&var_ref.name).cloned(),
        other => other.literal_value(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Null => "null",
    }
}
