//! Credential indirection via environment variables
//!
//! Credential-bearing attributes accept an `env:VAR_NAME` sentinel. At IR
//! generation time the variable is looked up in the process environment;
//! absence is tolerated (the value stays unresolved) unless marked required.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Marker used for credentials that were substituted directly from variables
/// rather than going through `env:` indirection.
pub const DIRECT_VALUE: &str = "DIRECT_VALUE";

static ENV_VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^env:([A-Za-z_][A-Za-z0-9_]*)$").expect("valid pattern"));

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Required environment variable '{0}' is not set")]
    MissingEnvVar(String),
}

/// Extract the environment variable name from an `env:NAME` sentinel.
/// Returns None for direct values.
pub fn env_var_name(value: &str) -> Option<String> {
    ENV_VAR_PATTERN
        .captures(value)
        .map(|caps| caps[1].to_string())
}

/// Resolve an `env:NAME` sentinel against the process environment.
///
/// Absence yields `Ok(None)` unless `required` is set. Direct (non-sentinel)
/// values resolve to themselves.
pub fn resolve_env_var(value: &str, required: bool) -> Result<Option<String>, CredentialError> {
    match env_var_name(value) {
        Some(name) => match std::env::var(&name) {
            Ok(resolved) => Ok(Some(resolved)),
            Err(_) if required => Err(CredentialError::MissingEnvVar(name)),
            Err(_) => {
                tracing::warn!(env_var = %name, "environment variable not set");
                Ok(None)
            }
        },
        None => Ok(Some(value.to_string())),
    }
}
