//! Policy file loading
//!
//! Parses the YAML policy document and validates every rule before it can
//! back a policy source.

use std::collections::HashSet;
use thiserror::Error;

use super::types::{check_scope_name, PolicyFile, PolicyRule};

/// Why a policy document or rule was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyFileError {
    #[error("invalid policy YAML: {0}")]
    Yaml(String),

    #[error("policy[{index}]: {reason}")]
    Invalid { index: usize, reason: String },

    #[error("duplicate policy for project '{0}'")]
    Duplicate(String),

    #[error("at least one policy rule is required")]
    Empty,
}

/// Parse and validate a policy document
pub fn load_policy_file(yaml: &str) -> Result<Vec<PolicyRule>, PolicyFileError> {
    let file: PolicyFile =
        serde_yaml::from_str(yaml).map_err(|e| PolicyFileError::Yaml(e.to_string()))?;

    let mut seen = HashSet::new();
    for (index, rule) in file.policies.iter().enumerate() {
        validate_rule(rule).map_err(|reason| PolicyFileError::Invalid { index, reason })?;
        if !seen.insert(rule.project.as_str()) {
            return Err(PolicyFileError::Duplicate(rule.project.clone()));
        }
    }

    Ok(file.policies)
}

/// Check a single rule, returning what is wrong with it
pub fn validate_rule(rule: &PolicyRule) -> Result<(), String> {
    if rule.project.trim().is_empty() {
        return Err("project is required".to_string());
    }

    if rule.scopes.is_empty() {
        return Err("scopes must not be empty".to_string());
    }

    for scope in &rule.scopes {
        check_scope_name(scope).map_err(|reason| format!("scope '{}': {}", scope, reason))?;
    }

    if rule.permissions.is_empty() {
        return Err("permissions must not be empty".to_string());
    }

    Ok(())
}
