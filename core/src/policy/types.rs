//! Policy type definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Coarse access level a caller may request
///
/// A closed set. Holding `read` and `write` separately does not imply
/// `read-write`; a rule must list the exact value requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    Read,
    Write,
    ReadWrite,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadWrite => "read-write",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "read-write" => Ok(Self::ReadWrite),
            other => Err(format!(
                "invalid permission '{}': must be 'read', 'write', or 'read-write'",
                other
            )),
        }
    }
}

/// Authorization rule for one caller project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Caller project path, matched exactly
    #[serde(alias = "gitlab_project")]
    pub project: String,

    /// Target scopes the caller may request credentials for
    #[serde(alias = "harbor_projects")]
    pub scopes: BTreeSet<String>,

    #[serde(alias = "allowed_permissions")]
    pub permissions: BTreeSet<Permission>,
}

impl PolicyRule {
    pub fn new(
        project: impl Into<String>,
        scopes: impl IntoIterator<Item = impl Into<String>>,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Self {
        Self {
            project: project.into(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            permissions: permissions.into_iter().collect(),
        }
    }
}

/// Top-level shape of a policy file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
}

/// Outcome of an authorization check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NoPolicy,
    ScopeNotAllowed,
    PermissionNotAllowed,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoPolicy => "no policy",
            Self::ScopeNotAllowed => "scope not allowed",
            Self::PermissionNotAllowed => "permission not allowed",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maximum length of a scope name
pub const MAX_SCOPE_LENGTH: usize = 255;

/// Check a registry scope name, returning what is wrong with it
///
/// Scope names end up in registry API paths and queries, so only the
/// registry's own project-name alphabet is accepted.
pub fn check_scope_name(scope: &str) -> Result<(), String> {
    if scope.is_empty() {
        return Err("scope cannot be empty".to_string());
    }

    if scope.len() > MAX_SCOPE_LENGTH {
        return Err(format!("scope too long (max {} characters)", MAX_SCOPE_LENGTH));
    }

    if scope.contains("..") {
        return Err("scope contains invalid characters (path traversal attempt)".to_string());
    }

    for c in scope.chars() {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '_' && c != '.' {
            return Err(format!("scope contains invalid character: '{}'", c));
        }
    }

    Ok(())
}
