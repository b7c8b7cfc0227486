//! Policy sources
//!
//! Where rules come from. The decision point only ever reads through
//! [`PolicySource`]; which backend sits behind it is chosen once at startup.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

use super::compile::{validate_rule, PolicyFileError};
use super::types::PolicyRule;

/// A policy backend could not answer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicySourceError {
    #[error("policy source unavailable: {0}")]
    Unavailable(String),
}

/// Read access to policy rules, keyed by exact caller project path
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn lookup(&self, project: &str) -> Result<Option<PolicyRule>, PolicySourceError>;
}

/// Immutable rules loaded from the policy file
#[derive(Debug, Default)]
pub struct StaticPolicySource {
    rules: HashMap<String, PolicyRule>,
}

impl StaticPolicySource {
    pub fn from_rules(rules: Vec<PolicyRule>) -> Result<Self, PolicyFileError> {
        let mut map = HashMap::with_capacity(rules.len());
        for (index, rule) in rules.into_iter().enumerate() {
            validate_rule(&rule).map_err(|reason| PolicyFileError::Invalid { index, reason })?;
            if map.contains_key(&rule.project) {
                return Err(PolicyFileError::Duplicate(rule.project));
            }
            map.insert(rule.project.clone(), rule);
        }
        Ok(Self { rules: map })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn lookup(&self, project: &str) -> Result<Option<PolicyRule>, PolicySourceError> {
        Ok(self.rules.get(project).cloned())
    }
}

/// Mutable in-process rule store
///
/// Upserting a project replaces its rule, so there is never more than one
/// rule per project.
#[derive(Debug, Default)]
pub struct MemoryPolicyStore {
    rules: RwLock<HashMap<String, PolicyRule>>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from already-validated rules
    pub fn with_rules(rules: Vec<PolicyRule>) -> Result<Self, PolicyFileError> {
        let store = Self::new();
        for (index, rule) in rules.into_iter().enumerate() {
            if store.rules.read().contains_key(&rule.project) {
                return Err(PolicyFileError::Duplicate(rule.project));
            }
            store
                .upsert(rule)
                .map_err(|reason| PolicyFileError::Invalid { index, reason })?;
        }
        Ok(store)
    }

    /// Insert or replace the rule for `rule.project`, returning the previous one
    pub fn upsert(&self, rule: PolicyRule) -> Result<Option<PolicyRule>, String> {
        validate_rule(&rule)?;
        tracing::info!(project = %rule.project, scopes = rule.scopes.len(), "policy rule stored");
        Ok(self.rules.write().insert(rule.project.clone(), rule))
    }

    pub fn remove(&self, project: &str) -> Option<PolicyRule> {
        let removed = self.rules.write().remove(project);
        if removed.is_some() {
            tracing::info!(project, "policy rule removed");
        }
        removed
    }

    /// All rules, ordered by project path
    pub fn list(&self) -> Vec<PolicyRule> {
        let mut rules: Vec<PolicyRule> = self.rules.read().values().cloned().collect();
        rules.sort_by(|a, b| a.project.cmp(&b.project));
        rules
    }
}

#[async_trait]
impl PolicySource for MemoryPolicyStore {
    async fn lookup(&self, project: &str) -> Result<Option<PolicyRule>, PolicySourceError> {
        Ok(self.rules.read().get(project).cloned())
    }
}
