//! Authorization policy module
//!
//! Handles loading of policy rules and the allow/deny decision for a
//! (caller project, scope, permission) request.

mod compile;
mod source;
pub mod types;

pub use compile::{load_policy_file, validate_rule, PolicyFileError};
pub use source::{MemoryPolicyStore, PolicySource, PolicySourceError, StaticPolicySource};
pub use types::{Decision, DenyReason, Permission, PolicyFile, PolicyRule};

use std::str::FromStr;
use std::sync::Arc;

use crate::error::{ApiError, Result};

/// Validate a requested scope name before it reaches any backend
pub fn validate_scope(scope: &str) -> Result<()> {
    types::check_scope_name(scope).map_err(ApiError::invalid_request)
}

/// Which policy backend to run with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyBackend {
    /// Rules fixed at startup from the policy file
    Static,
    /// Mutable store, seeded from the policy file
    Store,
}

impl FromStr for PolicyBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "store" => Ok(Self::Store),
            other => Err(format!("unknown policy backend '{}': must be 'static' or 'store'", other)),
        }
    }
}

/// Build the configured policy source from loaded rules
///
/// The static backend is the only source of rules, so it must have at least
/// one; a store may start empty and be filled later.
pub fn build_source(
    backend: PolicyBackend,
    rules: Vec<PolicyRule>,
) -> std::result::Result<Arc<dyn PolicySource>, PolicyFileError> {
    match backend {
        PolicyBackend::Static => {
            if rules.is_empty() {
                return Err(PolicyFileError::Empty);
            }
            Ok(Arc::new(StaticPolicySource::from_rules(rules)?))
        }
        PolicyBackend::Store => Ok(Arc::new(MemoryPolicyStore::with_rules(rules)?)),
    }
}

/// Policy decision point
pub struct PolicyDecisionPoint {
    source: Arc<dyn PolicySource>,
}

impl PolicyDecisionPoint {
    pub fn new(source: Arc<dyn PolicySource>) -> Self {
        Self { source }
    }

    /// Decide whether `caller_project` may obtain `permission` on `scope`
    ///
    /// Checks run in a fixed order: rule presence, then scope, then
    /// permission. The first failing check names the denial.
    pub async fn authorize(
        &self,
        caller_project: &str,
        scope: &str,
        permission: Permission,
    ) -> std::result::Result<Decision, PolicySourceError> {
        let Some(rule) = self.source.lookup(caller_project).await? else {
            return Ok(Decision::Deny(DenyReason::NoPolicy));
        };

        if !rule.scopes.contains(scope) {
            return Ok(Decision::Deny(DenyReason::ScopeNotAllowed));
        }

        if !rule.permissions.contains(&permission) {
            return Ok(Decision::Deny(DenyReason::PermissionNotAllowed));
        }

        Ok(Decision::Allow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct BrokenSource;

    #[async_trait]
    impl PolicySource for BrokenSource {
        async fn lookup(&self, _project: &str) -> std::result::Result<Option<PolicyRule>, PolicySourceError> {
            Err(PolicySourceError::Unavailable("connection refused".to_string()))
        }
    }

    fn pdp() -> PolicyDecisionPoint {
        let rules = vec![PolicyRule::new(
            "teamA/app",
            ["images-a"],
            [Permission::Read, Permission::Write],
        )];
        PolicyDecisionPoint::new(Arc::new(StaticPolicySource::from_rules(rules).unwrap()))
    }

    #[tokio::test]
    async fn test_allow_when_scope_and_permission_listed() {
        let pdp = pdp();
        for permission in [Permission::Read, Permission::Write] {
            assert_eq!(
                pdp.authorize("teamA/app", "images-a", permission).await.unwrap(),
                Decision::Allow
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_project_is_no_policy() {
        let pdp = pdp();
        for permission in [Permission::Read, Permission::Write, Permission::ReadWrite] {
            for scope in ["images-a", "anything"] {
                assert_eq!(
                    pdp.authorize("teamZ/other", scope, permission).await.unwrap(),
                    Decision::Deny(DenyReason::NoPolicy)
                );
            }
        }
    }

    #[tokio::test]
    async fn test_scope_checked_before_permission() {
        let pdp = pdp();
        for permission in [Permission::Read, Permission::Write, Permission::ReadWrite] {
            assert_eq!(
                pdp.authorize("teamA/app", "images-b", permission).await.unwrap(),
                Decision::Deny(DenyReason::ScopeNotAllowed)
            );
        }
    }

    #[tokio::test]
    async fn test_read_write_not_implied_by_read_and_write() {
        let pdp = pdp();
        assert_eq!(
            pdp.authorize("teamA/app", "images-a", Permission::ReadWrite).await.unwrap(),
            Decision::Deny(DenyReason::PermissionNotAllowed)
        );
    }

    #[tokio::test]
    async fn test_source_failure_propagates() {
        let pdp = PolicyDecisionPoint::new(Arc::new(BrokenSource));
        let err = pdp.authorize("teamA/app", "images-a", Permission::Read).await.unwrap_err();
        assert!(matches!(err, PolicySourceError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_store_changes_are_seen() {
        let store = Arc::new(MemoryPolicyStore::new());
        let pdp = PolicyDecisionPoint::new(store.clone());

        assert_eq!(
            pdp.authorize("teamA/app", "images-a", Permission::Read).await.unwrap(),
            Decision::Deny(DenyReason::NoPolicy)
        );

        store
            .upsert(PolicyRule::new("teamA/app", ["images-a"], [Permission::Read]))
            .unwrap();
        assert_eq!(
            pdp.authorize("teamA/app", "images-a", Permission::Read).await.unwrap(),
            Decision::Allow
        );
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("static".parse::<PolicyBackend>().unwrap(), PolicyBackend::Static);
        assert_eq!(" Store ".parse::<PolicyBackend>().unwrap(), PolicyBackend::Store);
        assert!("database".parse::<PolicyBackend>().is_err());
    }

    #[test]
    fn test_static_backend_requires_rules() {
        assert_eq!(
            build_source(PolicyBackend::Static, vec![]).err(),
            Some(PolicyFileError::Empty)
        );
        assert!(build_source(PolicyBackend::Store, vec![]).is_ok());
    }

    #[test]
    fn test_validate_scope() {
        assert!(validate_scope("images-a").is_ok());
        let err = validate_scope("../x").unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
