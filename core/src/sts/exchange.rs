//! Credential exchange
//!
//! Exchanges a CI job token for a short-lived registry robot account.
//!
//! A request moves through `Received -> Verified -> Authorized -> Minted ->
//! Completed` and leaves early with a bad request, unauthenticated,
//! forbidden or internal rejection. Only a policy denial and a completed
//! mint are audited: before verification the caller is unknown, and a mint
//! failure is an infrastructure fault rather than an access decision.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::audit::{AuditOutcome, AuditRecord, AuditSink};
use crate::config::BrokerConfig;
use crate::error::{ApiError, Result};
use crate::oidc::{IdentityClaims, KeySetCache, TokenVerifier};
use crate::platform::{Cache, Clock, HttpClient};
use crate::policy::{self, Decision, Permission, PolicyDecisionPoint, PolicySource};
use crate::registry::{Credential, CredentialMinter, HarborClient};

/// Platform-neutral exchange request
///
/// Scope and permission are optional here so that a missing field is
/// reported as a bad request rather than lost in body parsing.
#[derive(Clone, Default)]
pub struct ExchangeRequest {
    pub bearer_token: String,
    pub scope: Option<String>,
    pub permission: Option<String>,
}

/// Credential exchange response
#[derive(Clone, Serialize)]
pub struct ExchangeResponse {
    pub username: String,
    pub password: String,
    /// RFC 3339
    pub expires_at: String,
}

impl fmt::Debug for ExchangeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeResponse")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl From<Credential> for ExchangeResponse {
    fn from(credential: Credential) -> Self {
        Self {
            username: credential.account_name,
            password: credential.secret,
            expires_at: credential.expires_at.to_rfc3339(),
        }
    }
}

/// Last stage a request reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Verified,
    Authorized,
    Minted,
    Completed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Received => "received",
            Self::Verified => "verified",
            Self::Authorized => "authorized",
            Self::Minted => "minted",
            Self::Completed => "completed",
        })
    }
}

pub struct Broker {
    verifier: TokenVerifier,
    pdp: PolicyDecisionPoint,
    minter: CredentialMinter,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    ttl_minutes: u32,
}

impl Broker {
    pub fn new(
        verifier: TokenVerifier,
        pdp: PolicyDecisionPoint,
        minter: CredentialMinter,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        ttl_minutes: u32,
    ) -> Self {
        Self {
            verifier,
            pdp,
            minter,
            audit,
            clock,
            ttl_minutes,
        }
    }

    /// Wire a broker from configuration and platform services
    pub fn from_config(
        config: &BrokerConfig,
        policy: Arc<dyn PolicySource>,
        audit: Arc<dyn AuditSink>,
        http: Arc<dyn HttpClient>,
        cache: Arc<dyn Cache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let keys = Arc::new(KeySetCache::new(
            config.oidc_jwks_url.clone(),
            http.clone(),
            clock.clone(),
        ));
        let verifier = TokenVerifier::new(
            keys,
            config.oidc_issuers.clone(),
            config.oidc_audience.clone(),
            clock.clone(),
        );
        let client = HarborClient::new(
            config.harbor_url.clone(),
            config.harbor_username.clone(),
            config.harbor_password.clone(),
            http,
        );
        let minter = CredentialMinter::new(client, cache, clock.clone());

        Self::new(
            verifier,
            PolicyDecisionPoint::new(policy),
            minter,
            audit,
            clock,
            config.robot_ttl_minutes,
        )
    }

    /// Handle one exchange request
    pub async fn exchange(&self, request: ExchangeRequest) -> Result<ExchangeResponse> {
        // 1. Validate input before any external call
        let (scope, permission) = parse_request(&request)?;

        // 2. Verify the CI job token
        let claims = match self.verifier.verify(&request.bearer_token).await {
            Ok(claims) => claims,
            Err(e) if e.is_infrastructure() => {
                tracing::error!(stage = %Stage::Received, error = %e, "token verification unavailable");
                return Err(ApiError::internal("credential service unavailable"));
            }
            Err(e) => {
                tracing::warn!(stage = %Stage::Received, error = %e, "token verification failed");
                return Err(ApiError::unauthenticated());
            }
        };

        let caller = claims.project_path.as_str();

        // 3. Authorize against policy
        let decision = match self.pdp.authorize(caller, &scope, permission).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(stage = %Stage::Verified, caller, error = %e, "policy lookup failed");
                return Err(ApiError::internal("failed to evaluate policy"));
            }
        };

        if let Decision::Deny(reason) = decision {
            tracing::warn!(
                stage = %Stage::Verified,
                caller,
                scope = %scope,
                %permission,
                %reason,
                "request denied by policy"
            );
            self.emit(
                caller,
                AuditOutcome::Denied {
                    scope,
                    permission,
                    reason,
                },
            )
            .await;
            return Err(ApiError::forbidden());
        }

        // 4. Mint the robot account
        let credential = match self
            .minter
            .mint(&scope, permission, self.ttl_minutes, &claims.job_id)
            .await
        {
            Ok(credential) => credential,
            Err(e) => {
                tracing::error!(stage = %Stage::Authorized, caller, scope = %scope, error = %e, "credential minting failed");
                return Err(ApiError::internal("failed to issue credential"));
            }
        };

        // 5. Audit and respond
        self.emit(caller, issued_outcome(&scope, permission, &credential, &claims))
            .await;

        tracing::info!(
            stage = %Stage::Completed,
            caller,
            scope = %scope,
            %permission,
            account_name = %credential.account_name,
            expires_at = %credential.expires_at.to_rfc3339(),
            "credential issued"
        );

        Ok(credential.into())
    }

    /// Write one audit record; a failing sink never fails the request
    async fn emit(&self, caller: &str, outcome: AuditOutcome) {
        let record = AuditRecord {
            timestamp: DateTime::<Utc>::from_timestamp(self.clock.now_secs() as i64, 0)
                .unwrap_or_default(),
            caller_project: caller.to_string(),
            outcome,
        };
        if let Err(e) = self.audit.record(&record).await {
            tracing::warn!(caller, error = %e, "failed to write audit record");
        }
    }
}

fn parse_request(request: &ExchangeRequest) -> Result<(String, Permission)> {
    let scope = request
        .scope
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::invalid_request("scope is required"))?;
    policy::validate_scope(scope)?;

    let permission = request
        .permission
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::invalid_request("permission is required"))?
        .parse::<Permission>()
        .map_err(ApiError::invalid_request)?;

    Ok((scope.to_string(), permission))
}

fn issued_outcome(
    scope: &str,
    permission: Permission,
    credential: &Credential,
    claims: &IdentityClaims,
) -> AuditOutcome {
    AuditOutcome::Issued {
        scope: scope.to_string(),
        permission,
        account_id: credential.account_id,
        account_name: credential.account_name.clone(),
        expiry: credential.expires_at,
        pipeline_id: claims.pipeline_id.clone(),
        job_id: claims.job_id.clone(),
    }
}
