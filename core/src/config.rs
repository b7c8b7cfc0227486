//! Configuration and secrets management

use crate::error::ConfigError;
use crate::platform::Environment;
use crate::policy::PolicyBackend;

/// Application configuration loaded from environment
#[derive(Clone)]
pub struct BrokerConfig {
    /// Identity provider base URL (e.g., "https://gitlab.example.com")
    pub oidc_instance_url: String,
    /// Audience this broker expects in incoming tokens
    pub oidc_audience: String,
    /// Issuers whose tokens are trusted
    pub oidc_issuers: Vec<String>,
    /// Key discovery endpoint
    pub oidc_jwks_url: String,
    /// Registry base URL (e.g., "https://harbor.example.com")
    pub harbor_url: String,
    /// Registry API user
    pub harbor_username: String,
    /// Registry API password
    pub harbor_password: String,
    /// Lifetime of minted robot accounts, in minutes
    pub robot_ttl_minutes: u32,
    /// Which policy source to run with
    pub policy_backend: PolicyBackend,
    /// Path of the YAML policy file
    pub policy_file: String,
}

impl BrokerConfig {
    /// Load configuration from platform environment
    pub fn from_env(env: &dyn Environment) -> Result<Self, ConfigError> {
        let oidc_instance_url = required_var(env, "OIDC_INSTANCE_URL")?;
        validate_base_url(&oidc_instance_url, "OIDC_INSTANCE_URL")?;
        let oidc_instance_url = oidc_instance_url.trim_end_matches('/').to_string();

        let oidc_issuers = match env.get_var("OIDC_ISSUERS") {
            Some(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => vec![oidc_instance_url.clone()],
        };

        let oidc_jwks_url = match env.get_var("OIDC_JWKS_URL") {
            Some(url) if !url.is_empty() => url,
            _ => format!("{}/oauth/discovery/keys", oidc_instance_url),
        };
        validate_base_url(&oidc_jwks_url, "OIDC_JWKS_URL")?;

        let harbor_url = required_var(env, "HARBOR_URL")?;
        validate_base_url(&harbor_url, "HARBOR_URL")?;

        let robot_ttl_minutes = match env.get_var("ROBOT_TTL_MINUTES") {
            Some(raw) => parse_ttl(&raw)?,
            None => DEFAULT_ROBOT_TTL_MINUTES,
        };

        let policy_backend = match env.get_var("POLICY_BACKEND") {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                name: "POLICY_BACKEND",
                reason,
            })?,
            None => PolicyBackend::Static,
        };

        Ok(Self {
            oidc_instance_url,
            oidc_audience: required_var(env, "OIDC_AUDIENCE")?,
            oidc_issuers,
            oidc_jwks_url,
            harbor_url: harbor_url.trim_end_matches('/').to_string(),
            harbor_username: env
                .get_secret("HARBOR_USERNAME")
                .ok_or(ConfigError::Missing("HARBOR_USERNAME"))?,
            harbor_password: env
                .get_secret("HARBOR_PASSWORD")
                .ok_or(ConfigError::Missing("HARBOR_PASSWORD"))?,
            robot_ttl_minutes,
            policy_backend,
            policy_file: env
                .get_var("POLICY_FILE")
                .unwrap_or_else(|| DEFAULT_POLICY_FILE.to_string()),
        })
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("oidc_instance_url", &self.oidc_instance_url)
            .field("oidc_audience", &self.oidc_audience)
            .field("oidc_issuers", &self.oidc_issuers)
            .field("oidc_jwks_url", &self.oidc_jwks_url)
            .field("harbor_url", &self.harbor_url)
            .field("harbor_username", &self.harbor_username)
            .field("harbor_password", &"<redacted>")
            .field("robot_ttl_minutes", &self.robot_ttl_minutes)
            .field("policy_backend", &self.policy_backend)
            .field("policy_file", &self.policy_file)
            .finish()
    }
}

fn required_var(env: &dyn Environment, name: &'static str) -> Result<String, ConfigError> {
    env.get_var(name)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn parse_ttl(raw: &str) -> Result<u32, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        name: "ROBOT_TTL_MINUTES",
        reason: reason.to_string(),
    };
    let minutes: u32 = raw.trim().parse().map_err(|_| invalid("not a number"))?;
    if minutes == 0 {
        return Err(invalid("must be greater than zero"));
    }
    Ok(minutes)
}

fn validate_base_url(raw: &str, name: &'static str) -> Result<(), ConfigError> {
    let url = url::Url::parse(raw).map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::Invalid {
            name,
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    Ok(())
}

/// Credential lifetime when none is configured (10 minutes)
pub const DEFAULT_ROBOT_TTL_MINUTES: u32 = 10;

pub const DEFAULT_POLICY_FILE: &str = "policies.yaml";

/// Maximum age of the verifying key set before it is refetched (1 hour)
pub const KEY_SET_MAX_AGE_SECS: u64 = 3600;

/// Cache TTL for registry project ID lookups (5 minutes)
pub const PROJECT_CACHE_TTL_SECS: u64 = 300;
