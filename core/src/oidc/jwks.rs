//! JWKS (JSON Web Key Set) fetching
//!
//! Fetches the issuer's published keys and turns them into verifying keys
//! indexed by key ID.

use jsonwebtoken::jwk::{JwkSet, PublicKeyUse};
use jsonwebtoken::DecodingKey;
use std::collections::HashMap;
use thiserror::Error;

use crate::error::TransportError;
use crate::platform::HttpClient;

/// Why a key set could not be fetched
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyFetchError {
    #[error("failed to fetch JWKS: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to fetch JWKS: HTTP {0}")]
    Status(u16),

    #[error("invalid JWKS: {0}")]
    Invalid(String),

    #[error("JWKS contains no usable signing keys")]
    Empty,
}

/// Verifying keys published by the issuer at one point in time
pub struct KeySet {
    keys: HashMap<String, DecodingKey>,
    fetched_at: u64,
}

impl KeySet {
    pub fn new(keys: HashMap<String, DecodingKey>, fetched_at: u64) -> Self {
        Self { keys, fetched_at }
    }

    pub fn get(&self, kid: &str) -> Option<&DecodingKey> {
        self.keys.get(kid)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn fetched_at(&self) -> u64 {
        self.fetched_at
    }

    /// Whether the set is younger than `max_age_secs` at `now`
    pub fn is_fresh(&self, now: u64, max_age_secs: u64) -> bool {
        now.saturating_sub(self.fetched_at) < max_age_secs
    }
}

/// Fetch JWKS from a URI
pub async fn fetch_key_set(
    jwks_uri: &str,
    http: &dyn HttpClient,
    now: u64,
) -> Result<KeySet, KeyFetchError> {
    let response = http
        .get(
            jwks_uri,
            &[
                ("Accept", "application/json"),
                ("User-Agent", "harbor-broker"),
            ],
        )
        .await?;

    if response.status != 200 {
        return Err(KeyFetchError::Status(response.status));
    }

    let jwks: JwkSet = response
        .json()
        .map_err(|e| KeyFetchError::Invalid(e.to_string()))?;

    let mut keys = HashMap::new();
    for jwk in &jwks.keys {
        let Some(kid) = jwk.common.key_id.as_deref() else {
            tracing::debug!("skipping JWK without kid");
            continue;
        };
        if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
            tracing::debug!(kid, "skipping encryption JWK");
            continue;
        }
        match DecodingKey::from_jwk(jwk) {
            Ok(key) => {
                keys.insert(kid.to_string(), key);
            }
            Err(e) => tracing::debug!(kid, error = %e, "skipping unusable JWK"),
        }
    }

    if keys.is_empty() {
        return Err(KeyFetchError::Empty);
    }

    Ok(KeySet::new(keys, now))
}
