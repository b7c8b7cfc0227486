//! CI job token verification
//!
//! Verifies the signature of a CI job token against the issuer's key set,
//! then checks issuer, audience and expiry, in that order.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use super::keyset::{KeySetCache, KeySetError};
use crate::platform::Clock;

/// Signing algorithms a CI job token may use
///
/// Only the RSA PKCS#1 family. `none` is not representable in
/// [`Algorithm`] and every HMAC variant is refused, so a public key can
/// never be reused as a shared secret.
pub const ACCEPTED_ALGORITHMS: &[Algorithm] = &[Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];

/// Identity claims of a verified CI job token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityClaims {
    /// Issuer
    pub iss: String,

    /// Audience (can be string or array)
    #[serde(deserialize_with = "deserialize_audience")]
    pub aud: Vec<String>,

    /// Expiration time
    pub exp: u64,

    /// Issued at
    #[serde(default)]
    pub iat: Option<u64>,

    #[serde(default)]
    pub sub: Option<String>,

    /// Path of the CI project that ran the job (e.g. "teamA/app")
    pub project_path: String,

    #[serde(deserialize_with = "deserialize_id")]
    pub pipeline_id: String,

    #[serde(deserialize_with = "deserialize_id")]
    pub job_id: String,

    #[serde(default)]
    pub ref_path: Option<String>,
}

/// Why a token was rejected
///
/// Kept for logs only; callers get a uniform "invalid or expired token".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("token header has no 'kid'")]
    MissingKeyId,

    #[error("key '{0}' not found in JWKS")]
    KeyNotFound(String),

    #[error("verifying keys unavailable: {0}")]
    KeySetUnavailable(String),

    #[error("signature verification failed: {0}")]
    Signature(String),

    #[error("untrusted issuer '{0}'")]
    Issuer(String),

    #[error("audience mismatch: got {0:?}")]
    Audience(Vec<String>),

    #[error("token expired at {exp} (now {now})")]
    Expired { exp: u64, now: u64 },
}

impl VerifyError {
    /// True when the failure says nothing about the token itself
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::KeySetUnavailable(_))
    }
}

impl From<KeySetError> for VerifyError {
    fn from(err: KeySetError) -> Self {
        match err {
            KeySetError::KeyNotFound(kid) => Self::KeyNotFound(kid),
            KeySetError::Unavailable(reason) => Self::KeySetUnavailable(reason),
        }
    }
}

pub struct TokenVerifier {
    keys: Arc<KeySetCache>,
    issuers: Vec<String>,
    audience: String,
    clock: Arc<dyn Clock>,
}

impl TokenVerifier {
    pub fn new(
        keys: Arc<KeySetCache>,
        issuers: Vec<String>,
        audience: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            keys,
            issuers,
            audience: audience.into(),
            clock,
        }
    }

    /// Verify a raw token and return its claims
    pub async fn verify(&self, raw_token: &str) -> Result<IdentityClaims, VerifyError> {
        let header = decode_header(raw_token).map_err(|e| classify_header_error(raw_token, e))?;

        if !ACCEPTED_ALGORITHMS.contains(&header.alg) {
            return Err(VerifyError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }

        let kid = header.kid.as_deref().ok_or(VerifyError::MissingKeyId)?;
        let key = self.keys.get_verifying_key(kid).await?;

        // Registered claims are checked below, in a fixed order, against our
        // own clock; the library only checks the signature.
        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.set_required_spec_claims::<&str>(&[]);

        let claims = decode::<IdentityClaims>(raw_token, &key, &validation)
            .map_err(classify_decode_error)?
            .claims;

        if !self.issuers.iter().any(|i| *i == claims.iss) {
            return Err(VerifyError::Issuer(claims.iss));
        }

        if !claims.aud.iter().any(|a| *a == self.audience) {
            return Err(VerifyError::Audience(claims.aud));
        }

        let now = self.clock.now_secs();
        if claims.exp <= now {
            return Err(VerifyError::Expired { exp: claims.exp, now });
        }

        validate_project_path(&claims.project_path)?;

        Ok(claims)
    }
}

/// Distinguish a refused algorithm from plain garbage when the header
/// doesn't parse (`"alg": "none"` is not a valid [`Algorithm`])
fn classify_header_error(raw_token: &str, err: jsonwebtoken::errors::Error) -> VerifyError {
    let alg = raw_token
        .split('.')
        .next()
        .and_then(|segment| base64_url_decode(segment).ok())
        .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
        .and_then(|header| header.get("alg").and_then(|a| a.as_str()).map(str::to_string));

    match alg {
        Some(alg) => VerifyError::UnsupportedAlgorithm(alg),
        None => VerifyError::Malformed(format!("invalid JWT header: {}", err)),
    }
}

fn classify_decode_error(err: jsonwebtoken::errors::Error) -> VerifyError {
    match err.kind() {
        ErrorKind::InvalidSignature => VerifyError::Signature("signature mismatch".to_string()),
        ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
            VerifyError::UnsupportedAlgorithm(err.to_string())
        }
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => VerifyError::Malformed(err.to_string()),
        _ => VerifyError::Signature(err.to_string()),
    }
}

/// Base64 URL decode
fn base64_url_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    URL_SAFE_NO_PAD.decode(input).or_else(|_| {
        use base64::engine::general_purpose::URL_SAFE;
        URL_SAFE.decode(input)
    })
}

/// The project path keys the policy lookup and lands in audit records
fn validate_project_path(path: &str) -> Result<(), VerifyError> {
    if path.is_empty() {
        return Err(VerifyError::Malformed("project_path cannot be empty".to_string()));
    }

    if path.len() > 255 {
        return Err(VerifyError::Malformed("project_path too long".to_string()));
    }

    if path.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(VerifyError::Malformed(
            "project_path contains invalid characters".to_string(),
        ));
    }

    Ok(())
}

/// Deserialize audience as either string or array
fn deserialize_audience<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Audience {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Audience::deserialize(deserializer)? {
        Audience::One(aud) => vec![aud],
        Audience::Many(auds) => auds,
    })
}

/// Pipeline and job IDs arrive as strings from some issuers, numbers from others
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(u64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(id) => id,
        Id::Number(id) => id.to_string(),
    })
}
