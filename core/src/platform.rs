//! Platform abstraction traits
//!
//! These traits define the boundary between platform-agnostic core logic and
//! the host process (HTTP client, in-memory cache, wall clock, environment).

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::TransportError;

/// Key-value cache with TTL support (uses raw bytes to be dyn-compatible)
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_bytes(&self, key: &str) -> Option<Vec<u8>>;
    async fn put_bytes(&self, key: &str, value: &[u8], ttl_secs: u64);
}

/// HTTP client for outbound requests (key discovery, registry API)
///
/// Implementations must bound every request with a timeout and report it as
/// [`TransportError::Timeout`].
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse, TransportError>;
    async fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<HttpResponse, TransportError>;
}

/// HTTP response from an outbound request
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse body as UTF-8 string
    pub fn text(&self) -> std::result::Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.clone())
    }

    /// Parse body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Clock for current time (enables testing with deterministic timestamps)
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> u64;
}

/// Environment/secrets access
pub trait Environment: Send + Sync {
    fn get_var(&self, name: &str) -> Option<String>;
    fn get_secret(&self, name: &str) -> Option<String>;
}

/// Typed cache get: deserialize from bytes
///
/// An undecodable entry is treated as a miss.
pub async fn cache_get<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Option<T> {
    let bytes = cache.get_bytes(key).await?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(key, error = %e, "discarding undecodable cache entry");
            None
        }
    }
}

/// Typed cache put: serialize to bytes
pub async fn cache_put<T: Serialize>(cache: &dyn Cache, key: &str, value: &T, ttl_secs: u64) {
    match serde_json::to_vec(value) {
        Ok(bytes) => cache.put_bytes(key, &bytes, ttl_secs).await,
        Err(e) => tracing::debug!(key, error = %e, "cache serialization failed"),
    }
}
