//! Host platform implementations
//!
//! Implements core platform traits using native Rust libraries:
//! - Cache: moka in-memory cache with per-entry TTL
//! - HttpClient: reqwest with a bounded request timeout
//! - Clock: std::time::SystemTime
//! - Environment: std::env, with file-mounted secrets

use async_trait::async_trait;
use moka::Expiry;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use harbor_broker_core::error::TransportError;
use harbor_broker_core::platform::{Cache, Clock, Environment, HttpClient, HttpResponse};

/// Timeout applied to every outbound request
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct Entry {
    bytes: Vec<u8>,
    ttl: Duration,
}

struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-memory cache with TTL
pub struct MokaCache {
    cache: moka::future::Cache<String, Entry>,
}

impl MokaCache {
    pub fn new() -> Self {
        Self {
            cache: moka::future::Cache::builder()
                .max_capacity(1000)
                .expire_after(EntryExpiry)
                .build(),
        }
    }
}

#[async_trait]
impl Cache for MokaCache {
    async fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.cache.get(key).await.map(|entry| entry.bytes)
    }

    async fn put_bytes(&self, key: &str, value: &[u8], ttl_secs: u64) {
        let entry = Entry {
            bytes: value.to_vec(),
            ttl: Duration::from_secs(ttl_secs),
        };
        self.cache.insert(key.to_string(), entry).await;
    }
}

/// reqwest-based HTTP client
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?,
        })
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<HttpResponse, TransportError> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(transport_error)?.to_vec();
        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.get(url);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.send(builder).await
    }

    async fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.post(url).body(body.to_vec());
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.send(builder).await
    }
}

/// reqwest errors can carry the request URL; drop it, only the kind matters
fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Request("connection failed".to_string())
    } else {
        TransportError::Request(err.without_url().to_string())
    }
}

/// System clock using std::time
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs()
    }
}

/// Process environment
///
/// Secrets come from the variable itself or, for orchestrators that mount
/// them as files, from the path in `{NAME}_FILE`.
pub struct ProcessEnv;

impl Environment for ProcessEnv {
    fn get_var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn get_secret(&self, name: &str) -> Option<String> {
        if let Ok(value) = std::env::var(name) {
            return Some(value);
        }

        let path = std::env::var(format!("{}_FILE", name)).ok()?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Some(contents.trim_end_matches(['\r', '\n']).to_string()),
            Err(e) => {
                tracing::warn!(secret = name, path = %path, error = %e, "failed to read secret file");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_moka_cache_round_trip() {
        let cache = MokaCache::new();
        assert!(cache.get_bytes("project:images-a").await.is_none());
        cache.put_bytes("project:images-a", b"7", 300).await;
        assert_eq!(cache.get_bytes("project:images-a").await, Some(b"7".to_vec()));
    }

    #[test]
    fn test_system_clock_is_after_2024() {
        assert!(SystemClock.now_secs() > 1704067200);
    }
}
