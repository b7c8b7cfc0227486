//! Verifying key cache
//!
//! Holds the issuer's current [`KeySet`] and refetches it once it is older
//! than the freshness window.
//!
//! Reads of a fresh set only take a short read lock and never wait on the
//! network. Refreshes are single-flight: callers that find the set stale
//! queue on `refresh_lock`, and whoever gets it first re-checks before
//! fetching, so a burst of stale readers causes one fetch and every waiter
//! sees the set it produced. A failed refresh leaves the previous set in
//! place (stale keys keep verifying) and is only fatal when no set was ever
//! loaded.

use jsonwebtoken::DecodingKey;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use super::jwks::{fetch_key_set, KeySet};
use crate::config::KEY_SET_MAX_AGE_SECS;
use crate::platform::{Clock, HttpClient};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeySetError {
    #[error("key '{0}' not found in JWKS")]
    KeyNotFound(String),

    #[error("no key set available: {0}")]
    Unavailable(String),
}

pub struct KeySetCache {
    jwks_uri: String,
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    max_age_secs: u64,
    current: RwLock<Option<Arc<KeySet>>>,
    refresh_lock: tokio::sync::Mutex<()>,
    /// Bumped when a fetch finishes, successful or not
    attempts: AtomicU64,
}

impl KeySetCache {
    pub fn new(jwks_uri: impl Into<String>, http: Arc<dyn HttpClient>, clock: Arc<dyn Clock>) -> Self {
        Self {
            jwks_uri: jwks_uri.into(),
            http,
            clock,
            max_age_secs: KEY_SET_MAX_AGE_SECS,
            current: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn with_max_age(mut self, max_age_secs: u64) -> Self {
        self.max_age_secs = max_age_secs;
        self
    }

    /// Look up the verifying key for `kid`, refreshing a stale set first
    pub async fn get_verifying_key(&self, kid: &str) -> Result<DecodingKey, KeySetError> {
        let set = self.current_set().await?;
        set.get(kid)
            .cloned()
            .ok_or_else(|| KeySetError::KeyNotFound(kid.to_string()))
    }

    /// Number of fetches completed so far
    pub fn fetch_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Option<Arc<KeySet>> {
        self.current.read().clone()
    }

    async fn current_set(&self) -> Result<Arc<KeySet>, KeySetError> {
        if let Some(set) = self.snapshot() {
            if set.is_fresh(self.clock.now_secs(), self.max_age_secs) {
                return Ok(set);
            }
        }

        let seen_attempts = self.attempts.load(Ordering::SeqCst);
        let _guard = self.refresh_lock.lock().await;

        let stale = match self.snapshot() {
            Some(set) if set.is_fresh(self.clock.now_secs(), self.max_age_secs) => return Ok(set),
            other => other,
        };

        // A refresh finished while we queued and it failed.
        // Don't hammer the endpoint: take whatever it left behind.
        if self.attempts.load(Ordering::SeqCst) != seen_attempts {
            return stale.ok_or_else(|| {
                KeySetError::Unavailable("key set refresh failed".to_string())
            });
        }

        let now = self.clock.now_secs();
        let fetched = fetch_key_set(&self.jwks_uri, self.http.as_ref(), now).await;
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match fetched {
            Ok(fresh) => {
                let fresh = Arc::new(fresh);
                *self.current.write() = Some(fresh.clone());
                tracing::info!(keys = fresh.len(), jwks_uri = %self.jwks_uri, "refreshed verifying key set");
                Ok(fresh)
            }
            Err(e) => match stale {
                Some(set) => {
                    tracing::warn!(
                        error = %e,
                        age_secs = now.saturating_sub(set.fetched_at()),
                        "key set refresh failed, serving stale keys"
                    );
                    Ok(set)
                }
                None => {
                    tracing::error!(error = %e, jwks_uri = %self.jwks_uri, "key set unavailable");
                    Err(KeySetError::Unavailable(e.to_string()))
                }
            },
        }
    }
}
