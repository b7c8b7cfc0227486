//! Mock implementations of platform traits for testing

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::audit::{AuditError, AuditRecord, AuditSink};
use crate::error::TransportError;
use crate::platform::{Cache, Clock, Environment, HttpClient, HttpResponse};

pub const TEST_NOW: u64 = 1706900000;
pub const TEST_ISSUER: &str = "https://gitlab.example.com";
pub const TEST_AUDIENCE: &str = "https://broker.example.com";
pub const TEST_JWKS_URL: &str = "https://gitlab.example.com/oauth/discovery/keys";

/// Mock cache backed by an in-memory HashMap
pub struct MemoryCache {
    store: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.store.lock().unwrap().get(key).cloned()
    }

    async fn put_bytes(&self, key: &str, value: &[u8], _ttl_secs: u64) {
        self.store.lock().unwrap().insert(key.to_string(), value.to_vec());
    }
}

/// A request seen by [`MockHttp`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn json_body(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("request body should be JSON")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Mock HTTP client with pre-configured responses
///
/// The first pattern contained in the request URL wins.
pub struct MockHttp {
    responses: Mutex<Vec<(String, HttpResponse)>>,
    requests: Mutex<Vec<RecordedRequest>>,
    delay: Option<Duration>,
}

impl MockHttp {
    pub fn new(responses: Vec<(String, HttpResponse)>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleep before every response, so concurrent callers overlap
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_response(&self, pattern: &str, response: HttpResponse) {
        let mut responses = self.responses.lock().unwrap();
        match responses.iter_mut().find(|(p, _)| p == pattern) {
            Some(entry) => entry.1 = response,
            None => responses.push((pattern.to_string(), response)),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests whose URL contains `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.contains(pattern))
            .count()
    }

    async fn respond(
        &self,
        method: &'static str,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            method,
            url: url.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.to_vec(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let responses = self.responses.lock().unwrap();
        for (pattern, response) in responses.iter() {
            if url.contains(pattern.as_str()) {
                return Ok(response.clone());
            }
        }
        Err(TransportError::Request(format!(
            "no mock response for {} {}",
            method, url
        )))
    }
}

#[async_trait]
impl HttpClient for MockHttp {
    async fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<HttpResponse, TransportError> {
        self.respond("GET", url, headers, &[]).await
    }

    async fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<HttpResponse, TransportError> {
        self.respond("POST", url, headers, body).await
    }
}

/// Mock clock that only moves when told to
pub struct MockClock(AtomicU64);

impl MockClock {
    pub fn new(now_secs: u64) -> Self {
        Self(AtomicU64::new(now_secs))
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_secs(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Mock environment backed by in-memory maps
#[derive(Default)]
pub struct MockEnv {
    vars: HashMap<String, String>,
    secrets: HashMap<String, String>,
}

impl MockEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }

    pub fn secret(mut self, name: &str, value: &str) -> Self {
        self.secrets.insert(name.to_string(), value.to_string());
        self
    }
}

impl Environment for MockEnv {
    fn get_var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }

    fn get_secret(&self, name: &str) -> Option<String> {
        self.secrets.get(name).cloned()
    }
}

/// Audit sink that always fails
pub struct FailingAuditSink;

#[async_trait]
impl AuditSink for FailingAuditSink {
    async fn record(&self, _record: &AuditRecord) -> Result<(), AuditError> {
        Err(AuditError::Unavailable("audit store offline".to_string()))
    }
}

/// RSA signing key generated at runtime, with its public half as a JWK
pub struct TestKey {
    pub kid: String,
    pub private_pem: String,
    pub jwk: serde_json::Value,
}

/// Generate a fresh RSA key pair at runtime (never touches disk)
fn generate_test_key(kid: &str) -> TestKey {
    use rand::rngs::OsRng;
    use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
    use rsa::traits::PublicKeyParts;
    use rsa::RsaPrivateKey;

    let private_key = RsaPrivateKey::new(&mut OsRng, 2048).expect("key generation failed");
    let private_pem = private_key
        .to_pkcs1_pem(LineEnding::LF)
        .expect("private key PEM export failed")
        .to_string();
    let public_key = private_key.to_public_key();

    TestKey {
        kid: kid.to_string(),
        private_pem,
        jwk: json!({
            "kty": "RSA",
            "kid": kid,
            "use": "sig",
            "alg": "RS256",
            "n": URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            "e": URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
        }),
    }
}

/// Primary signing key, shared across tests (RSA generation is slow)
pub fn test_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(|| generate_test_key("test-key-1"))
}

/// A second, unrelated key
pub fn rotated_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(|| generate_test_key("test-key-2"))
}

/// JWKS document listing the given keys
pub fn jwks_response(keys: &[&TestKey]) -> HttpResponse {
    let body = json!({ "keys": keys.iter().map(|k| k.jwk.clone()).collect::<Vec<_>>() });
    HttpResponse::new(200, body.to_string())
}

/// Claims a well-formed CI job token carries
pub fn ci_claims(now: u64) -> serde_json::Value {
    json!({
        "iss": TEST_ISSUER,
        "sub": "project_path:teamA/app:ref_type:branch:ref:main",
        "aud": TEST_AUDIENCE,
        "exp": now + 300,
        "iat": now - 10,
        "project_path": "teamA/app",
        "ref_path": "refs/heads/main",
        "pipeline_id": "1001",
        "job_id": "2002",
    })
}

/// Sign claims with RS256 under the key's `kid`
pub fn sign_token(key: &TestKey, claims: &serde_json::Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(key.kid.clone());
    let encoding_key =
        EncodingKey::from_rsa_pem(key.private_pem.as_bytes()).expect("test key should load");
    jsonwebtoken::encode(&header, claims, &encoding_key).expect("signing should succeed")
}

/// Sign claims with a shared-secret algorithm, claiming the given `kid`
pub fn sign_token_hs256(kid: &str, secret: &[u8], claims: &serde_json::Value) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(kid.to_string());
    jsonwebtoken::encode(&header, claims, &EncodingKey::from_secret(secret))
        .expect("signing should succeed")
}

/// Build an unsigned token with an arbitrary header
pub fn unsigned_token(header: &serde_json::Value, claims: &serde_json::Value) -> String {
    format!(
        "{}.{}.",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

/// Captured output of a thread-local tracing subscriber
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Capture every log line emitted on this thread until the guard drops
pub fn capture_logs() -> (LogCapture, tracing::subscriber::DefaultGuard) {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (capture, guard)
}
