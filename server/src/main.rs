//! harbor-broker: registry credential broker for CI pipelines
//!
//! Lightweight HTTP server using hyper. Every connection is served on its own
//! task of a multi-threaded tokio runtime.

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;

use harbor_broker_core::audit::TracingAuditSink;
use harbor_broker_core::config::BrokerConfig;
use harbor_broker_core::error::{ApiError, ConfigError, ErrorResponse};
use harbor_broker_core::policy::{self, PolicyBackend, PolicyFileError};
use harbor_broker_core::sts::{Broker, ExchangeRequest};

mod platform;

use platform::{MokaCache, ProcessEnv, ReqwestHttpClient, SystemClock};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Error, Debug)]
enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to read policy file '{path}': {source}")]
    PolicyRead {
        path: String,
        source: std::io::Error,
    },

    #[error("policy file error: {0}")]
    Policy(#[from] PolicyFileError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("invalid PORT '{0}'")]
    Port(String),

    #[error("failed to bind: {0}")]
    Bind(std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "harbor-broker failed to start");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let level = std::env::var("BROKER_LOG_LEVEL")
        .ok()
        .and_then(|raw| raw.parse::<tracing::Level>().ok())
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .init();
}

async fn run() -> Result<(), StartupError> {
    let config = BrokerConfig::from_env(&ProcessEnv)?;
    tracing::debug!(?config, "configuration loaded");

    let rules = load_rules(&config)?;
    let policy_source = policy::build_source(config.policy_backend, rules)?;

    let broker = Arc::new(Broker::from_config(
        &config,
        policy_source,
        Arc::new(TracingAuditSink),
        Arc::new(ReqwestHttpClient::new()?),
        Arc::new(MokaCache::new()),
        Arc::new(SystemClock),
    ));

    let raw_port = std::env::var("PORT").unwrap_or_else(|_| "8080".into());
    let port: u16 = raw_port.parse().map_err(|_| StartupError::Port(raw_port.clone()))?;

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(StartupError::Bind)?;

    tracing::info!(
        port,
        harbor_url = %config.harbor_url,
        policy_backend = ?config.policy_backend,
        ttl_minutes = config.robot_ttl_minutes,
        "harbor-broker listening"
    );

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received, no longer accepting connections");
                return Ok(());
            }
        };

        let broker = broker.clone();
        tokio::spawn(async move {
            let io = hyper_util::rt::TokioIo::new(stream);
            let service = service_fn(move |req| {
                let broker = broker.clone();
                async move { handle_request(req, &broker).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(%peer, error = %e, "connection error");
            }
        });
    }
}

/// Read policy rules for the configured backend
///
/// A store may start without a file; the static backend cannot.
fn load_rules(config: &BrokerConfig) -> Result<Vec<policy::PolicyRule>, StartupError> {
    let yaml = match std::fs::read_to_string(&config.policy_file) {
        Ok(yaml) => yaml,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && config.policy_backend == PolicyBackend::Store => {
            tracing::info!(path = %config.policy_file, "no policy file, starting with an empty store");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(StartupError::PolicyRead {
                path: config.policy_file.clone(),
                source,
            })
        }
    };

    let rules = policy::load_policy_file(&yaml)?;
    tracing::info!(path = %config.policy_file, rules = rules.len(), "policy file loaded");
    Ok(rules)
}

type HyperResponse = Response<Full<Bytes>>;

async fn handle_request(
    req: Request<Incoming>,
    broker: &Broker,
) -> Result<HyperResponse, std::convert::Infallible> {
    let result = route_request(req, broker).await;
    Ok(result)
}

async fn route_request(req: Request<Incoming>, broker: &Broker) -> HyperResponse {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (Method::GET, "/health") => handle_health(),
        (Method::POST, "/token") => handle_token(req, broker).await,
        _ => json_response(StatusCode::NOT_FOUND, &serde_json::json!({"error": "not_found"})),
    }
}

fn handle_health() -> HyperResponse {
    json_response(StatusCode::OK, &serde_json::json!({"status": "ok"}))
}

/// Token request body
#[derive(Debug, Default, Deserialize)]
struct TokenRequestBody {
    #[serde(default, alias = "harbor_project")]
    scope: Option<String>,

    #[serde(default, alias = "permissions")]
    permission: Option<String>,
}

async fn handle_token(req: Request<Incoming>, broker: &Broker) -> HyperResponse {
    let bearer_token = match extract_bearer_token(req.headers()) {
        Ok(t) => t,
        Err(e) => return error_response(&e),
    };

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return error_response(&ApiError::invalid_request("failed to read body")),
    };

    let params = match parse_token_body(&body) {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };

    let request = ExchangeRequest {
        bearer_token,
        scope: params.scope,
        permission: params.permission,
    };

    match broker.exchange(request).await {
        Ok(response) => json_response(StatusCode::OK, &response),
        Err(e) => error_response(&e),
    }
}

fn parse_token_body(body: &[u8]) -> Result<TokenRequestBody, ApiError> {
    serde_json::from_slice(body).map_err(|_| ApiError::invalid_request("invalid JSON body"))
}

/// Missing or malformed credentials are an authentication failure
fn extract_bearer_token(headers: &hyper::HeaderMap) -> Result<String, ApiError> {
    let header = headers
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(ApiError::unauthenticated)?;

    let (scheme, token) = header.split_once(' ').ok_or_else(ApiError::unauthenticated)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(ApiError::unauthenticated());
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(ApiError::unauthenticated());
    }

    Ok(token.to_string())
}

fn error_response(err: &ApiError) -> HyperResponse {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorResponse::from(err);
    json_response(status, &body)
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> HyperResponse {
    let json = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}
