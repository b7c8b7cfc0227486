//! Harbor API client
//!
//! Project lookup and robot account creation against the v2.0 API.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::MintError;
use crate::platform::{HttpClient, HttpResponse};

const API_PREFIX: &str = "/api/v2.0";

/// Longest registry error message carried into errors and logs
const MAX_ERROR_MESSAGE_LEN: usize = 200;

/// Robot account creation request body
#[derive(Debug, Clone, Serialize)]
pub struct CreateRobotRequest {
    pub name: String,
    pub description: String,
    /// Lifetime in whole days
    pub duration: u32,
    pub level: String,
    pub permissions: Vec<RobotPermission>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RobotPermission {
    pub kind: String,
    pub namespace: String,
    pub access: Vec<RobotAccess>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RobotAccess {
    pub resource: String,
    pub action: String,
}

/// Robot account as returned on creation
#[derive(Clone, Deserialize)]
pub struct RobotAccount {
    pub id: u64,
    pub name: String,
    pub secret: String,
}

impl std::fmt::Debug for RobotAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotAccount")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ProjectSummary {
    project_id: u64,
    name: String,
}

pub struct HarborClient {
    base_url: String,
    username: String,
    password: String,
    http: Arc<dyn HttpClient>,
}

impl HarborClient {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        http: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            http,
        }
    }

    fn basic_auth(&self) -> String {
        let credentials = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(credentials))
    }

    /// Resolve a project name to its numeric ID
    ///
    /// The registry's name query is a fuzzy search, so only an exact name
    /// match among the results counts.
    pub async fn find_project_id(&self, name: &str) -> Result<u64, MintError> {
        let query: String = url::form_urlencoded::byte_serialize(name.as_bytes()).collect();
        let url = format!("{}{}/projects?name={}", self.base_url, API_PREFIX, query);
        let auth = self.basic_auth();
        let headers = [
            ("Authorization", auth.as_str()),
            ("Accept", "application/json"),
            ("User-Agent", "harbor-broker"),
        ];

        let response = self.http.get(&url, &headers).await?;
        if response.status != 200 {
            return Err(self.registry_error(&response));
        }

        let projects: Vec<ProjectSummary> = response
            .json()
            .map_err(|e| MintError::InvalidResponse(format!("project list: {}", e)))?;

        projects
            .into_iter()
            .find(|p| p.name == name)
            .map(|p| p.project_id)
            .ok_or_else(|| MintError::NotFound(name.to_string()))
    }

    /// Create a project-level robot account
    pub async fn create_robot(
        &self,
        project_id: u64,
        request: &CreateRobotRequest,
    ) -> Result<RobotAccount, MintError> {
        let url = format!("{}{}/projects/{}/robots", self.base_url, API_PREFIX, project_id);
        let auth = self.basic_auth();
        let headers = [
            ("Authorization", auth.as_str()),
            ("Content-Type", "application/json"),
            ("Accept", "application/json"),
            ("User-Agent", "harbor-broker"),
        ];
        let body = serde_json::to_vec(request)
            .map_err(|e| MintError::InvalidResponse(format!("request encoding: {}", e)))?;

        let response = self.http.post(&url, &headers, &body).await?;
        if response.status != 201 {
            return Err(self.registry_error(&response));
        }

        response
            .json()
            .map_err(|e| MintError::InvalidResponse(format!("robot account: {}", e)))
    }

    fn registry_error(&self, response: &HttpResponse) -> MintError {
        MintError::Registry {
            status: response.status,
            message: redact_message(&response.body, &self.password),
        }
    }
}

/// Error text from a registry response body, safe to log
///
/// Prefers the registry's structured `errors[0].message`, falls back to the
/// raw body. The API password is scrubbed and the result truncated.
pub fn redact_message(body: &[u8], password: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        errors: Vec<ErrorEntry>,
    }

    #[derive(Deserialize)]
    struct ErrorEntry {
        message: String,
    }

    let raw = match serde_json::from_slice::<ErrorBody>(body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed.errors[0].message.clone(),
        _ => String::from_utf8_lossy(body).trim().to_string(),
    };

    let scrubbed = if password.is_empty() {
        raw
    } else {
        raw.replace(password, "<redacted>")
    };

    if scrubbed.chars().count() > MAX_ERROR_MESSAGE_LEN {
        let mut truncated: String = scrubbed.chars().take(MAX_ERROR_MESSAGE_LEN).collect();
        truncated.push_str("...");
        truncated
    } else {
        scrubbed
    }
}
