//! Credential minting
//!
//! Turns an authorized (scope, permission, lifetime) request into a
//! registry robot account.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::api::{CreateRobotRequest, HarborClient, RobotAccess, RobotPermission};
use super::MintError;
use crate::config::PROJECT_CACHE_TTL_SECS;
use crate::platform::{cache_get, cache_put, Cache, Clock};
use crate::policy::Permission;

const MINUTES_PER_DAY: u32 = 24 * 60;

const ROBOT_DESCRIPTION: &str = "Temporary CI robot account";

/// A minted registry credential
///
/// Returned to the caller once and never stored.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub account_id: u64,
    pub account_name: String,
    pub secret: String,
    /// Now plus the configured lifetime. The registry itself keeps the
    /// account for whole days, so this is advisory.
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("account_id", &self.account_id)
            .field("account_name", &self.account_name)
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Registry account lifetime, in whole days, for a lifetime in minutes
///
/// Any part of a day counts as a full day, with a one day floor: 5 and 1440
/// minutes are 1 day, 1441 and 1500 minutes are 2.
pub fn registry_duration_days(ttl_minutes: u32) -> u32 {
    ttl_minutes.div_ceil(MINUTES_PER_DAY).max(1)
}

/// Registry actions granted for a permission
///
/// The registry only distinguishes pull and push, so `write` and
/// `read-write` grant the same pair. Kept as is; `write` without pull would
/// break every push client.
pub fn native_actions(permission: Permission) -> &'static [&'static str] {
    match permission {
        Permission::Read => &["pull"],
        Permission::Write | Permission::ReadWrite => &["pull", "push"],
    }
}

pub struct CredentialMinter {
    client: HarborClient,
    cache: Arc<dyn Cache>,
    clock: Arc<dyn Clock>,
}

impl CredentialMinter {
    pub fn new(client: HarborClient, cache: Arc<dyn Cache>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            cache,
            clock,
        }
    }

    /// Create a robot account on `scope` with `permission` for `ttl_minutes`
    ///
    /// Every call creates a new account; nothing is deduplicated.
    pub async fn mint(
        &self,
        scope: &str,
        permission: Permission,
        ttl_minutes: u32,
        job_id: &str,
    ) -> Result<Credential, MintError> {
        let project_id = self.resolve_project_id(scope).await?;
        let now = self.clock.now_secs();

        let duration_days = registry_duration_days(ttl_minutes);
        let request = CreateRobotRequest {
            name: robot_name(job_id, now),
            description: ROBOT_DESCRIPTION.to_string(),
            duration: duration_days,
            level: "project".to_string(),
            permissions: vec![RobotPermission {
                kind: "project".to_string(),
                namespace: scope.to_string(),
                access: native_actions(permission)
                    .iter()
                    .map(|action| RobotAccess {
                        resource: "repository".to_string(),
                        action: action.to_string(),
                    })
                    .collect(),
            }],
        };

        let robot = self.client.create_robot(project_id, &request).await?;

        let expiry_secs = now + u64::from(ttl_minutes) * 60;
        let expires_at = i64::try_from(expiry_secs)
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .ok_or_else(|| MintError::InvalidResponse("expiry out of range".to_string()))?;

        tracing::info!(
            scope,
            project_id,
            account_id = robot.id,
            account_name = %robot.name,
            %permission,
            duration_days,
            "robot account created"
        );

        Ok(Credential {
            account_id: robot.id,
            account_name: robot.name,
            secret: robot.secret,
            expires_at,
        })
    }

    async fn resolve_project_id(&self, scope: &str) -> Result<u64, MintError> {
        let cache_key = format!("project:{}", scope);
        if let Some(id) = cache_get::<u64>(self.cache.as_ref(), &cache_key).await {
            tracing::debug!(scope, project_id = id, "project id cache hit");
            return Ok(id);
        }

        let id = self.client.find_project_id(scope).await?;
        cache_put(self.cache.as_ref(), &cache_key, &id, PROJECT_CACHE_TTL_SECS).await;
        Ok(id)
    }
}

/// Unique robot name for one mint: `ci-{job}-{unix}-{8 hex}`
fn robot_name(job_id: &str, now: u64) -> String {
    let job: String = job_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(32)
        .collect();
    let job = if job.is_empty() { "job".to_string() } else { job };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("ci-{}-{}-{}", job, now, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::HttpResponse;
    use crate::test_support::{MemoryCache, MockClock, MockHttp, TEST_NOW};

    const SEARCH: &str = "projects?name=";
    const ROBOTS: &str = "/projects/7/robots";

    fn harbor_mock() -> Arc<MockHttp> {
        Arc::new(MockHttp::new(vec![
            (
                SEARCH.to_string(),
                HttpResponse::new(200, r#"[{"project_id": 7, "name": "images-a"}]"#),
            ),
            (
                ROBOTS.to_string(),
                HttpResponse::new(
                    201,
                    r#"{"id": 42, "name": "robot$images-a+ci-2002", "secret": "s3cr3t-robot"}"#,
                ),
            ),
        ]))
    }

    fn minter(http: Arc<MockHttp>) -> CredentialMinter {
        let client = HarborClient::new("https://harbor.example.com", "admin", "hunter2", http);
        CredentialMinter::new(
            client,
            Arc::new(MemoryCache::new()),
            Arc::new(MockClock::new(TEST_NOW)),
        )
    }

    #[test]
    fn test_duration_rounds_up_to_whole_days() {
        assert_eq!(registry_duration_days(5), 1);
        assert_eq!(registry_duration_days(1439), 1);
        assert_eq!(registry_duration_days(1440), 1);
        assert_eq!(registry_duration_days(1441), 2);
        assert_eq!(registry_duration_days(1500), 2);
        assert_eq!(registry_duration_days(2880), 2);
        assert_eq!(registry_duration_days(2881), 3);
    }

    #[test]
    fn test_duration_has_one_day_floor() {
        assert_eq!(registry_duration_days(0), 1);
        assert_eq!(registry_duration_days(1), 1);
    }

    #[test]
    fn test_native_actions() {
        assert_eq!(native_actions(Permission::Read), &["pull"]);
        assert_eq!(native_actions(Permission::Write), &["pull", "push"]);
        // Same as write: the registry has no finer split
        assert_eq!(native_actions(Permission::ReadWrite), native_actions(Permission::Write));
    }

    #[tokio::test]
    async fn test_mint_builds_robot_request() {
        let http = harbor_mock();
        let credential = minter(http.clone())
            .mint("images-a", Permission::Write, 10, "2002")
            .await
            .expect("mint should succeed");

        assert_eq!(credential.account_id, 42);
        assert_eq!(credential.account_name, "robot$images-a+ci-2002");
        assert_eq!(credential.secret, "s3cr3t-robot");
        assert_eq!(credential.expires_at.timestamp(), (TEST_NOW + 600) as i64);

        let create = http
            .requests()
            .into_iter()
            .find(|r| r.url.contains(ROBOTS))
            .expect("robot creation request");
        assert_eq!(create.method, "POST");
        assert_eq!(create.header("Content-Type"), Some("application/json"));

        let body = create.json_body();
        assert!(body["name"].as_str().unwrap().starts_with(&format!("ci-2002-{}-", TEST_NOW)));
        assert_eq!(body["description"], "Temporary CI robot account");
        assert_eq!(body["duration"], 1);
        assert_eq!(body["level"], "project");
        assert_eq!(body["permissions"][0]["kind"], "project");
        assert_eq!(body["permissions"][0]["namespace"], "images-a");
        assert_eq!(
            body["permissions"][0]["access"],
            serde_json::json!([
                {"resource": "repository", "action": "pull"},
                {"resource": "repository", "action": "push"}
            ])
        );
    }

    #[tokio::test]
    async fn test_reported_expiry_ignores_day_rounding() {
        let http = harbor_mock();
        let credential = minter(http.clone())
            .mint("images-a", Permission::Read, 1500, "2002")
            .await
            .unwrap();

        assert_eq!(credential.expires_at.timestamp(), (TEST_NOW + 1500 * 60) as i64);
        let create = http.requests().into_iter().find(|r| r.url.contains(ROBOTS)).unwrap();
        assert_eq!(create.json_body()["duration"], 2);
    }

    #[tokio::test]
    async fn test_project_id_is_cached() {
        let http = harbor_mock();
        let minter = minter(http.clone());

        minter.mint("images-a", Permission::Read, 10, "1").await.unwrap();
        minter.mint("images-a", Permission::Read, 10, "2").await.unwrap();

        assert_eq!(http.count(SEARCH), 1);
        assert_eq!(http.count(ROBOTS), 2);
    }

    #[tokio::test]
    async fn test_repeated_mints_use_distinct_names() {
        let http = harbor_mock();
        let minter = minter(http.clone());

        minter.mint("images-a", Permission::Read, 10, "2002").await.unwrap();
        minter.mint("images-a", Permission::Read, 10, "2002").await.unwrap();

        let names: Vec<String> = http
            .requests()
            .into_iter()
            .filter(|r| r.url.contains(ROBOTS))
            .map(|r| r.json_body()["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);
    }

    #[tokio::test]
    async fn test_unknown_project_is_not_found() {
        let http = harbor_mock();
        http.set_response(SEARCH, HttpResponse::new(200, "[]"));

        let err = minter(http.clone())
            .mint("images-a", Permission::Read, 10, "2002")
            .await
            .unwrap_err();
        assert_eq!(err, MintError::NotFound("images-a".to_string()));
        assert_eq!(http.count(ROBOTS), 0);
    }

    #[tokio::test]
    async fn test_registry_failure_is_redacted() {
        let http = harbor_mock();
        http.set_response(
            ROBOTS,
            HttpResponse::new(
                500,
                r#"{"errors":[{"code":"INTERNAL","message":"db error for admin:hunter2"}]}"#,
            ),
        );

        let err = minter(http)
            .mint("images-a", Permission::Write, 10, "2002")
            .await
            .unwrap_err();
        match err {
            MintError::Registry { status, message } => {
                assert_eq!(status, 500);
                assert!(!message.contains("hunter2"));
            }
            other => panic!("expected registry error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbled_creation_response() {
        let http = harbor_mock();
        http.set_response(ROBOTS, HttpResponse::new(201, "{}"));

        let err = minter(http)
            .mint("images-a", Permission::Read, 10, "2002")
            .await
            .unwrap_err();
        assert!(matches!(err, MintError::InvalidResponse(_)));
    }

    #[test]
    fn test_robot_name_shape() {
        let name = robot_name("2002", 1700000000);
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts[0], "ci");
        assert_eq!(parts[1], "2002");
        assert_eq!(parts[2], "1700000000");
        assert_eq!(parts[3].len(), 8);
        assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));

        assert!(robot_name("", 1).starts_with("ci-job-1-"));
        assert!(robot_name("a b$c", 1).starts_with("ci-abc-1-"));
    }

    #[test]
    fn test_credential_debug_redacts_secret() {
        let credential = Credential {
            account_id: 1,
            account_name: "robot$x".to_string(),
            secret: "topsecret".to_string(),
            expires_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
        };
        let rendered = format!("{:?}", credential);
        assert!(!rendered.contains("topsecret"));
        assert!(rendered.contains("robot$x"));
    }
}
