//! Managed-project discovery and onboarding.
//!
//! Every upstream request must carry a cloud project id. Most accounts get
//! one provisioned server-side; this resolver finds it once per credential
//! and persists it on the account record.

use crate::accounts::{AccountManager, AccountSnapshot};
use crate::endpoints;
use crate::error::{BrokerError, IsRetryable};
use backon::{ExponentialBuilder, Retryable};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Last-resort project when discovery finds nothing and the user supplied
/// none. Requests against it may be feature-limited but are accepted.
const FALLBACK_PROJECT: &str = "antigravity-default";

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const ONBOARD_MAX_ATTEMPTS: usize = 5;
const ONBOARD_RETRY_DELAY: Duration = Duration::from_secs(2);

type SharedResolve = Shared<BoxFuture<'static, Result<String, String>>>;

pub struct ProjectResolver {
    http: reqwest::Client,
    manager: Arc<AccountManager>,
    /// Resolved project per refresh token; avoids re-discovery per request.
    cache: moka::sync::Cache<String, String>,
    /// In-flight resolutions keyed by refresh token, so concurrent requests
    /// on one credential share a single discovery call.
    pending: Mutex<HashMap<String, SharedResolve>>,
    bases: Vec<String>,
}

impl ProjectResolver {
    pub fn new(http: reqwest::Client, manager: Arc<AccountManager>) -> Self {
        Self::with_bases(
            http,
            manager,
            endpoints::discovery_bases()
                .iter()
                .map(ToString::to_string)
                .collect(),
        )
    }

    /// Test seam: point discovery at local capture servers.
    pub fn with_bases(
        http: reqwest::Client,
        manager: Arc<AccountManager>,
        bases: Vec<String>,
    ) -> Self {
        ProjectResolver {
            http,
            manager,
            cache: moka::sync::Cache::builder()
                .time_to_live(Duration::from_secs(24 * 3600))
                .max_capacity(1024)
                .build(),
            pending: Mutex::new(HashMap::new()),
            bases,
        }
    }

    /// Effective project id for a credential.
    ///
    /// Order: managed id already on the record, discovered id (cached or
    /// fresh), user-supplied override, hard-coded fallback.
    pub async fn resolve(
        &self,
        snapshot: &AccountSnapshot,
        access_token: &str,
    ) -> Result<String, BrokerError> {
        if let Some(managed) = snapshot
            .account
            .managed_project_id
            .as_deref()
            .filter(|p| !p.trim().is_empty())
        {
            return Ok(managed.to_string());
        }

        let refresh_token = snapshot.account.refresh_token.clone();
        if let Some(cached) = self.cache.get(&refresh_token) {
            return Ok(cached);
        }

        if let Some(discovered) = self.discover_deduped(snapshot, access_token).await {
            return Ok(discovered);
        }

        if let Some(user) = snapshot
            .account
            .project_id
            .as_deref()
            .filter(|p| !p.trim().is_empty())
        {
            return Ok(user.to_string());
        }

        Ok(FALLBACK_PROJECT.to_string())
    }

    /// Run discovery, sharing one in-flight future per refresh token.
    async fn discover_deduped(
        &self,
        snapshot: &AccountSnapshot,
        access_token: &str,
    ) -> Option<String> {
        let refresh_token = snapshot.account.refresh_token.clone();

        let (shared, owner) = {
            let mut pending = self.pending.lock().await;
            if let Some(existing) = pending.get(&refresh_token) {
                (existing.clone(), false)
            } else {
                let http = self.http.clone();
                let bases = self.bases.clone();
                let token = access_token.to_string();
                let duet_project = snapshot.account.project_id.clone();
                let fut: BoxFuture<'static, Result<String, String>> = async move {
                    discover_project(&http, &bases, &token, duet_project.as_deref())
                        .await
                        .map_err(|e| e.to_string())?
                        .ok_or_else(|| "no managed project advertised".to_string())
                }
                .boxed();
                let shared = fut.shared();
                pending.insert(refresh_token.clone(), shared.clone());
                (shared, true)
            }
        };

        let result = shared.await;

        if owner {
            self.pending.lock().await.remove(&refresh_token);
        }

        match result {
            Ok(project) => {
                self.cache.insert(refresh_token.clone(), project.clone());
                self.manager
                    .set_managed_project(&refresh_token, &project)
                    .await;
                info!(project = %project, "managed project discovered");
                Some(project)
            }
            Err(e) => {
                debug!("project discovery yielded nothing: {e}");
                None
            }
        }
    }

    /// Onboard a fresh credential onto a tier, polling the long-running
    /// operation until done. Called from the out-of-band setup flow only.
    pub async fn onboard(
        &self,
        access_token: &str,
        tier_id: &str,
        project_id: &str,
    ) -> Result<String, BrokerError> {
        let base = self
            .bases
            .first()
            .cloned()
            .unwrap_or_else(|| endpoints::PROD_BASE.to_string());
        let url = format!("{base}{}", endpoints::internal_path("onboardUser"));

        for attempt in 1..=ONBOARD_MAX_ATTEMPTS {
            let resp = self
                .http
                .post(&url)
                .bearer_auth(access_token)
                .timeout(DISCOVERY_TIMEOUT)
                .json(&json!({
                    "tierId": tier_id,
                    "cloudaicompanionProject": project_id,
                    "metadata": discovery_metadata(Some(project_id)),
                }))
                .send()
                .await?;

            if !resp.status().is_success() {
                return Err(BrokerError::ProjectUnavailable {
                    message: format!("onboardUser returned {}", resp.status()),
                });
            }

            let op: OnboardOperation = resp.json().await?;
            if op.done {
                return op
                    .response
                    .and_then(|r| r.cloudaicompanion_project)
                    .and_then(ProjectIdOrObject::into_id)
                    .ok_or_else(|| BrokerError::ProjectUnavailable {
                        message: "onboarding finished without a project id".to_string(),
                    });
            }

            if attempt < ONBOARD_MAX_ATTEMPTS {
                info!(
                    attempt,
                    max = ONBOARD_MAX_ATTEMPTS,
                    "onboarding pending, polling again"
                );
                tokio::time::sleep(ONBOARD_RETRY_DELAY).await;
            }
        }

        Err(BrokerError::ProjectUnavailable {
            message: "project provisioning timed out".to_string(),
        })
    }
}

fn discovery_metadata(duet_project: Option<&str>) -> Value {
    let mut metadata = json!({
        "ideType": "IDE_UNSPECIFIED",
        "platform": "PLATFORM_UNSPECIFIED",
        "pluginType": "GEMINI",
    });
    if let (Some(obj), Some(project)) = (metadata.as_object_mut(), duet_project) {
        obj.insert("duetProject".to_string(), Value::String(project.to_string()));
    }
    metadata
}

/// Try each base in order; first advertised project wins.
async fn discover_project(
    http: &reqwest::Client,
    bases: &[String],
    access_token: &str,
    duet_project: Option<&str>,
) -> Result<Option<String>, BrokerError> {
    for base in bases {
        let url = format!("{base}{}", endpoints::internal_path("loadCodeAssist"));
        let call = || async {
            let resp = http
                .post(&url)
                .bearer_auth(access_token)
                .timeout(DISCOVERY_TIMEOUT)
                .json(&json!({
                    "metadata": discovery_metadata(duet_project),
                }))
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(BrokerError::UpstreamStatus {
                    status: resp.status(),
                    body: resp.text().await.unwrap_or_default(),
                });
            }
            Ok(resp.json::<Value>().await?)
        };

        let result = call
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(100))
                    .with_max_delay(Duration::from_millis(300))
                    .with_max_times(2)
                    .with_jitter(),
            )
            .when(|e: &BrokerError| e.is_retryable())
            .await;

        match result {
            Ok(body) => {
                if let Some(project) = extract_project(&body) {
                    return Ok(Some(project));
                }
            }
            Err(e) => {
                warn!(base = %base, "loadCodeAssist failed: {e}");
            }
        }
    }

    Ok(None)
}

fn extract_project(body: &Value) -> Option<String> {
    let value = body.get("cloudaicompanionProject")?;
    serde_json::from_value::<ProjectIdOrObject>(value.clone())
        .ok()
        .and_then(ProjectIdOrObject::into_id)
}

/// Default tier advertised by loadCodeAssist, for onboarding.
pub fn default_tier(load_response: &Value) -> String {
    load_response
        .get("allowedTiers")
        .and_then(Value::as_array)
        .and_then(|tiers| {
            tiers
                .iter()
                .find(|t| t.get("isDefault").and_then(Value::as_bool) == Some(true))
        })
        .and_then(|t| t.get("id"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .unwrap_or_else(|| "LEGACY".to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnboardOperation {
    #[serde(default)]
    done: bool,
    #[serde(default)]
    response: Option<OnboardResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnboardResponse {
    cloudaicompanion_project: Option<ProjectIdOrObject>,
}

/// The project field arrives either as a bare id or as `{id}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProjectIdOrObject {
    Plain(String),
    Object { id: String },
}

impl ProjectIdOrObject {
    fn into_id(self) -> Option<String> {
        match self {
            ProjectIdOrObject::Plain(s) if !s.trim().is_empty() => Some(s),
            ProjectIdOrObject::Object { id } if !id.trim().is_empty() => Some(id),
            _ => None,
        }
    }
}
