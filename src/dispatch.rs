//! Top-level dispatcher: account selection, refresh, project resolution,
//! request preparation, send, response transformation, retry policy.

use crate::accounts::{
    AccountManager, AccountSnapshot, CredentialStore, ProactiveRefreshQueue, TokenRefresher,
};
use crate::config::{BrokerConfig, config_dir};
use crate::error::{BrokerError, OauthError};
use crate::families::{HeaderStyle, ModelFamily};
use crate::host::{HostClient, ToastSink};
use crate::project::ProjectResolver;
use crate::recovery::RecoveryHook;
use crate::response::{
    BrokerResponse, ResponseDebugInfo, ResponseTransformer, rate_limit_ms,
};
use crate::sigcache::{SIGNATURE_CACHE_FILE_NAME, SignatureCacheService};
use crate::transform::{
    PrepareContext, PreparedRequest, RequestTransformer, parse_target,
};
use crate::util::now_ms;
use crate::{endpoints, transform};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

const WARMUP_TIMEOUT: Duration = Duration::from_secs(20);

/// One intercepted outbound call from the host.
pub struct HostRequest {
    pub url: String,
    pub body: Value,
    pub headers: Vec<(String, String)>,
}

pub struct Dispatcher {
    config: Arc<BrokerConfig>,
    http: reqwest::Client,
    manager: Arc<AccountManager>,
    refresher: Arc<TokenRefresher>,
    projects: Arc<ProjectResolver>,
    transformer: RequestTransformer,
    responses: ResponseTransformer,
    cache: Arc<SignatureCacheService>,
    endpoint: String,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<BrokerConfig>,
        http: reqwest::Client,
        manager: Arc<AccountManager>,
        refresher: Arc<TokenRefresher>,
        projects: Arc<ProjectResolver>,
        cache: Arc<SignatureCacheService>,
        endpoint: String,
    ) -> Self {
        Dispatcher {
            transformer: RequestTransformer::new(Arc::clone(&config), Arc::clone(&cache)),
            responses: ResponseTransformer::new(Arc::clone(&config), Arc::clone(&cache)),
            config,
            http,
            manager,
            refresher,
            projects,
            cache,
            endpoint,
        }
    }

    /// Whether this URL is ours to intercept.
    pub fn matches(url: &str) -> bool {
        parse_target(url).is_some()
    }

    /// Handle one host call end to end.
    pub async fn dispatch(&self, request: HostRequest) -> Result<BrokerResponse, BrokerError> {
        let (requested_model, _) = parse_target(&request.url)
            .ok_or_else(|| BrokerError::UnhandledUrl(request.url.clone()))?;
        let family = ModelFamily::from_model(
            &crate::models::resolve(&requested_model).actual_model,
        );

        let mut force_recovery = false;
        let mut warmup_attempted = false;
        let mut thinking_retry_used = false;

        let max_account_attempts = self.manager.len().max(1) + 1;
        for attempt in 0..max_account_attempts {
            let Some(snapshot) = self.manager.get_current_or_next(family).await else {
                let wait = self.manager.min_wait_ms(family).max(1000);
                let exhausted = BrokerError::NoAvailableAccount {
                    family,
                    retry_after_ms: wait,
                };
                info!("{exhausted}");
                return Ok(BrokerResponse::rate_limited(wait));
            };

            let snapshot = match self.ensure_access_token(snapshot).await? {
                Some(snapshot) => snapshot,
                // Credential permanently dead; pool shrank, try the next.
                None => continue,
            };
            let access = snapshot.account.access_token.clone().ok_or_else(|| {
                BrokerError::ConfigurationMissing {
                    message: "account has no access token after refresh".to_string(),
                }
            })?;

            let Some(mut style) = self
                .manager
                .available_header_style(snapshot.index, family)
            else {
                continue;
            };

            let project = self.projects.resolve(&snapshot, &access).await?;

            // Inner loop: warmups, header-style switches and the single
            // thinking-recovery retry re-prepare against the same account.
            'prepare: loop {
                let prepared = self.transformer.prepare(PrepareContext {
                    url: &request.url,
                    body: request.body.clone(),
                    access_token: &access,
                    project: &project,
                    endpoint: &self.endpoint,
                    header_style: style,
                    incoming_headers: &request.headers,
                    force_thinking_recovery: force_recovery,
                    warmup_attempted,
                })?;

                if prepared.needs_signed_thinking_warmup {
                    warmup_attempted = true;
                    self.run_warmup(&prepared, &project, &access, style).await;
                    continue 'prepare;
                }

                let info = ResponseDebugInfo {
                    model: prepared.resolved.actual_model.clone(),
                    project: project.clone(),
                    endpoint: self.endpoint.clone(),
                };

                let mut empty_attempts = 0u32;
                loop {
                    let response = self.send(&prepared).await?;
                    let status = response.status();
                    let content_type = response
                        .headers()
                        .get("content-type")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();

                    if status.is_success()
                        && prepared.streaming
                        && content_type.contains("text/event-stream")
                    {
                        return Ok(self.responses.transform_streaming(
                            response,
                            &prepared.session_key,
                            &info,
                        ));
                    }

                    let headers = response.headers().clone();
                    let body = response.bytes().await?;

                    if !status.is_success() {
                        let body_value: Value =
                            serde_json::from_slice(&body).unwrap_or(Value::Null);
                        if let Some(retry_ms) = rate_limit_ms(status, &headers, &body_value) {
                            let limited = BrokerError::RateLimited {
                                family,
                                style,
                                retry_after_ms: retry_ms,
                            };
                            debug!(index = snapshot.index, "{limited}");
                            self.manager
                                .mark_rate_limited(snapshot.index, retry_ms, family, style)
                                .await;

                            // Gemini can fall back to the CLI identity on
                            // the same account before rotating away.
                            if let Some(next_style) = self
                                .manager
                                .available_header_style(snapshot.index, family)
                            {
                                debug!(?next_style, "switching header style after 429");
                                style = next_style;
                                continue 'prepare;
                            }
                            debug!(attempt, "account exhausted, rotating");
                            break 'prepare;
                        }
                    }

                    match self.responses.transform_buffered(
                        status,
                        body,
                        &info,
                        !thinking_retry_used,
                    ) {
                        Ok(outcome) if outcome.empty => {
                            empty_attempts += 1;
                            if empty_attempts >= self.config.empty_response_max_attempts {
                                return Err(BrokerError::EmptyResponse {
                                    attempts: empty_attempts,
                                });
                            }
                            debug!(empty_attempts, "empty body, retrying");
                            sleep(Duration::from_millis(
                                self.config.empty_response_retry_delay_ms,
                            ))
                            .await;
                        }
                        Ok(outcome) => return Ok(outcome.response),
                        Err(BrokerError::ThinkingRecoveryNeeded { upstream_message }) => {
                            warn!(
                                "thinking-block order rejected; retrying with forced recovery: {}",
                                crate::util::preview(&upstream_message, 120)
                            );
                            thinking_retry_used = true;
                            force_recovery = true;
                            continue 'prepare;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        let wait = self.manager.min_wait_ms(family).max(1000);
        Ok(BrokerResponse::rate_limited(wait))
    }

    /// Refresh the account's token when expired. `None` means the account
    /// was removed (invalid grant) and the caller should pick another.
    async fn ensure_access_token(
        &self,
        mut snapshot: AccountSnapshot,
    ) -> Result<Option<AccountSnapshot>, BrokerError> {
        if !snapshot.account.is_access_token_expired(now_ms()) {
            return Ok(Some(snapshot));
        }

        match self.refresher.refresh(&snapshot.account.refresh_token).await {
            Ok(token) => {
                self.manager
                    .apply_refreshed_token(snapshot.index, &token)
                    .await;
                snapshot.account.access_token = Some(token.access_token);
                snapshot.account.expires = token.expires;
                Ok(Some(snapshot))
            }
            Err(OauthError::InvalidGrant) => {
                self.manager.remove_account(snapshot.index).await;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn send(&self, prepared: &PreparedRequest) -> Result<reqwest::Response, BrokerError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &prepared.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        Ok(self
            .http
            .post(prepared.url.clone())
            .headers(headers)
            .json(&prepared.body)
            .send()
            .await?)
    }

    /// Fire the minimal thinking-enabled request and harvest its signature
    /// into the cache. Best effort: a failed warmup falls through to the
    /// crash-and-restart path on the re-prepare.
    async fn run_warmup(
        &self,
        prepared: &PreparedRequest,
        project: &str,
        access_token: &str,
        style: HeaderStyle,
    ) {
        info!(model = %prepared.resolved.actual_model, "running signed-thinking warmup");

        let url = format!(
            "{}{}?alt=sse",
            self.endpoint,
            endpoints::internal_path("streamGenerateContent")
        );
        let body = transform::build_warmup_envelope(
            project,
            &prepared.resolved.actual_model,
            &prepared.session_key,
        );

        let mut request = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .timeout(WARMUP_TIMEOUT)
            .header("Accept", "text/event-stream");
        for (name, value) in style.header_tuple() {
            request = request.header(name, value);
        }

        let response = match request.json(&body).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                warn!(status = %response.status(), "warmup request rejected");
                return;
            }
            Err(e) => {
                warn!("warmup request failed: {e}");
                return;
            }
        };

        let mut thinking = String::new();
        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let Ok(event) = event else { break };
            let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
                continue;
            };
            let parts = value
                .pointer("/response/candidates/0/content/parts")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for part in parts {
                if part.get("thought").and_then(Value::as_bool) == Some(true)
                    && let Some(text) = part.get("text").and_then(Value::as_str)
                {
                    thinking.push_str(text);
                }
                if let Some(signature) = part
                    .get("thoughtSignature")
                    .or_else(|| part.get("signature"))
                    .and_then(Value::as_str)
                    && !thinking.is_empty()
                {
                    self.cache
                        .record(&prepared.session_key, &thinking, signature, None);
                    info!("warmup captured a thinking signature");
                    return;
                }
            }
        }
        warn!("warmup completed without a signature");
    }
}

/// Everything the host embeds: the dispatcher plus its background workers.
pub struct Broker {
    pub config: Arc<BrokerConfig>,
    pub manager: Arc<AccountManager>,
    pub cache: Arc<SignatureCacheService>,
    pub dispatcher: Arc<Dispatcher>,
    pub refresh_queue: Arc<ProactiveRefreshQueue>,
    pub recovery: Arc<RecoveryHook>,
}

impl Broker {
    /// Wire the full request path from configuration and the host's seams.
    pub async fn start(
        config: BrokerConfig,
        store: Arc<dyn CredentialStore>,
        toasts: Arc<dyn ToastSink>,
        host: Arc<dyn HostClient>,
    ) -> Result<Broker, BrokerError> {
        let config = Arc::new(config);
        crate::util::init_logging(config.debug, &config.log_dir());

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        let manager = Arc::new(
            AccountManager::load(store, Arc::clone(&toasts), config.quiet_mode).await?,
        );
        let refresher = Arc::new(TokenRefresher::new(http.clone()));

        let plugin_session = Uuid::new_v4().to_string();
        let cache = Arc::new(SignatureCacheService::new(
            config.signature_cache.clone(),
            config_dir().join(SIGNATURE_CACHE_FILE_NAME),
            plugin_session,
        ));
        cache.start_timers().await;

        let projects = Arc::new(ProjectResolver::new(http.clone(), Arc::clone(&manager)));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&config),
            http,
            Arc::clone(&manager),
            Arc::clone(&refresher),
            projects,
            Arc::clone(&cache),
            endpoints::generation_bases()[0].to_string(),
        ));

        let refresh_queue = Arc::new(ProactiveRefreshQueue::new(
            Arc::clone(&manager),
            refresher,
            config.buffer_seconds,
            config.check_interval_seconds,
        ));
        if config.proactive_token_refresh {
            refresh_queue.start().await;
        }

        let recovery = Arc::new(RecoveryHook::new(Arc::clone(&config), host, toasts));

        Ok(Broker {
            config,
            manager,
            cache,
            dispatcher,
            refresh_queue,
            recovery,
        })
    }

    /// Stop background work and flush the signature cache.
    pub async fn shutdown(&self) {
        self.refresh_queue.stop().await;
        self.cache.stop_timers().await;
        if let Err(e) = self.cache.flush().await {
            warn!("final signature cache flush failed: {e}");
        }
    }
}
