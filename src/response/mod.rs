//! Response-side transformation: streaming rewrite, error annotation and
//! classification, usage metering.

mod sse;

pub use sse::SseTransform;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::recovery::is_thinking_order_message;
use crate::sigcache::SignatureCacheService;
use bytes::Bytes;
use castor_schema::ResponseBody;
use futures::{Stream, StreamExt, stream::BoxStream};
use reqwest::StatusCode;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::debug;

/// Default cooldown applied to a 429 that carries no retry information.
pub const DEFAULT_RATE_LIMIT_MS: i64 = 60_000;

/// What the broker hands back to the host.
pub struct BrokerResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: BrokerBody,
}

impl std::fmt::Debug for BrokerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

pub enum BrokerBody {
    Buffered(Bytes),
    Stream(BoxStream<'static, Result<Bytes, BrokerError>>),
}

impl std::fmt::Debug for BrokerBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerBody::Buffered(bytes) => f.debug_tuple("Buffered").field(bytes).finish(),
            BrokerBody::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

impl BrokerResponse {
    pub fn buffered(status: StatusCode, headers: Vec<(String, String)>, body: Bytes) -> Self {
        BrokerResponse {
            status,
            headers,
            body: BrokerBody::Buffered(body),
        }
    }

    /// Synthetic 429 used when every account is limited.
    pub fn rate_limited(retry_after_ms: i64) -> Self {
        let body = serde_json::json!({
            "error": {
                "code": 429,
                "status": "RESOURCE_EXHAUSTED",
                "message": "All accounts are rate-limited; retry later."
            }
        });
        BrokerResponse::buffered(
            StatusCode::TOO_MANY_REQUESTS,
            vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                (
                    "Retry-After".to_string(),
                    (retry_after_ms / 1000).max(1).to_string(),
                ),
                ("retry-after-ms".to_string(), retry_after_ms.to_string()),
            ],
            Bytes::from(body.to_string()),
        )
    }
}

/// Metadata stitched into error messages so host-side reports are
/// actionable.
#[derive(Debug, Clone)]
pub struct ResponseDebugInfo {
    pub model: String,
    pub project: String,
    pub endpoint: String,
}

impl ResponseDebugInfo {
    fn footer(&self, status: StatusCode) -> String {
        format!(
            "[antigravity: model={} project={} endpoint={} status={}]",
            self.model, self.project, self.endpoint, status
        )
    }
}

/// Outcome of the buffered path; `empty` asks the dispatcher to retry.
#[derive(Debug)]
pub struct BufferedOutcome {
    pub response: BrokerResponse,
    pub empty: bool,
}

pub struct ResponseTransformer {
    config: Arc<BrokerConfig>,
    cache: Arc<SignatureCacheService>,
}

impl ResponseTransformer {
    pub fn new(config: Arc<BrokerConfig>, cache: Arc<SignatureCacheService>) -> Self {
        ResponseTransformer { config, cache }
    }

    /// Wrap a successful SSE response in the line rewriter.
    pub fn transform_streaming(
        &self,
        upstream: reqwest::Response,
        session_key: &str,
        info: &ResponseDebugInfo,
    ) -> BrokerResponse {
        let status = upstream.status();
        let headers = passthrough_headers(&upstream);

        let debug_blob = self
            .config
            .debug
            .then(|| serde_json::json!({"model": info.model, "project": info.project}).to_string());
        let transform = SseTransform::new(
            Arc::clone(&self.cache),
            session_key.to_string(),
            debug_blob,
        );

        let stream = RewriteStream {
            inner: upstream.bytes_stream().boxed(),
            transform,
            done: false,
        };

        BrokerResponse {
            status,
            headers,
            body: BrokerBody::Stream(stream.boxed()),
        }
    }

    /// Buffered path: annotate errors, classify the thinking-order
    /// rejection, surface usage counts, flag empty successes.
    ///
    /// `allow_thinking_sentinel` is cleared by the dispatcher once its
    /// single recovery retry has been spent; after that the error goes to
    /// the host like any other.
    pub fn transform_buffered(
        &self,
        status: StatusCode,
        body: Bytes,
        info: &ResponseDebugInfo,
        allow_thinking_sentinel: bool,
    ) -> Result<BufferedOutcome, BrokerError> {
        if !status.is_success() {
            return self.transform_error(status, body, info, allow_thinking_sentinel);
        }

        let mut value: Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            // Unparseable success bodies go to the host untouched.
            Err(_) => {
                return Ok(BufferedOutcome {
                    response: BrokerResponse::buffered(status, json_headers(), body),
                    empty: false,
                });
            }
        };

        let taken = value.get_mut("response").map(Value::take);
        let mut unwrapped = match taken {
            Some(inner) => inner,
            None => value,
        };

        rewrite_preview_access_error(&mut unwrapped, &info.model);

        let mut headers = json_headers();
        let parsed: ResponseBody =
            serde_json::from_value(unwrapped.clone()).unwrap_or_default();
        if let Some(usage) = parsed.usage_metadata.as_ref() {
            let pairs = [
                ("x-antigravity-prompt-token-count", usage.prompt_token_count),
                (
                    "x-antigravity-candidates-token-count",
                    usage.candidates_token_count,
                ),
                ("x-antigravity-total-token-count", usage.total_token_count),
                (
                    "x-antigravity-cached-content-token-count",
                    usage.cached_content_token_count,
                ),
            ];
            for (name, count) in pairs {
                if let Some(count) = count {
                    headers.push((name.to_string(), count.to_string()));
                }
            }
        }

        let empty = parsed.is_empty_success();
        if empty {
            debug!("upstream returned an empty success body");
        }

        Ok(BufferedOutcome {
            response: BrokerResponse::buffered(
                status,
                headers,
                Bytes::from(unwrapped.to_string()),
            ),
            empty,
        })
    }

    fn transform_error(
        &self,
        status: StatusCode,
        body: Bytes,
        info: &ResponseDebugInfo,
        allow_thinking_sentinel: bool,
    ) -> Result<BufferedOutcome, BrokerError> {
        let mut value: Value =
            serde_json::from_slice(&body).unwrap_or_else(|_| {
                serde_json::json!({
                    "error": {"code": status.as_u16(), "message": String::from_utf8_lossy(&body)}
                })
            });

        let message = value
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if allow_thinking_sentinel && is_thinking_order_message(&message) {
            return Err(BrokerError::ThinkingRecoveryNeeded {
                upstream_message: message,
            });
        }

        // Append the debug footer so the host's error surface says which
        // model/project/endpoint actually failed.
        if let Some(slot) = value.pointer_mut("/error/message") {
            *slot = Value::String(format!("{message}\n{}", info.footer(status)));
        }

        let mut headers = json_headers();
        if let Some(retry_ms) = retry_delay_ms(&value) {
            headers.push(("Retry-After".to_string(), (retry_ms / 1000).max(1).to_string()));
            headers.push(("retry-after-ms".to_string(), retry_ms.to_string()));
        }

        Ok(BufferedOutcome {
            response: BrokerResponse::buffered(status, headers, Bytes::from(value.to_string())),
            empty: false,
        })
    }
}

/// Cooldown for a limited response, from headers or the error body.
/// `None` when the response is not a rate-limit signal at all.
pub fn rate_limit_ms(status: StatusCode, headers: &reqwest::header::HeaderMap, body: &Value) -> Option<i64> {
    let from_header = headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .map(|secs| secs * 1000);
    let from_body = retry_delay_ms(body);

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(from_header.or(from_body).unwrap_or(DEFAULT_RATE_LIMIT_MS));
    }
    if status.is_server_error() {
        return from_body;
    }
    None
}

/// `RetryInfo.retryDelay` ("30s") from a structured Google error, or a
/// top-level `retryDelay`.
fn retry_delay_ms(body: &Value) -> Option<i64> {
    let details = body.pointer("/error/details").and_then(Value::as_array);
    let retry_info = details.and_then(|details| {
        details.iter().find(|d| {
            d.get("@type")
                .and_then(Value::as_str)
                .is_some_and(|t| t.ends_with("RetryInfo"))
        })
    });

    let delay = retry_info
        .and_then(|info| info.get("retryDelay"))
        .or_else(|| body.pointer("/error/retryDelay"))
        .and_then(Value::as_str)?;

    let seconds: f64 = delay.trim_end_matches('s').parse().ok()?;
    Some((seconds * 1000.0) as i64)
}

/// 404 on a gated model reads like a missing resource; say what it means.
fn rewrite_preview_access_error(body: &mut Value, model: &str) {
    let code = body.pointer("/error/code").and_then(Value::as_i64);
    let message = body
        .pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();

    if code == Some(404) && (message.contains("preview") || message.contains("not found")) {
        if let Some(slot) = body.pointer_mut("/error/message") {
            *slot = Value::String(format!(
                "Model {model} requires preview access on this account. Request access for the \
                 account or switch to a generally-available model."
            ));
        }
    }
}

fn json_headers() -> Vec<(String, String)> {
    vec![("Content-Type".to_string(), "application/json".to_string())]
}

fn passthrough_headers(upstream: &reqwest::Response) -> Vec<(String, String)> {
    upstream
        .headers()
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            name == "content-type" || name.starts_with("x-") || name == "retry-after"
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

/// Byte stream applying [`SseTransform`] chunk by chunk.
struct RewriteStream {
    inner: BoxStream<'static, Result<Bytes, reqwest::Error>>,
    transform: SseTransform,
    done: bool,
}

impl Stream for RewriteStream {
    type Item = Result<Bytes, BrokerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }
            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let out = self.transform.push_chunk(&chunk);
                    if out.is_empty() {
                        continue;
                    }
                    return Poll::Ready(Some(Ok(Bytes::from(out))));
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(BrokerError::Reqwest(e))));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    let tail = self.transform.finish();
                    if tail.is_empty() {
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(Ok(Bytes::from(tail))));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
