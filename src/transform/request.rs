use crate::config::BrokerConfig;
use crate::endpoints;
use crate::error::BrokerError;
use crate::families::{HeaderStyle, ModelFamily};
use crate::models::{ResolvedModel, resolve};
use crate::repair;
use crate::sigcache::SignatureCacheService;
use crate::transform::thinking::{
    ANTHROPIC_BETA_HEADER, INTERLEAVED_BETA_TAG, apply_thinking_config,
};
use crate::transform::tools::{
    harden_claude_tools, normalize_claude_tools, normalize_gemini_tools,
};
use castor_schema::{CodeAssistEnvelope, RequestPayload};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub const TOOL_DEBUG_HEADER: &str = "x-antigravity-tool-debug-missing";

const STREAM_ACTION: &str = "streamGenerateContent";

/// `(model, action)` from a host URL of the form `…/models/{model}:{action}`
/// on the generative-language host. Anything else is not ours to touch.
pub fn parse_target(url: &str) -> Option<(String, String)> {
    let parsed = Url::parse(url).ok()?;
    if !parsed.host_str()?.contains("generativelanguage") {
        return None;
    }
    let path = parsed.path();
    let rest = &path[path.find("/models/")? + "/models/".len()..];
    let (model, action) = rest.split_once(':')?;
    if model.is_empty() || action.is_empty() {
        return None;
    }
    Some((model.to_string(), action.to_string()))
}

pub struct PrepareContext<'a> {
    pub url: &'a str,
    pub body: Value,
    pub access_token: &'a str,
    pub project: &'a str,
    pub endpoint: &'a str,
    pub header_style: HeaderStyle,
    pub incoming_headers: &'a [(String, String)],
    /// A prior send was rejected for thinking-block order; restart the turn
    /// unconditionally.
    pub force_thinking_recovery: bool,
    /// A warmup was already attempted for this request; do not flag another.
    pub warmup_attempted: bool,
}

pub struct PreparedRequest {
    pub url: Url,
    pub body: Value,
    pub headers: Vec<(String, String)>,
    pub resolved: ResolvedModel,
    pub family: ModelFamily,
    pub session_key: String,
    pub streaming: bool,
    /// The conversation resumes a tool loop with no signature anywhere to
    /// reattach; a warmup request can mint one before the real send.
    pub needs_signed_thinking_warmup: bool,
    pub tool_debug_missing: u32,
}

pub struct RequestTransformer {
    config: Arc<BrokerConfig>,
    cache: Arc<SignatureCacheService>,
}

impl RequestTransformer {
    pub fn new(config: Arc<BrokerConfig>, cache: Arc<SignatureCacheService>) -> Self {
        RequestTransformer { config, cache }
    }

    /// Rewrite one host call into the upstream wire shape.
    pub fn prepare(&self, ctx: PrepareContext<'_>) -> Result<PreparedRequest, BrokerError> {
        let (requested_model, action) = parse_target(ctx.url)
            .ok_or_else(|| BrokerError::UnhandledUrl(ctx.url.to_string()))?;

        let resolved = resolve(&requested_model);
        let family = ModelFamily::from_model(&resolved.actual_model);
        let streaming = action == STREAM_ACTION;

        let mut target = Url::parse(ctx.endpoint)?.join(&endpoints::internal_path(&action))?;
        if streaming {
            target.set_query(Some("alt=sse"));
        }

        let already_wrapped = CodeAssistEnvelope::is_wrapped(&ctx.body);
        let mut envelope: CodeAssistEnvelope = if already_wrapped {
            let mut envelope: CodeAssistEnvelope = serde_json::from_value(ctx.body)?;
            envelope.model = resolved.actual_model.clone();
            if envelope.request_id.is_empty() {
                envelope.request_id = format!("agent-{}", Uuid::new_v4());
            }
            envelope
        } else {
            let request: RequestPayload = serde_json::from_value(ctx.body)?;
            CodeAssistEnvelope {
                project: ctx.project.to_string(),
                model: resolved.actual_model.clone(),
                user_agent: CodeAssistEnvelope::USER_AGENT.to_string(),
                request_id: format!("agent-{}", Uuid::new_v4()),
                request,
                extra: Default::default(),
            }
        };

        let session_key =
            self.cache
                .session_key_for(&resolved.actual_model, ctx.project, &envelope.request);

        let mut tool_debug_missing = 0;
        let mut needs_beta_header = family == ModelFamily::Claude && resolved.is_thinking_model;
        let mut needs_warmup = false;

        // Bodies that went through this pipeline once only get their model
        // and session id refreshed; everything else is already in shape.
        if !already_wrapped {
            tool_debug_missing = match family {
                ModelFamily::Claude => normalize_claude_tools(&mut envelope.request),
                ModelFamily::Gemini => normalize_gemini_tools(&mut envelope.request),
            };
            if family == ModelFamily::Claude && self.config.claude_tool_hardening {
                harden_claude_tools(&mut envelope.request);
            }

            needs_beta_header = apply_thinking_config(&mut envelope.request, &resolved, family);

            lift_cached_content(&mut envelope.request);

            needs_warmup = self.repair_conversation(
                &mut envelope.request,
                &resolved,
                family,
                &session_key,
                ctx.force_thinking_recovery,
                ctx.warmup_attempted,
            );
        }

        envelope.request.extra.insert(
            "sessionId".to_string(),
            Value::String(session_key.clone()),
        );

        let headers = self.build_headers(
            ctx.access_token,
            ctx.header_style,
            ctx.incoming_headers,
            streaming,
            needs_beta_header,
            tool_debug_missing,
        );

        crate::util::with_pretty_json_debug(&envelope, |pretty| {
            debug!(
                model = %resolved.actual_model,
                family = family.as_str(),
                streaming,
                wrapped = already_wrapped,
                body = %pretty,
                "request prepared"
            );
        });

        Ok(PreparedRequest {
            url: target,
            body: serde_json::to_value(&envelope)?,
            headers,
            resolved,
            family,
            session_key,
            streaming,
            needs_signed_thinking_warmup: needs_warmup,
            tool_debug_missing,
        })
    }

    /// Signature discipline, tool-id pairing and restart analysis.
    /// Returns whether a signed-thinking warmup should run first.
    fn repair_conversation(
        &self,
        payload: &mut RequestPayload,
        resolved: &ResolvedModel,
        family: ModelFamily,
        session_key: &str,
        force_recovery: bool,
        warmup_attempted: bool,
    ) -> bool {
        if family != ModelFamily::Claude {
            return false;
        }

        if self.config.keep_thinking && resolved.is_thinking_model && self.cache.enabled() {
            repair::backfill_signatures(payload, &self.cache, session_key);
        }
        repair::strip_unsigned_thinking(payload);

        repair::pair_gemini_tool_ids(
            payload.contents.get_or_insert_with(Vec::new),
            self.config.tool_id_recovery,
        );
        if payload.contents.as_ref().is_some_and(Vec::is_empty) {
            payload.contents = None;
        }
        if let Some(messages) = payload.messages.as_mut() {
            repair::pair_claude_tool_ids(messages, self.config.tool_id_recovery);
        }

        if !resolved.is_thinking_model {
            return false;
        }

        if force_recovery {
            repair::apply_restart(payload, &self.config.resume_text);
            self.cache.clear_last_thinking(session_key);
            return false;
        }

        let analysis = repair::analyze_turn(payload);
        if !analysis.needs_thinking_recovery() {
            return false;
        }

        // A warmup can still mint a signature; only when that avenue is
        // exhausted does the destructive restart run.
        let warmup_possible =
            self.config.keep_thinking && self.cache.enabled() && !warmup_attempted;
        if warmup_possible && self.cache.last_thinking(session_key).is_none() {
            return true;
        }

        if self.cache.last_thinking(session_key).is_none() {
            repair::apply_restart(payload, &self.config.resume_text);
            self.cache.clear_last_thinking(session_key);
        }
        false
    }

    fn build_headers(
        &self,
        access_token: &str,
        style: HeaderStyle,
        incoming: &[(String, String)],
        streaming: bool,
        needs_beta_header: bool,
        tool_debug_missing: u32,
    ) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = vec![
            ("Authorization".to_string(), format!("Bearer {access_token}")),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        for (name, value) in style.header_tuple() {
            headers.push((name.to_string(), value.to_string()));
        }
        if streaming {
            headers.push(("Accept".to_string(), "text/event-stream".to_string()));
        }

        if needs_beta_header {
            let existing = incoming
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(ANTHROPIC_BETA_HEADER))
                .map(|(_, value)| value.as_str());
            let value = match existing {
                Some(value) if value.contains(INTERLEAVED_BETA_TAG) => value.to_string(),
                Some(value) => format!("{value},{INTERLEAVED_BETA_TAG}"),
                None => INTERLEAVED_BETA_TAG.to_string(),
            };
            headers.push((ANTHROPIC_BETA_HEADER.to_string(), value));
        }

        if tool_debug_missing > 0 {
            headers.push((TOOL_DEBUG_HEADER.to_string(), tool_debug_missing.to_string()));
        }
        headers
    }
}

/// Lift `cached_content`/`cachedContent` (top level or `extra_body`) up to
/// the wire field the upstream reads.
fn lift_cached_content(payload: &mut RequestPayload) {
    let from_top = payload
        .extra
        .remove("cached_content")
        .or_else(|| payload.extra.remove("cachedContent"));
    let from_extra_body = payload
        .extra
        .get_mut("extra_body")
        .and_then(Value::as_object_mut)
        .and_then(|eb| {
            eb.remove("cached_content")
                .or_else(|| eb.remove("cachedContent"))
        });

    if let Some(pointer) = from_top.or(from_extra_body) {
        payload.extra.insert("cachedContent".to_string(), pointer);
    }
}

/// Minimal tool-less, thinking-enabled body used to elicit a signature
/// before a send that needs one.
pub fn build_warmup_envelope(project: &str, model: &str, session_key: &str) -> Value {
    serde_json::json!({
        "project": project,
        "model": model,
        "userAgent": CodeAssistEnvelope::USER_AGENT,
        "requestId": format!("agent-{}", Uuid::new_v4()),
        "request": {
            "contents": [
                {"role": "user", "parts": [{"text": "Reply with the single word: ready"}]}
            ],
            "generationConfig": {
                "maxOutputTokens": 1024,
                "thinkingConfig": {"include_thoughts": true, "thinking_budget": 1024}
            },
            "sessionId": session_key
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignatureCacheConfig;
    use serde_json::json;

    fn transformer(dir: &std::path::Path, config: BrokerConfig) -> RequestTransformer {
        let cache = SignatureCacheService::new(
            SignatureCacheConfig::default(),
            dir.join("sig.json"),
            "plugin".to_string(),
        );
        RequestTransformer::new(Arc::new(config), Arc::new(cache))
    }

    fn ctx<'a>(url: &'a str, body: &'a Value) -> PrepareContext<'a> {
        PrepareContext {
            url,
            body: body.clone(),
            access_token: "at-1",
            project: "proj-1",
            endpoint: "https://daily-cloudcode-pa.sandbox.googleapis.com",
            header_style: HeaderStyle::Antigravity,
            incoming_headers: &[],
            force_thinking_recovery: false,
            warmup_attempted: false,
        }
    }

    const STREAM_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models/claude-sonnet-4-5-thinking-medium:streamGenerateContent";

    #[test]
    fn parse_target_requires_generative_host() {
        assert_eq!(
            parse_target(STREAM_URL),
            Some((
                "claude-sonnet-4-5-thinking-medium".to_string(),
                "streamGenerateContent".to_string()
            ))
        );
        assert_eq!(
            parse_target("https://example.com/v1beta/models/x:generateContent"),
            None
        );
        assert_eq!(
            parse_target("https://generativelanguage.googleapis.com/v1beta/models/"),
            None
        );
    }

    #[test]
    fn url_rewrite_and_wrap() {
        let dir = tempfile::tempdir().unwrap();
        let t = transformer(dir.path(), BrokerConfig::default());
        let body = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});

        let prepared = t.prepare(ctx(STREAM_URL, &body)).unwrap();

        assert_eq!(
            prepared.url.as_str(),
            "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal:streamGenerateContent?alt=sse"
        );
        assert!(prepared.streaming);
        assert_eq!(prepared.body["project"], json!("proj-1"));
        assert_eq!(prepared.body["model"], json!("claude-sonnet-4-5-thinking"));
        assert_eq!(prepared.body["userAgent"], json!("antigravity"));
        assert!(
            prepared.body["requestId"]
                .as_str()
                .unwrap()
                .starts_with("agent-")
        );
        assert_eq!(
            prepared.body["request"]["sessionId"],
            json!(prepared.session_key)
        );
    }

    #[test]
    fn scenario_claude_thinking_medium_full_shape() {
        let dir = tempfile::tempdir().unwrap();
        let t = transformer(dir.path(), BrokerConfig::default());
        let body = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});

        let prepared = t.prepare(ctx(STREAM_URL, &body)).unwrap();

        let thinking = &prepared.body["request"]["generationConfig"]["thinkingConfig"];
        assert_eq!(thinking["thinking_budget"], json!(16384));
        assert_eq!(thinking["include_thoughts"], json!(true));
        assert_eq!(
            prepared.body["request"]["generationConfig"]["maxOutputTokens"],
            json!(64_000)
        );

        let beta = prepared
            .headers
            .iter()
            .find(|(name, _)| name == ANTHROPIC_BETA_HEADER)
            .map(|(_, value)| value.as_str());
        assert_eq!(beta, Some(INTERLEAVED_BETA_TAG));
    }

    #[test]
    fn scenario_gemini_3_alias() {
        let dir = tempfile::tempdir().unwrap();
        let t = transformer(dir.path(), BrokerConfig::default());
        let url = "https://generativelanguage.googleapis.com/v1beta/models/gemini-3-pro-high:generateContent";
        let body = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});

        let prepared = t.prepare(ctx(url, &body)).unwrap();

        assert_eq!(prepared.body["model"], json!("gemini-3-pro"));
        assert_eq!(
            prepared.body["request"]["generationConfig"]["thinkingConfig"],
            json!({"includeThoughts": true, "thinkingLevel": "high"})
        );
        assert!(!prepared.streaming);
        assert!(prepared.url.as_str().ends_with("/v1internal:generateContent"));
    }

    #[test]
    fn preparing_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let t = transformer(dir.path(), BrokerConfig::default());
        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "tools": [{"name": "run", "input_schema": {"type": "object", "properties": {"cmd": {"type": "string"}}}}]
        });

        let first = t.prepare(ctx(STREAM_URL, &body)).unwrap();
        let second = t.prepare(ctx(STREAM_URL, &first.body)).unwrap();

        assert_eq!(first.body, second.body);
    }

    #[test]
    fn beta_header_appends_to_existing_value() {
        let dir = tempfile::tempdir().unwrap();
        let t = transformer(dir.path(), BrokerConfig::default());
        let body = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});
        let incoming = vec![(
            "anthropic-beta".to_string(),
            "context-1m-2025-08-07".to_string(),
        )];

        let mut context = ctx(STREAM_URL, &body);
        context.incoming_headers = &incoming;
        let prepared = t.prepare(context).unwrap();

        let beta = prepared
            .headers
            .iter()
            .find(|(name, _)| name == ANTHROPIC_BETA_HEADER)
            .map(|(_, value)| value.as_str());
        assert_eq!(
            beta,
            Some("context-1m-2025-08-07,interleaved-thinking-2025-05-14")
        );
    }

    #[test]
    fn cached_content_lifts_from_extra_body() {
        let dir = tempfile::tempdir().unwrap();
        let t = transformer(dir.path(), BrokerConfig::default());
        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "extra_body": {"cached_content": "cachedContents/abc"}
        });

        let prepared = t.prepare(ctx(STREAM_URL, &body)).unwrap();
        assert_eq!(
            prepared.body["request"]["cachedContent"],
            json!("cachedContents/abc")
        );
    }

    #[test]
    fn tool_loop_without_signatures_requests_warmup() {
        let dir = tempfile::tempdir().unwrap();
        let t = transformer(
            dir.path(),
            BrokerConfig {
                keep_thinking: true,
                ..BrokerConfig::default()
            },
        );
        let body = json!({
            "contents": [
                {"role": "user", "parts": [{"text": "do it"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "run", "args": {}, "id": "a"}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "run", "response": {}, "id": "a"}}]}
            ]
        });

        let prepared = t.prepare(ctx(STREAM_URL, &body)).unwrap();
        assert!(prepared.needs_signed_thinking_warmup);

        // Once the warmup has been attempted without producing a signature,
        // the destructive restart runs instead.
        let mut context = ctx(STREAM_URL, &body);
        context.warmup_attempted = true;
        let prepared = t.prepare(context).unwrap();
        assert!(!prepared.needs_signed_thinking_warmup);
        let contents = prepared.body["request"]["contents"].as_array().unwrap();
        let last = contents.last().unwrap();
        assert_eq!(last["role"], json!("user"));
        assert_eq!(last["parts"][0]["text"], json!("continue"));
    }

    #[test]
    fn forced_recovery_restarts_without_warmup() {
        let dir = tempfile::tempdir().unwrap();
        let t = transformer(
            dir.path(),
            BrokerConfig {
                keep_thinking: true,
                ..BrokerConfig::default()
            },
        );
        let body = json!({
            "contents": [
                {"role": "user", "parts": [{"text": "do it"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "run", "args": {}, "id": "a"}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "run", "response": {}, "id": "a"}}]}
            ]
        });

        let mut context = ctx(STREAM_URL, &body);
        context.force_thinking_recovery = true;
        let prepared = t.prepare(context).unwrap();

        assert!(!prepared.needs_signed_thinking_warmup);
        let contents = prepared.body["request"]["contents"].as_array().unwrap();
        assert_eq!(contents.last().unwrap()["parts"][0]["text"], json!("continue"));
    }
}
