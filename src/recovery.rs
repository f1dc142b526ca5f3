//! Session recovery: react to host-surfaced errors by repairing the stored
//! conversation and optionally resuming the turn.

use crate::config::BrokerConfig;
use crate::host::{HostClient, HostSessionError, ToastSink};
use regex::Regex;
use serde_json::{Value, json};
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

/// The three recoverable corruption classes, in the order they are probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    /// The host aborted mid-tool: `tool_use` without `tool_result`.
    ToolAbort,
    /// Thinking blocks in the wrong position for a thinking model.
    ThinkingOrder,
    /// Thinking blocks sent to a model with thinking disabled.
    ThinkingDisabled,
}

static THINKING_ORDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)first block|must start with|preceeding|expected.*found").expect("static regex")
});

/// Thinking-block ordering rejection, shared with the response transformer's
/// sentinel classification.
pub fn is_thinking_order_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("thinking") && THINKING_ORDER_RE.is_match(message)
}

pub fn classify_session_error(message: &str) -> Option<CorruptionKind> {
    let lower = message.to_lowercase();

    if lower.contains("tool_use") && lower.contains("tool_result") {
        return Some(CorruptionKind::ToolAbort);
    }
    if is_thinking_order_message(message) {
        return Some(CorruptionKind::ThinkingOrder);
    }
    if lower.contains("thinking is disabled") && lower.contains("cannot contain") {
        return Some(CorruptionKind::ThinkingDisabled);
    }
    None
}

pub struct RecoveryHook {
    config: Arc<BrokerConfig>,
    host: Arc<dyn HostClient>,
    toasts: Arc<dyn ToastSink>,
}

impl RecoveryHook {
    pub fn new(
        config: Arc<BrokerConfig>,
        host: Arc<dyn HostClient>,
        toasts: Arc<dyn ToastSink>,
    ) -> Self {
        RecoveryHook {
            config,
            host,
            toasts,
        }
    }

    /// Handle one host session error. Returns true when the error was
    /// recognized and a repair was applied.
    pub async fn on_session_error(&self, error: &HostSessionError) -> bool {
        if !self.config.session_recovery {
            return false;
        }
        let Some(kind) = classify_session_error(&error.message) else {
            return false;
        };
        info!(session = %error.session_id, ?kind, "recoverable session error detected");

        match self.recover(error, kind).await {
            Ok(()) => true,
            Err(reason) => {
                warn!(session = %error.session_id, "session recovery failed: {reason}");
                self.toasts.toast(&format!(
                    "Antigravity: automatic session recovery failed ({reason}); \
                     start a new session if the error persists"
                ));
                false
            }
        }
    }

    async fn recover(
        &self,
        error: &HostSessionError,
        kind: CorruptionKind,
    ) -> Result<(), String> {
        self.host.abort_session(&error.session_id).await?;

        let Some(message_id) = error.message_id.as_deref() else {
            return Err("failed message id unknown".to_string());
        };

        let mut parts = self
            .host
            .fetch_message_parts(&error.session_id, message_id)
            .await?;
        if parts.is_empty() {
            // Some hosts return nothing for aborted messages; their on-disk
            // store still has the parts.
            parts = self
                .host
                .read_message_parts_from_disk(&error.session_id, message_id)
                .await?;
        }

        let repaired = repair_parts(parts, kind);
        self.host
            .replace_message_parts(&error.session_id, message_id, repaired)
            .await?;

        if self.config.auto_resume {
            let (agent, model) = self
                .host
                .last_user_context(&error.session_id)
                .await
                .unwrap_or((None, None));
            self.host
                .resume(
                    &error.session_id,
                    &self.config.resume_text,
                    agent.as_deref(),
                    model.as_deref(),
                )
                .await?;
            info!(session = %error.session_id, "session resumed after repair");
        } else {
            self.toasts
                .toast("Antigravity: session repaired; send a message to continue");
        }
        Ok(())
    }
}

/// Apply the repair matching the corruption class to a message's parts.
fn repair_parts(mut parts: Vec<Value>, kind: CorruptionKind) -> Vec<Value> {
    match kind {
        CorruptionKind::ToolAbort => {
            let answered: Vec<String> = parts
                .iter()
                .filter_map(|p| {
                    (part_type(p) == "tool_result")
                        .then(|| p.get("tool_use_id").and_then(Value::as_str))
                        .flatten()
                        .map(ToString::to_string)
                })
                .collect();

            let orphans: Vec<String> = parts
                .iter()
                .filter(|p| part_type(p) == "tool_use" || part_type(p) == "tool")
                .filter_map(|p| p.get("id").and_then(Value::as_str))
                .filter(|id| !answered.iter().any(|a| a == id))
                .map(ToString::to_string)
                .collect();

            for id in orphans {
                parts.push(json!({
                    "type": "tool_result",
                    "tool_use_id": id,
                    "content": [{"type": "text", "text": crate::repair::PLACEHOLDER_RESULT}]
                }));
            }
            parts
        }

        CorruptionKind::ThinkingOrder => {
            // Move the first thinking part to the front; if there is none,
            // thinking is unrecoverable here and gets stripped instead.
            if let Some(pos) = parts.iter().position(|p| is_thinking_part(p)) {
                let thinking = parts.remove(pos);
                parts.insert(0, thinking);
                parts
            } else {
                parts
            }
        }

        CorruptionKind::ThinkingDisabled => parts
            .into_iter()
            .filter(|p| !is_thinking_part(p))
            .collect(),
    }
}

fn part_type(part: &Value) -> &str {
    part.get("type").and_then(Value::as_str).unwrap_or_default()
}

fn is_thinking_part(part: &Value) -> bool {
    matches!(part_type(part), "thinking" | "reasoning" | "redacted_thinking")
}
