//! Seams toward the embedding host.
//!
//! The broker never renders UI or talks to the host's session store
//! directly; it calls through these traits and the host wires them up.

use async_trait::async_trait;
use serde_json::Value;

/// Minimal toast surface. The default sink drops everything, which is also
/// the behavior behind `quiet_mode` for non-recovery messages.
pub trait ToastSink: Send + Sync {
    fn toast(&self, message: &str);
}

/// No-op sink.
pub struct SilentToasts;

impl ToastSink for SilentToasts {
    fn toast(&self, _message: &str) {}
}

/// Forward toasts to tracing; useful default for headless hosts.
pub struct LogToasts;

impl ToastSink for LogToasts {
    fn toast(&self, message: &str) {
        tracing::info!(toast = %message, "broker toast");
    }
}

/// A session-level error event surfaced by the host.
#[derive(Debug, Clone)]
pub struct HostSessionError {
    pub session_id: String,
    pub message: String,
    /// Id of the message the host failed on, when known.
    pub message_id: Option<String>,
}

/// Host-side session operations the recovery hook needs.
#[async_trait]
pub trait HostClient: Send + Sync {
    /// Abort the in-flight session turn.
    async fn abort_session(&self, session_id: &str) -> Result<(), String>;

    /// Content parts of a message. An empty result makes the hook fall back
    /// to `read_message_parts_from_disk`.
    async fn fetch_message_parts(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Vec<Value>, String>;

    /// Fallback read from the host's on-disk message-part store.
    async fn read_message_parts_from_disk(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Vec<Value>, String>;

    /// Replace a message's parts with repaired ones.
    async fn replace_message_parts(
        &self,
        session_id: &str,
        message_id: &str,
        parts: Vec<Value>,
    ) -> Result<(), String>;

    /// Send a continuation prompt, preserving the given agent and model.
    async fn resume(
        &self,
        session_id: &str,
        prompt: &str,
        agent: Option<&str>,
        model: Option<&str>,
    ) -> Result<(), String>;

    /// Agent/model of the last user message, for resume fidelity.
    async fn last_user_context(
        &self,
        session_id: &str,
    ) -> Result<(Option<String>, Option<String>), String>;
}
