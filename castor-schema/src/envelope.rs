//! Project-scoped envelope for the code-assist upstream.
//!
//! The upstream accepts only wrapped payloads: the caller's generate-content
//! body rides in `request`, next to the cloud project, the resolved model and
//! a per-call request id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeAssistEnvelope {
    pub project: String,

    #[serde(default)]
    pub model: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default)]
    pub request_id: String,

    pub request: crate::RequestPayload,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_user_agent() -> String {
    CodeAssistEnvelope::USER_AGENT.to_string()
}

impl CodeAssistEnvelope {
    pub const USER_AGENT: &str = "antigravity";

    /// True when a raw body is already envelope-shaped: an object carrying a
    /// string `project` and a `request`. Such bodies are updated in place
    /// rather than wrapped again.
    pub fn is_wrapped(body: &Value) -> bool {
        body.get("project").is_some_and(Value::is_string) && body.get("request").is_some()
    }
}
