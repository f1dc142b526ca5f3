use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A single conversation turn (or the system instruction, which carries no
/// role).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    /// `"user"` or `"model"`; absent on system instructions. Kept as a raw
    /// string so unknown roles pass through untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Ordered parts forming one message.
    #[serde(default)]
    pub parts: Vec<Part>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Content {
    /// Build a role-less single-text content, the shape used for system
    /// instructions and synthetic turns.
    pub fn from_text(text: impl Into<String>) -> Self {
        Content {
            role: None,
            parts: vec![Part::text(text)],
            ..Content::default()
        }
    }

    /// Build a single-text content carrying a role.
    pub fn with_role(role: &str, text: impl Into<String>) -> Self {
        Content {
            role: Some(role.to_string()),
            parts: vec![Part::text(text)],
            ..Content::default()
        }
    }

    /// First text part, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.parts.iter().find_map(|p| p.text.as_deref())
    }

    pub fn is_model_role(&self) -> bool {
        self.role.as_deref() == Some("model")
    }
}

/// One atomic piece of content inside a turn.
///
/// `text` is the common case; thought markers, function traffic and inline
/// media are modeled explicitly because the broker rewrites them, while
/// unrecognized fields survive in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// Model-thought marker. Thought parts must carry a signature when
    /// resubmitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,

    /// Opaque signature the upstream issued for this thought.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Function call emitted by the model: `{name, args, id?}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<Value>,

    /// Function result supplied by the host: `{name, response, id?}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Value>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part {
            text: Some(text.into()),
            ..Part::default()
        }
    }

    /// A signed thought part, used when backfilling stripped thinking.
    pub fn signed_thought(text: impl Into<String>, signature: impl Into<String>) -> Self {
        Part {
            thought: Some(true),
            thought_signature: Some(signature.into()),
            text: Some(text.into()),
            ..Part::default()
        }
    }

    pub fn is_thought(&self) -> bool {
        self.thought == Some(true)
    }

    /// Function name of a call or response part.
    pub fn function_name(&self) -> Option<&str> {
        self.function_call
            .as_ref()
            .or(self.function_response.as_ref())
            .and_then(|v| v.get("name"))
            .and_then(Value::as_str)
    }

    /// Tool-call id of a call or response part.
    pub fn function_id(&self) -> Option<&str> {
        self.function_call
            .as_ref()
            .or(self.function_response.as_ref())
            .and_then(|v| v.get("id"))
            .and_then(Value::as_str)
    }

    /// Write an id into the call/response object, whichever is present.
    pub fn set_function_id(&mut self, id: &str) {
        let target = self
            .function_call
            .as_mut()
            .or(self.function_response.as_mut());
        if let Some(Value::Object(obj)) = target {
            obj.insert("id".to_string(), Value::String(id.to_string()));
        }
    }
}
