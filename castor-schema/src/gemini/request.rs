use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::claude::Message;
use crate::gemini::Content;

/// Inner generate-content payload, before or after project-wrapping.
///
/// Hosts send either a Gemini-wire body (`contents`) or an Anthropic
/// messages-format body (`messages`); both containers are modeled so the
/// repair passes can walk whichever is present. Everything the broker does
/// not rewrite stays in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    /// Gemini-wire conversation turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<Vec<Content>>,

    /// Anthropic messages-format conversation turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,

    /// System instruction. Accepted in snake_case from the host and always
    /// re-emitted camelCase. Left as raw JSON: hosts send either a bare
    /// string or a Content-shaped object.
    #[serde(
        skip_serializing_if = "Option::is_none",
        alias = "system_instruction"
    )]
    pub system_instruction: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,

    /// Tool declarations; shape differs per family, rewritten wholesale by
    /// the tool normalizer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RequestPayload {
    /// Plain text of the system instruction, whatever shape it arrived in.
    pub fn system_text(&self) -> Option<String> {
        match self.system_instruction.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Object(_) => {
                let content: Content =
                    serde_json::from_value(self.system_instruction.clone()?).ok()?;
                content.first_text().map(str::to_string)
            }
            _ => None,
        }
    }

    /// Append a paragraph to the system instruction, creating it if absent.
    /// No-op when the exact paragraph is already present, so re-preparing a
    /// prepared body never duplicates hints.
    pub fn append_system_text(&mut self, paragraph: &str) {
        let existing = self.system_text().unwrap_or_default();
        if existing.contains(paragraph) {
            return;
        }
        let next = if existing.is_empty() {
            paragraph.to_string()
        } else {
            format!("{existing}\n\n{paragraph}")
        };
        self.system_instruction =
            Some(serde_json::to_value(Content::from_text(next)).unwrap_or(Value::Null));
    }

    /// First user-authored text in the conversation, used for conversation
    /// keying.
    pub fn first_user_text(&self) -> Option<String> {
        if let Some(contents) = &self.contents {
            return contents
                .iter()
                .find(|c| c.role.as_deref() == Some("user"))
                .and_then(Content::first_text)
                .map(str::to_string);
        }
        self.messages.as_ref()?.iter().find_map(|m| {
            if m.role == "user" {
                m.first_text().map(str::to_string)
            } else {
                None
            }
        })
    }
}

/// Generation parameters. Only the fields the broker rewrites are typed;
/// temperature and friends ride along in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,

    /// Thinking configuration; key casing differs between families so the
    /// shaper treats it as raw JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<Value>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}
