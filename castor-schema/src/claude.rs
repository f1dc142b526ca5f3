//! Anthropic messages-format shapes.
//!
//! Some hosts speak the Claude messages wire (`messages[]` with typed content
//! blocks) rather than Gemini contents. The broker repairs tool/thinking
//! discipline in this format too, so the block structure is modeled with the
//! same pass-through rules as the Gemini side.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,

    pub content: MessageContent,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Message {
    pub fn from_blocks(role: &str, blocks: Vec<MessageBlock>) -> Self {
        Message {
            role: role.to_string(),
            content: MessageContent::Blocks(blocks),
            extra: BTreeMap::new(),
        }
    }

    pub fn from_text(role: &str, text: impl Into<String>) -> Self {
        Message {
            role: role.to_string(),
            content: MessageContent::Text(text.into()),
            extra: BTreeMap::new(),
        }
    }

    pub fn first_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Blocks(blocks) => blocks.iter().find_map(|b| b.text.as_deref()),
        }
    }

    /// Blocks view, promoting a bare string to a single text block on write
    /// access paths that need block structure.
    pub fn blocks(&self) -> &[MessageBlock] {
        match &self.content {
            MessageContent::Blocks(blocks) => blocks,
            MessageContent::Text(_) => &[],
        }
    }

    pub fn blocks_mut(&mut self) -> &mut Vec<MessageBlock> {
        if let MessageContent::Text(t) = &self.content {
            let promoted = vec![MessageBlock::text(t.clone())];
            self.content = MessageContent::Blocks(promoted);
        }
        match &mut self.content {
            MessageContent::Blocks(blocks) => blocks,
            MessageContent::Text(_) => unreachable!("promoted above"),
        }
    }
}

/// Message content is either a bare string or a list of typed blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<MessageBlock>),
}

/// One content block. The `type` discriminator is kept as a raw string so
/// unknown block kinds survive a round trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageBlock {
    #[serde(rename = "type")]
    pub block_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Thinking text, present on `thinking` blocks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,

    /// Upstream-issued signature for a thinking block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    /// Tool-call id, present on `tool_use` blocks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    /// Id of the call a `tool_result` answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,

    /// Result payload of a `tool_result` block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl MessageBlock {
    pub fn text(text: impl Into<String>) -> Self {
        MessageBlock {
            block_type: "text".to_string(),
            text: Some(text.into()),
            ..MessageBlock::default()
        }
    }

    pub fn thinking(text: impl Into<String>, signature: impl Into<String>) -> Self {
        MessageBlock {
            block_type: "thinking".to_string(),
            thinking: Some(text.into()),
            signature: Some(signature.into()),
            ..MessageBlock::default()
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: Value) -> Self {
        MessageBlock {
            block_type: "tool_result".to_string(),
            tool_use_id: Some(tool_use_id.into()),
            content: Some(content),
            ..MessageBlock::default()
        }
    }

    pub fn is_thinking(&self) -> bool {
        self.block_type == "thinking" || self.block_type == "redacted_thinking"
    }

    pub fn is_tool_use(&self) -> bool {
        self.block_type == "tool_use"
    }

    pub fn is_tool_result(&self) -> bool {
        self.block_type == "tool_result"
    }
}
