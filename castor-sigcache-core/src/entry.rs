use serde::{Deserialize, Serialize};

/// One cached signature, as stored in memory and on disk.
///
/// `thinking_text` keeps the verbatim thought so a "last thinking" synthetic
/// block can be rebuilt even when the host stripped the original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureCacheEntry {
    #[serde(rename = "value")]
    pub signature: String,

    /// Unix ms at store time; drives both TTL tiers.
    pub timestamp: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_ids: Option<Vec<String>>,
}

impl SignatureCacheEntry {
    pub fn new(signature: impl Into<String>, timestamp: i64) -> Self {
        SignatureCacheEntry {
            signature: signature.into(),
            timestamp,
            thinking_text: None,
            tool_ids: None,
        }
    }

    pub fn with_thinking_text(mut self, text: impl Into<String>) -> Self {
        self.thinking_text = Some(text.into());
        self
    }

    pub fn with_tool_ids(mut self, tool_ids: Vec<String>) -> Self {
        self.tool_ids = Some(tool_ids);
        self
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.timestamp)
    }
}

/// Most recent signed thought observed for a session, used to front a
/// tool-use turn whose thinking the host dropped entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastThinking {
    pub text: String,
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_ids: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn disk_shape_uses_value_field() {
        let entry = SignatureCacheEntry::new("sig", 1000).with_thinking_text("thought");
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({"value": "sig", "timestamp": 1000, "thinkingText": "thought"})
        );
    }

    #[test]
    fn age_is_clamped_against_clock_skew() {
        let entry = SignatureCacheEntry::new("sig", 5000);
        assert_eq!(entry.age_ms(4000), 0);
        assert_eq!(entry.age_ms(7500), 2500);
    }
}
