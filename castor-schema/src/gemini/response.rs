use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::gemini::Content;

/// Generate-content response body, after unwrapping the upstream envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<Candidate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,

    /// In-band error object some non-OK responses carry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ResponseBody {
    /// True when the body carries no generated output at all; such responses
    /// are retried by the response transformer.
    pub fn is_empty_success(&self) -> bool {
        self.error.is_none()
            && self
                .candidates
                .iter()
                .all(|c| c.content.as_ref().is_none_or(|ct| ct.parts.is_empty()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Token accounting block; copied onto response headers for host metering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_token_count: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidates_token_count: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_token_count: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_content_token_count: Option<u64>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}
