//! Model families, physical quota buckets and upstream header styles.

use serde::{Deserialize, Serialize};

/// Coarse model family, derived from the requested model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Claude,
    Gemini,
}

impl ModelFamily {
    pub fn from_model(model: &str) -> Self {
        if model.to_lowercase().contains("claude") {
            ModelFamily::Claude
        } else {
            ModelFamily::Gemini
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::Claude => "claude",
            ModelFamily::Gemini => "gemini",
        }
    }
}

/// Physical rate-limit bucket on the upstream.
///
/// Claude traffic shares one pool; Gemini traffic reaches two distinct pools
/// depending on which client the request impersonates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum QuotaKey {
    #[serde(rename = "claude")]
    Claude,
    #[serde(rename = "gemini-antigravity")]
    GeminiAntigravity,
    #[serde(rename = "gemini-cli")]
    GeminiCli,
}

impl QuotaKey {
    /// The bucket a request drains, given its family and header style.
    pub fn for_request(family: ModelFamily, style: HeaderStyle) -> Self {
        match (family, style) {
            (ModelFamily::Claude, _) => QuotaKey::Claude,
            (ModelFamily::Gemini, HeaderStyle::Antigravity) => QuotaKey::GeminiAntigravity,
            (ModelFamily::Gemini, HeaderStyle::GeminiCli) => QuotaKey::GeminiCli,
        }
    }

    /// All buckets that can serve a family, in preference order.
    pub fn for_family(family: ModelFamily) -> &'static [QuotaKey] {
        match family {
            ModelFamily::Claude => &[QuotaKey::Claude],
            ModelFamily::Gemini => &[QuotaKey::GeminiAntigravity, QuotaKey::GeminiCli],
        }
    }
}

/// Client identity presented to the upstream. The Gemini family can fall back
/// from the IDE identity to the CLI identity when the first pool is limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeaderStyle {
    Antigravity,
    GeminiCli,
}

impl HeaderStyle {
    /// The three identity headers this style sends.
    pub fn header_tuple(self) -> [(&'static str, &'static str); 3] {
        match self {
            HeaderStyle::Antigravity => [
                ("User-Agent", "antigravity/1.11.5 windows/amd64"),
                (
                    "X-Goog-Api-Client",
                    "google-cloud-sdk vscode_cloudshelleditor/0.1",
                ),
                (
                    "Client-Metadata",
                    r#"{"ideType":"IDE_UNSPECIFIED","platform":"PLATFORM_UNSPECIFIED","pluginType":"GEMINI"}"#,
                ),
            ],
            HeaderStyle::GeminiCli => [
                ("User-Agent", "google-api-nodejs-client/9.15.1"),
                ("X-Goog-Api-Client", "gl-node/22.17.0"),
                (
                    "Client-Metadata",
                    "ideType=IDE_UNSPECIFIED,platform=PLATFORM_UNSPECIFIED,pluginType=GEMINI",
                ),
            ],
        }
    }
}

/// Why the manager last moved a family onto an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SwitchReason {
    #[default]
    Initial,
    RateLimit,
    Rotation,
}
