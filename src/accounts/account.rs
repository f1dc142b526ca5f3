use crate::families::{HeaderStyle, ModelFamily, QuotaKey, SwitchReason};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Clock-skew buffer: a token this close to expiry counts as expired.
pub const EXPIRY_SKEW_MS: i64 = 60_000;

/// One upstream user credential.
///
/// Owned by the account manager for the process lifetime; the accounts file
/// is authoritative only at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    pub refresh_token: String,

    /// User-supplied project override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    /// Upstream-managed project discovered via loadCodeAssist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managed_project_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Access-token expiry, unix ms.
    #[serde(default)]
    pub expires: i64,

    #[serde(default)]
    pub added_at: i64,

    #[serde(default)]
    pub last_used: i64,

    /// Per-bucket cooldown deadlines, unix ms. Entries in the past mean the
    /// bucket is free and are pruned on access.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rate_limit_reset_times: BTreeMap<QuotaKey, i64>,

    #[serde(default)]
    pub last_switch_reason: SwitchReason,
}

impl Account {
    pub fn new(refresh_token: impl Into<String>, added_at: i64) -> Self {
        Account {
            email: None,
            refresh_token: refresh_token.into(),
            project_id: None,
            managed_project_id: None,
            access_token: None,
            expires: 0,
            added_at,
            last_used: 0,
            rate_limit_reset_times: BTreeMap::new(),
            last_switch_reason: SwitchReason::Initial,
        }
    }

    /// Expired when within the skew buffer of the recorded expiry.
    pub fn is_access_token_expired(&self, now_ms: i64) -> bool {
        self.access_token.is_none() || self.expires <= now_ms + EXPIRY_SKEW_MS
    }

    /// Drop reset times that have already passed.
    pub fn prune_expired_resets(&mut self, now_ms: i64) {
        self.rate_limit_reset_times.retain(|_, reset| *reset > now_ms);
    }

    fn is_key_limited(&self, key: QuotaKey, now_ms: i64) -> bool {
        self.rate_limit_reset_times
            .get(&key)
            .is_some_and(|reset| *reset > now_ms)
    }

    /// An account is limited for a family only when every one of the
    /// family's buckets is cooling down.
    pub fn is_rate_limited_for_family(&self, family: ModelFamily, now_ms: i64) -> bool {
        QuotaKey::for_family(family)
            .iter()
            .all(|key| self.is_key_limited(*key, now_ms))
    }

    /// First free header style for the family, preferring the IDE identity.
    pub fn available_header_style(
        &self,
        family: ModelFamily,
        now_ms: i64,
    ) -> Option<HeaderStyle> {
        match family {
            ModelFamily::Claude => {
                (!self.is_key_limited(QuotaKey::Claude, now_ms)).then_some(HeaderStyle::Antigravity)
            }
            ModelFamily::Gemini => {
                if !self.is_key_limited(QuotaKey::GeminiAntigravity, now_ms) {
                    Some(HeaderStyle::Antigravity)
                } else if !self.is_key_limited(QuotaKey::GeminiCli, now_ms) {
                    Some(HeaderStyle::GeminiCli)
                } else {
                    None
                }
            }
        }
    }

    /// Milliseconds until any of the family's buckets frees up; 0 when one
    /// already is.
    pub fn wait_ms_for_family(&self, family: ModelFamily, now_ms: i64) -> i64 {
        QuotaKey::for_family(family)
            .iter()
            .map(|key| {
                self.rate_limit_reset_times
                    .get(key)
                    .map_or(0, |reset| (*reset - now_ms).max(0))
            })
            .min()
            .unwrap_or(0)
    }
}

/// Per-family sticky selection indices; −1 means no selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyIndices {
    pub claude: i64,
    pub gemini: i64,
}

impl Default for FamilyIndices {
    fn default() -> Self {
        FamilyIndices {
            claude: -1,
            gemini: -1,
        }
    }
}

impl FamilyIndices {
    pub fn get(&self, family: ModelFamily) -> i64 {
        match family {
            ModelFamily::Claude => self.claude,
            ModelFamily::Gemini => self.gemini,
        }
    }

    pub fn set(&mut self, family: ModelFamily, index: i64) {
        match family {
            ModelFamily::Claude => self.claude = index,
            ModelFamily::Gemini => self.gemini = index,
        }
    }
}

/// Persisted pool state, current version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountsFile {
    #[serde(default = "AccountsFile::current_version")]
    pub version: u32,

    #[serde(default)]
    pub accounts: Vec<Account>,

    #[serde(default = "default_active_index")]
    pub active_index: i64,

    #[serde(default)]
    pub active_index_by_family: FamilyIndices,
}

impl Default for AccountsFile {
    fn default() -> Self {
        AccountsFile::with_accounts(Vec::new())
    }
}

impl AccountsFile {
    pub const VERSION: u32 = 3;

    fn current_version() -> u32 {
        Self::VERSION
    }

    pub fn with_accounts(accounts: Vec<Account>) -> Self {
        AccountsFile {
            version: Self::VERSION,
            accounts,
            active_index: -1,
            active_index_by_family: FamilyIndices::default(),
        }
    }
}

fn default_active_index() -> i64 {
    -1
}
