//! Broker configuration managed by Figment.
//!
//! Precedence, lowest to highest: built-in defaults, the optional TOML file
//! in the host config directory, then `ANTIGRAVITY_*` environment variables
//! (nested tables use `__`, e.g. `ANTIGRAVITY_SIGNATURE_CACHE__ENABLED`).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const CONFIG_FILE: &str = "antigravity.toml";
const ENV_PREFIX: &str = "ANTIGRAVITY_";

/// Host configuration directory (`$XDG_CONFIG_HOME/opencode` or
/// `%APPDATA%/opencode`).
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("opencode")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Suppress non-recovery toasts.
    #[serde(default)]
    pub quiet_mode: bool,

    /// Write debug logs to a file under `log_dir`.
    #[serde(default)]
    pub debug: bool,

    /// Log directory override. Default: `<config dir>/antigravity-logs`.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Enable signature caching and thinking backfill.
    #[serde(default)]
    pub keep_thinking: bool,

    /// Enable the session-recovery hook.
    #[serde(default = "default_true")]
    pub session_recovery: bool,

    /// Auto-send the continuation prompt after a successful recovery.
    #[serde(default = "default_true")]
    pub auto_resume: bool,

    /// Continuation prompt used by recovery and crash-and-restart turns.
    #[serde(default = "default_resume_text")]
    pub resume_text: String,

    #[serde(default)]
    pub signature_cache: SignatureCacheConfig,

    /// Retry cap for upstream bodies with no candidates.
    #[serde(default = "default_empty_response_max_attempts")]
    pub empty_response_max_attempts: u32,

    /// Delay between empty-response retries.
    #[serde(default = "default_empty_response_retry_delay_ms")]
    pub empty_response_retry_delay_ms: u64,

    /// Enable orphan tool-call recovery passes.
    #[serde(default = "default_true")]
    pub tool_id_recovery: bool,

    /// Append strict-parameter guidance to Claude tool definitions.
    #[serde(default = "default_true")]
    pub claude_tool_hardening: bool,

    /// Run the background token-refresh queue.
    #[serde(default = "default_true")]
    pub proactive_token_refresh: bool,

    /// Refresh tokens this many seconds before expiry.
    #[serde(default = "default_buffer_seconds")]
    pub buffer_seconds: u64,

    /// Interval between refresh-queue sweeps.
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            quiet_mode: false,
            debug: false,
            log_dir: None,
            keep_thinking: false,
            session_recovery: true,
            auto_resume: true,
            resume_text: default_resume_text(),
            signature_cache: SignatureCacheConfig::default(),
            empty_response_max_attempts: default_empty_response_max_attempts(),
            empty_response_retry_delay_ms: default_empty_response_retry_delay_ms(),
            tool_id_recovery: true,
            claude_tool_hardening: true,
            proactive_token_refresh: true,
            buffer_seconds: default_buffer_seconds(),
            check_interval_seconds: default_check_interval_seconds(),
        }
    }
}

impl BrokerConfig {
    fn figment() -> Figment {
        let figment = Figment::new().merge(Serialized::defaults(BrokerConfig::default()));
        let file = config_dir().join(CONFIG_FILE);
        let figment = if file.is_file() {
            figment.merge(Toml::file(file))
        } else {
            figment
        };
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration; any extraction failure falls back to defaults so a
    /// malformed file never takes the broker down.
    pub fn load() -> Self {
        Self::figment().extract().unwrap_or_else(|err| {
            tracing::warn!("configuration extract failed, using defaults: {err}");
            BrokerConfig::default()
        })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| config_dir().join("antigravity-logs"))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignatureCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_memory_ttl_seconds")]
    pub memory_ttl_seconds: u64,

    #[serde(default = "default_disk_ttl_seconds")]
    pub disk_ttl_seconds: u64,

    #[serde(default = "default_write_interval_seconds")]
    pub write_interval_seconds: u64,
}

impl Default for SignatureCacheConfig {
    fn default() -> Self {
        SignatureCacheConfig {
            enabled: true,
            memory_ttl_seconds: default_memory_ttl_seconds(),
            disk_ttl_seconds: default_disk_ttl_seconds(),
            write_interval_seconds: default_write_interval_seconds(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_resume_text() -> String {
    "continue".to_string()
}

fn default_empty_response_max_attempts() -> u32 {
    4
}

fn default_empty_response_retry_delay_ms() -> u64 {
    2000
}

fn default_buffer_seconds() -> u64 {
    1800
}

fn default_check_interval_seconds() -> u64 {
    300
}

fn default_memory_ttl_seconds() -> u64 {
    3600
}

fn default_disk_ttl_seconds() -> u64 {
    172_800
}

fn default_write_interval_seconds() -> u64 {
    60
}
