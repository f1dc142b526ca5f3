use crate::families::{HeaderStyle, ModelFamily};
use reqwest::StatusCode;
use thiserror::Error as ThisError;

/// Retry classification shared by the broker's error types.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

/// Failures of the OAuth token exchange.
#[derive(Debug, ThisError)]
pub enum OauthError {
    /// The refresh token was rejected outright; the account is dead and must
    /// be removed from the pool.
    #[error("refresh token permanently rejected (invalid_grant)")]
    InvalidGrant,

    #[error("OAuth server response error: {error}")]
    ServerResponse { error: String },

    #[error("OAuth request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("OAuth token endpoint parse error: {message}. Body: {body}")]
    Parse { message: String, body: String },

    #[error("OAuth token exchange timed out")]
    Timeout,

    #[error("OAuth unexpected error: {message}")]
    Other { message: String },
}

impl IsRetryable for OauthError {
    fn is_retryable(&self) -> bool {
        match self {
            OauthError::Request(_) | OauthError::Parse { .. } | OauthError::Timeout => true,
            OauthError::InvalidGrant
            | OauthError::ServerResponse { .. }
            | OauthError::Other { .. } => false,
        }
    }
}

/// Top-level broker error taxonomy.
#[derive(Debug, ThisError)]
pub enum BrokerError {
    #[error(transparent)]
    Oauth(#[from] OauthError),

    /// Every account's quota keys for this family are limited.
    #[error("all accounts rate-limited for {}; retry in {retry_after_ms}ms", family.as_str())]
    NoAvailableAccount {
        family: ModelFamily,
        retry_after_ms: i64,
    },

    /// One account hit a limit on one bucket; the dispatcher rotates.
    #[error("rate limited on {} ({style:?}); retry in {retry_after_ms}ms", family.as_str())]
    RateLimited {
        family: ModelFamily,
        style: HeaderStyle,
        retry_after_ms: i64,
    },

    #[error("upstream error with status {status}")]
    UpstreamStatus { status: StatusCode, body: String },

    #[error("upstream returned no candidates after {attempts} attempts")]
    EmptyResponse { attempts: u32 },

    /// Internal sentinel: the upstream rejected thinking-block ordering; the
    /// dispatcher re-prepares once with forced recovery.
    #[error("thinking-block order rejected by upstream")]
    ThinkingRecoveryNeeded { upstream_message: String },

    #[error("no usable project id: {message}")]
    ProjectUnavailable { message: String },

    #[error("configuration missing: {message}; run the OAuth login flow first")]
    ConfigurationMissing { message: String },

    #[error("stream protocol error: {0}")]
    Stream(String),

    #[error("not a generative-endpoint call: {0}")]
    UnhandledUrl(String),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl IsRetryable for BrokerError {
    fn is_retryable(&self) -> bool {
        match self {
            BrokerError::Reqwest(_) => true,
            BrokerError::UpstreamStatus { status, .. } => status.is_server_error(),
            BrokerError::RateLimited { .. } => true,
            BrokerError::Oauth(e) => e.is_retryable(),
            _ => false,
        }
    }
}
