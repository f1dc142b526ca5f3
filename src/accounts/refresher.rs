use crate::error::OauthError;
use crate::util::now_ms;
use oauth2::basic::{
    BasicErrorResponse, BasicErrorResponseType, BasicRevocationErrorResponse,
    BasicTokenIntrospectionResponse, BasicTokenType,
};
use oauth2::reqwest::Error as ReqwestClientError;
use oauth2::{
    Client as OAuth2Client, ClientId, ClientSecret, EmptyExtraTokenFields, HttpClientError,
    RefreshToken, RequestTokenError, StandardRevocableToken, StandardTokenResponse, TokenResponse,
    TokenUrl,
};
use std::time::Duration;

/// Public client identity of the upstream's own CLI; refresh tokens minted
/// by the login flow are bound to it.
const OAUTH_CLIENT_ID: &str =
    "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com";
const OAUTH_CLIENT_SECRET: &str = "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";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);
const FALLBACK_EXPIRES_IN: Duration = Duration::from_secs(3600);

type TokenEndpointResponse = StandardTokenResponse<EmptyExtraTokenFields, BasicTokenType>;

type RefreshClient = OAuth2Client<
    BasicErrorResponse,
    TokenEndpointResponse,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointNotSet,
    oauth2::EndpointSet,
>;

/// Result of one successful token exchange.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Absolute expiry, unix ms.
    pub expires: i64,
}

/// Exchanges refresh tokens for access tokens. Never retries internally;
/// transient failures bubble up for the caller's policy to handle.
pub struct TokenRefresher {
    http: reqwest::Client,
    token_url: String,
}

impl TokenRefresher {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_token_url(http, OAUTH_TOKEN_URL)
    }

    /// Test seam: point the exchange at a local capture server.
    pub fn with_token_url(http: reqwest::Client, token_url: impl Into<String>) -> Self {
        TokenRefresher {
            http,
            token_url: token_url.into(),
        }
    }

    fn build_client(&self) -> Result<RefreshClient, OauthError> {
        let token_url =
            TokenUrl::new(self.token_url.clone()).map_err(|e| OauthError::Other {
                message: format!("invalid token url: {e}"),
            })?;

        let client = OAuth2Client::<
            BasicErrorResponse,
            TokenEndpointResponse,
            BasicTokenIntrospectionResponse,
            StandardRevocableToken,
            BasicRevocationErrorResponse,
        >::new(ClientId::new(OAUTH_CLIENT_ID.to_string()));

        Ok(client
            .set_client_secret(ClientSecret::new(OAUTH_CLIENT_SECRET.to_string()))
            .set_token_uri(token_url))
    }

    /// `grant_type=refresh_token` exchange with a hard 30 s deadline.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, OauthError> {
        let client = self.build_client()?;

        let refresh_token = RefreshToken::new(refresh_token.to_string());
        let exchange = client
            .exchange_refresh_token(&refresh_token)
            .request_async(&self.http);

        let token = tokio::time::timeout(EXCHANGE_TIMEOUT, exchange)
            .await
            .map_err(|_| OauthError::Timeout)?
            .map_err(map_token_error)?;

        let expires_in = token.expires_in().unwrap_or(FALLBACK_EXPIRES_IN);
        Ok(RefreshedToken {
            access_token: token.access_token().secret().to_string(),
            expires: now_ms() + i64::try_from(expires_in.as_millis()).unwrap_or(3_600_000),
        })
    }
}

type TokenRequestError = RequestTokenError<
    HttpClientError<ReqwestClientError>,
    oauth2::StandardErrorResponse<BasicErrorResponseType>,
>;

fn map_token_error(e: TokenRequestError) -> OauthError {
    match e {
        RequestTokenError::ServerResponse(err) => {
            if matches!(err.error(), BasicErrorResponseType::InvalidGrant) {
                OauthError::InvalidGrant
            } else {
                OauthError::ServerResponse {
                    error: err.error().to_string(),
                }
            }
        }
        RequestTokenError::Request(wrapper) => match wrapper {
            HttpClientError::Reqwest(real) => OauthError::Request(*real),
            other => OauthError::Other {
                message: format!("HttpClientError: {other:?}"),
            },
        },
        RequestTokenError::Parse(parse_err, body) => {
            let body_str = String::from_utf8_lossy(&body);
            OauthError::Parse {
                message: parse_err.to_string(),
                body: crate::util::preview(&body_str, 100),
            }
        }
        RequestTokenError::Other(s) => OauthError::Other { message: s },
    }
}
