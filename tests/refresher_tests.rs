//! Token-refresher tests against an in-process OAuth endpoint.

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::post,
};
use base64::Engine as _;
use castor::OauthError;
use castor::accounts::TokenRefresher;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct Captured {
    headers: HeaderMap,
    body: Vec<u8>,
}

#[derive(Clone)]
struct TokenEndpoint {
    requests: Arc<Mutex<Vec<Captured>>>,
    status: StatusCode,
    body: serde_json::Value,
}

async fn token_handler(
    State(state): State<TokenEndpoint>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    state.requests.lock().unwrap().push(Captured {
        headers,
        body: body.to_vec(),
    });
    (state.status, axum::Json(state.body.clone()))
}

async fn spawn_endpoint(state: TokenEndpoint) -> String {
    let app = Router::new()
        .route("/token", post(token_handler))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}/token")
}

#[tokio::test]
async fn refresh_posts_expected_form_and_returns_expiry() {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let endpoint = spawn_endpoint(TokenEndpoint {
        requests: Arc::clone(&requests),
        status: StatusCode::OK,
        body: json!({
            "access_token": "fresh-token",
            "token_type": "Bearer",
            "expires_in": 3599
        }),
    })
    .await;

    let refresher = TokenRefresher::with_token_url(reqwest::Client::new(), endpoint);
    let before = castor::now_ms();
    let token = refresher.refresh("refresh-token-1").await.expect("refresh");

    assert_eq!(token.access_token, "fresh-token");
    let lower = before + 3_500_000;
    let upper = castor::now_ms() + 3_599_000;
    assert!((lower..=upper).contains(&token.expires));

    let captured = requests.lock().unwrap().clone();
    assert_eq!(captured.len(), 1);
    let first = &captured[0];

    let form: HashMap<String, String> = url::form_urlencoded::parse(&first.body)
        .into_owned()
        .collect();
    assert_eq!(
        form.get("grant_type").map(String::as_str),
        Some("refresh_token")
    );
    assert_eq!(
        form.get("refresh_token").map(String::as_str),
        Some("refresh-token-1")
    );

    // Client credentials arrive in the body or as HTTP Basic auth depending
    // on the oauth2 client's choice; accept either.
    let has_body_creds =
        form.contains_key("client_id") && form.contains_key("client_secret");
    let has_basic = first
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Basic "))
        .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
        .is_some();
    assert!(has_body_creds || has_basic);
}

#[tokio::test]
async fn invalid_grant_maps_to_terminal_error() {
    let endpoint = spawn_endpoint(TokenEndpoint {
        requests: Arc::new(Mutex::new(Vec::new())),
        status: StatusCode::BAD_REQUEST,
        body: json!({"error": "invalid_grant", "error_description": "Token has been revoked."}),
    })
    .await;

    let refresher = TokenRefresher::with_token_url(reqwest::Client::new(), endpoint);
    let err = refresher.refresh("revoked-token").await.expect_err("refresh");

    assert!(matches!(err, OauthError::InvalidGrant));
    assert!(!castor::IsRetryable::is_retryable(&err));
}

#[tokio::test]
async fn other_oauth_errors_stay_non_terminal() {
    let endpoint = spawn_endpoint(TokenEndpoint {
        requests: Arc::new(Mutex::new(Vec::new())),
        status: StatusCode::BAD_REQUEST,
        body: json!({"error": "invalid_request"}),
    })
    .await;

    let refresher = TokenRefresher::with_token_url(reqwest::Client::new(), endpoint);
    let err = refresher.refresh("some-token").await.expect_err("refresh");

    assert!(matches!(err, OauthError::ServerResponse { .. }));
}
