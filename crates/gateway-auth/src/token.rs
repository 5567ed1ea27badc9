//! OAuth token refresh.
//!
//! The gateway never performs the authorization-code leg of OAuth — accounts
//! arrive pre-authorized via the account store. The only interaction with
//! the identity provider is refreshing an access token from a refresh token.

use serde::Deserialize;

use crate::constants::TOKEN_ENDPOINT;
use crate::error::{Error, Result};

/// Longest error body we'll echo back in an error message.
const TRUNCATE_BODY_AT: usize = 500;

/// Response from the token endpoint.
///
/// `id_token` and `account_id` are optional: not every identity provider
/// configuration issues them, and their absence just narrows what sticky
/// routing and header injection can derive later.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
}

/// Refresh an access token using a refresh token.
///
/// Called both by the background proactive-refresh task and, request-time,
/// by the pool's single-flight `ensure_access_token` path. Never retries
/// internally — a caller that wants another attempt rotates accounts or
/// retries the whole refresh itself.
pub async fn refresh_token(
    client: &reqwest::Client,
    refresh: &str,
    client_id: &str,
) -> Result<TokenResponse> {
    refresh_token_at(client, TOKEN_ENDPOINT, refresh, client_id).await
}

/// Same protocol as [`refresh_token`] against an explicit endpoint, so
/// tests can point it at a local mock instead of the real identity
/// provider.
pub async fn refresh_token_at(
    client: &reqwest::Client,
    endpoint: &str,
    refresh: &str,
    client_id: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(endpoint)
        .header("content-type", "application/x-www-form-urlencoded")
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", client_id),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        let truncated: String = body.chars().take(TRUNCATE_BODY_AT).collect();

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(truncated));
        }
        return Err(Error::RefreshFailed(truncated));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::RefreshFailed(format!("invalid refresh response: {e}")))
}


/// A local stand-in for the identity provider's token endpoint: always
/// returns the configured status and body, and counts calls.
#[cfg(test)]
mod mock_token_endpoint {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::extract::State;
    use axum::routing::post;
    use tokio::net::TcpListener;

    pub struct MockTokenEndpoint {
        pub calls: AtomicUsize,
        status: u16,
        body: String,
    }

    pub async fn spawn(status: u16, body: &str) -> (String, Arc<MockTokenEndpoint>) {
        let state = Arc::new(MockTokenEndpoint {
            calls: AtomicUsize::new(0),
            status,
            body: body.to_string(),
        });
        let app = Router::new().route("/", post(handler)).with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        (format!("http://{addr}/"), state)
    }

    async fn handler(State(state): State<Arc<MockTokenEndpoint>>) -> (axum::http::StatusCode, String) {
        state.calls.fetch_add(1, Ordering::SeqCst);
        (axum::http::StatusCode::from_u16(state.status).unwrap(), state.body.clone())
    }
}
