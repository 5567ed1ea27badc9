//! The request router: the engine that ties the pool, the provider, and
//! the upstream client together for one inbound request.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::TryStreamExt;
use gateway_pool::{AccountSnapshot, Pool};
use gateway_provider::{AuthContext, Provider};
use gateway_upstream::{ForwardResult, RetryConfig};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, warn};

/// Caps the in-memory inbound body. Interactive request/response sizes,
/// not file uploads — retries replay this same buffer to other accounts.
const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

const SESSION_HEADER_PRIORITY: &[&str] =
    &["x-session-id", "openai-session", "x-openai-session", "x-request-id"];

#[derive(Clone)]
pub struct RouterState {
    pub pool: Arc<Pool>,
    pub provider: Arc<dyn Provider>,
    pub http_client: reqwest::Client,
    pub base_url: Arc<String>,
    pub cooldown_seconds: u64,
    pub max_retry_passes: u32,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
    pub shutdown: CancellationToken,
}

/// Resolve the sticky-routing key for an inbound request: the first
/// present session-identifying header, else the remote address, else a
/// fixed fallback.
fn session_key(headers: &HeaderMap, remote: SocketAddr) -> String {
    for name in SESSION_HEADER_PRIORITY {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    format!("ip:{}", remote.ip())
}

pub async fn route(
    State(state): State<RouterState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let span = tracing::info_span!("request", request_id = %request_id);

    async move {
        let (parts, body) = request.into_parts();
        let method = parts.method;
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let inbound_headers = parts.headers;

        let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to read inbound request body");
                return (StatusCode::BAD_REQUEST, "invalid_request_body").into_response();
            }
        };

        let session_key = session_key(&inbound_headers, remote);
        let started = Instant::now();
        let response = drive(&state, &method, &path_and_query, &inbound_headers, body_bytes, &session_key).await;

        let status = response.status().as_u16();
        crate::metrics::record_request(status, method.as_str(), started.elapsed().as_secs_f64());
        response
    }
    .instrument(span)
    .await
}

async fn drive(
    state: &RouterState,
    method: &Method,
    path_and_query: &str,
    inbound_headers: &HeaderMap,
    body: Bytes,
    session_key: &str,
) -> Response {
    let target_url = match gateway_upstream::compute_target_url(&state.base_url, path_and_query) {
        Ok(url) => url,
        Err(e) => {
            warn!(error = %e, "invalid upstream base url");
            return (StatusCode::INTERNAL_SERVER_ERROR, "invalid_upstream_configuration").into_response();
        }
    };

    let mut excluded: HashSet<String> = HashSet::new();
    let attempt_budget = state.max_retry_passes as usize + state.pool.size();
    let cancel = state.shutdown.child_token();

    for _ in 0..attempt_budget {
        let account_name = match state.pool.sticky(session_key, &excluded).await {
            Some(name) => name,
            None => match state.pool.pick(&excluded) {
                Some(name) => name,
                None => {
                    return (
                        StatusCode::TOO_MANY_REQUESTS,
                        axum::Json(serde_json::json!({"error": "all_accounts_exhausted"})),
                    )
                        .into_response();
                }
            },
        };

        state.pool.assign(session_key, &account_name).await;
        state.pool.mark_attempt(&account_name).await;

        info!(method = %method, path = %path_and_query, account = %account_name, "{method} {path_and_query} -> {account_name}");

        let Some(snapshot) = state.pool.snapshot(&account_name).await else {
            excluded.insert(account_name);
            continue;
        };

        let access_token = if state.provider.override_auth() {
            match state.pool.ensure_access_token(&account_name).await {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!(account = %account_name, error = %e, "no access token available");
                    return (StatusCode::UNAUTHORIZED, "missing_access_token").into_response();
                }
            }
        } else {
            None
        };

        let result = attempt_with_auth_fallback(
            state,
            method,
            &target_url,
            inbound_headers,
            &body,
            &snapshot,
            access_token.as_deref(),
            &cancel,
        )
        .await;

        match result {
            ForwardResult::Ok(upstream) => {
                state.pool.mark_success(&account_name).await;
                return stream_response(upstream);
            }
            ForwardResult::Quota { resets_at_ms, .. } => {
                info!(account = %account_name, "quota hit, switching from {account_name}");
                excluded.insert(account_name.clone());
                state.pool.mark_quota(&account_name, state.cooldown_seconds, resets_at_ms).await;
                state.pool.clear_assignment(session_key).await;
            }
            ForwardResult::AuthFailure { status, body } => {
                warn!(account = %account_name, status, "auth failure on {account_name} ({body})");
                excluded.insert(account_name.clone());
                state.pool.mark_auth_failure(&account_name, &body).await;
                state.pool.clear_assignment(session_key).await;
            }
            ForwardResult::Fatal { status, body } => {
                return write_through(status, body);
            }
            ForwardResult::Transient { status, detail } => {
                crate::metrics::record_upstream_error("transient");
                warn!(account = %account_name, status, "upstream error {status} on {account_name}");
                return write_through(status, detail);
            }
            ForwardResult::Aborted => {
                return StatusCode::OK.into_response();
            }
        }
    }

    (StatusCode::INTERNAL_SERVER_ERROR, "gateway_exhausted").into_response()
}

/// One forwarded attempt for an account, with the one-shot id-token
/// fallback on a primary auth failure baked in.
async fn attempt_with_auth_fallback(
    state: &RouterState,
    method: &Method,
    target_url: &str,
    inbound_headers: &HeaderMap,
    body: &Bytes,
    snapshot: &AccountSnapshot,
    access_token: Option<&str>,
    cancel: &CancellationToken,
) -> ForwardResult {
    let headers = build_headers(state, inbound_headers, snapshot, access_token);
    let result = gateway_upstream::fetch(
        &state.http_client,
        method.clone(),
        target_url,
        headers,
        body.clone(),
        cancel,
        state.request_timeout,
        &state.retry,
    )
    .await;

    let is_auth_failure = matches!(result, ForwardResult::AuthFailure { .. });
    if !is_auth_failure || access_token.is_none() {
        return result;
    }

    let Some(id_token) = snapshot.id_token.as_deref() else {
        return result;
    };

    let retry_headers = build_headers(state, inbound_headers, snapshot, Some(id_token));
    gateway_upstream::fetch(
        &state.http_client,
        method.clone(),
        target_url,
        retry_headers,
        body.clone(),
        cancel,
        state.request_timeout,
        &state.retry,
    )
    .await
}

fn build_headers(
    state: &RouterState,
    inbound_headers: &HeaderMap,
    snapshot: &AccountSnapshot,
    bearer_token: Option<&str>,
) -> HeaderMap {
    match bearer_token {
        Some(token) => state.provider.build_headers(inbound_headers, Some(AuthContext { bearer_token: token, account: snapshot })),
        None => state.provider.build_headers(inbound_headers, None),
    }
}

fn write_through(status: u16, body: String) -> Response {
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (code, body).into_response()
}

/// Stream the upstream response back to the client chunk-by-chunk, never
/// buffering the full body and never rewriting it once headers are sent.
fn stream_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    headers.remove(axum::http::header::CONTENT_LENGTH);
    headers.remove(axum::http::header::TRANSFER_ENCODING);

    let stream = upstream.bytes_stream().map_err(std::io::Error::other);
    let body = Body::from_stream(stream);

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
