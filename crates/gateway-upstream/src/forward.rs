//! `fetch`: one forwarded request to the upstream, including the internal
//! transient-failure retry loop.

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Method, header::HeaderMap};
use tokio_util::sync::CancellationToken;

use crate::retry::{RetryConfig, backoff_delay_ms};

/// Error bodies are reported back to the client as diagnostic text, not
/// parsed further downstream, so a generous cap is enough to avoid hauling
/// megabytes of upstream HTML into a log line.
const MAX_ERROR_BODY: usize = 4096;

/// Outcome of one forwarded request, already classified for the router.
#[derive(Debug)]
pub enum ForwardResult {
    /// Upstream responded 2xx. The response (and its body stream) is handed
    /// back unconsumed so the router can stream it to the client.
    Ok(reqwest::Response),
    /// Upstream responded 401 or 403.
    AuthFailure { status: u16, body: String },
    /// Upstream reported `usage_limit_reached` or responded 429.
    Quota { resets_at_ms: Option<i64>, body: String },
    /// Upstream 5xx, a connection error, or a gateway-side timeout. Eligible
    /// for internal retry.
    Transient { status: u16, detail: String },
    /// Any other non-2xx status. Forwarded to the client verbatim.
    Fatal { status: u16, body: String },
    /// The caller's cancel signal fired before a result was available.
    Aborted,
}

/// Forward one request to `target_url`, retrying transient failures per
/// `retry` with exponential backoff and jitter. Honors `cancel` at every
/// suspension point: mid-request, mid-timeout, and mid-retry-delay.
pub async fn fetch(
    client: &reqwest::Client,
    method: Method,
    target_url: &str,
    headers: HeaderMap,
    body: Bytes,
    cancel: &CancellationToken,
    timeout: Duration,
    retry: &RetryConfig,
) -> ForwardResult {
    let mut attempt_index = 0u32;

    loop {
        if cancel.is_cancelled() {
            return ForwardResult::Aborted;
        }

        let result = attempt_once(client, method.clone(), target_url, headers.clone(), body.clone(), cancel, timeout).await;

        let retryable = matches!(result, ForwardResult::Transient { .. });
        if retryable && attempt_index < retry.max_retries {
            let delay = Duration::from_millis(backoff_delay_ms(retry, attempt_index));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ForwardResult::Aborted,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt_index += 1;
            continue;
        }

        return result;
    }
}

async fn attempt_once(
    client: &reqwest::Client,
    method: Method,
    target_url: &str,
    headers: HeaderMap,
    body: Bytes,
    cancel: &CancellationToken,
    timeout: Duration,
) -> ForwardResult {
    let request = match client.request(method, target_url).headers(headers).body(body).build() {
        Ok(request) => request,
        Err(e) => return ForwardResult::Fatal { status: 0, body: e.to_string() },
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => ForwardResult::Aborted,
        _ = tokio::time::sleep(timeout) => {
            if cancel.is_cancelled() {
                ForwardResult::Aborted
            } else {
                ForwardResult::Transient { status: 504, detail: "upstream request timed out".to_string() }
            }
        }
        outcome = client.execute(request) => match outcome {
            Ok(response) => classify_response(response).await,
            Err(e) => ForwardResult::Transient { status: 502, detail: e.to_string() },
        },
    }
}

async fn classify_response(response: reqwest::Response) -> ForwardResult {
    let status = response.status();
    if status.is_success() {
        return ForwardResult::Ok(response);
    }

    let status_u16 = status.as_u16();
    let body = response.text().await.unwrap_or_default();
    classify_error(status_u16, &body)
}

/// Pure classification of a non-2xx response, split out from
/// [`classify_response`] so it can be unit tested without a live socket.
pub(crate) fn classify_error(status: u16, body: &str) -> ForwardResult {
    let truncated = truncate(body);
    let quota_resets_at = parse_usage_limit_reached(body);

    if status == 429 || quota_resets_at.is_some() {
        return ForwardResult::Quota {
            resets_at_ms: quota_resets_at.flatten(),
            body: truncated,
        };
    }
    if status == 401 || status == 403 {
        return ForwardResult::AuthFailure { status, body: truncated };
    }
    if (500..600).contains(&status) {
        return ForwardResult::Transient { status, detail: truncated };
    }
    ForwardResult::Fatal { status, body: truncated }
}

/// `Some(resets_at_ms)` if the body is JSON shaped like
/// `{"error": {"type": "usage_limit_reached", "resets_at": <secs>}}`; the
/// inner option is `None` when `resets_at` is absent or non-numeric. Plain
/// `None` means the body does not carry this signal at all.
fn parse_usage_limit_reached(body: &str) -> Option<Option<i64>> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    if error.get("type")?.as_str()? != "usage_limit_reached" {
        return None;
    }
    let resets_at_ms = error.get("resets_at").and_then(|v| v.as_i64()).map(|secs| secs * 1000);
    Some(resets_at_ms)
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        body.to_string()
    } else {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &body[..cut])
    }
}



#[cfg(test)]
mod fetch_tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::mock_upstream::spawn;
    use super::*;

    fn retry() -> RetryConfig {
        RetryConfig { max_retries: 2, base_ms: 10, max_ms: 50, jitter_ms: 5 }
    }

    #[tokio::test]
    async fn successful_response_is_ok() {
        let (url, _state) = spawn(0, 200).await;
        let client = reqwest::Client::new();
        let result = fetch(
            &client,
            Method::GET,
            &url,
            HeaderMap::new(),
            Bytes::new(),
            &CancellationToken::new(),
            Duration::from_secs(5),
            &retry(),
        )
        .await;

        assert!(matches!(result, ForwardResult::Ok(_)));
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let (url, state) = spawn(2, 503).await;
        let client = reqwest::Client::new();
        let result = fetch(
            &client,
            Method::GET,
            &url,
            HeaderMap::new(),
            Bytes::new(),
            &CancellationToken::new(),
            Duration::from_secs(5),
            &retry(),
        )
        .await;

        assert!(matches!(result, ForwardResult::Ok(_)));
        assert_eq!(state.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_retry_budget() {
        let (url, state) = spawn(usize::MAX, 503).await;
        let client = reqwest::Client::new();
        let result = fetch(
            &client,
            Method::GET,
            &url,
            HeaderMap::new(),
            Bytes::new(),
            &CancellationToken::new(),
            Duration::from_secs(5),
            &retry(),
        )
        .await;

        assert!(matches!(result, ForwardResult::Transient { status: 503, .. }));
        // max_retries = 2 means 3 total attempts.
        assert_eq!(state.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelled_signal_aborts_before_dispatch() {
        let (url, _state) = spawn(0, 200).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let client = reqwest::Client::new();
        let result = fetch(
            &client,
            Method::GET,
            &url,
            HeaderMap::new(),
            Bytes::new(),
            &cancel,
            Duration::from_secs(5),
            &retry(),
        )
        .await;

        assert!(matches!(result, ForwardResult::Aborted));
    }

    #[tokio::test]
    async fn quota_status_is_not_retried() {
        let (url, state) = spawn(usize::MAX, 429).await;
        let client = reqwest::Client::new();
        let result = fetch(
            &client,
            Method::GET,
            &url,
            HeaderMap::new(),
            Bytes::new(),
            &CancellationToken::new(),
            Duration::from_secs(5),
            &retry(),
        )
        .await;

        assert!(matches!(result, ForwardResult::Quota { .. }));
        assert_eq!(state.calls.load(Ordering::SeqCst), 1);
    }
}
