//! Header construction for the two auth modes the router can operate in.
//!
//! The router owns account selection, retry, and result classification; a
//! `Provider` only knows how to turn an inbound header set — plus, in
//! override-auth mode, the selected account's current bearer token and
//! claims — into the header set actually sent upstream. Keeping this
//! behind a trait means the override_auth flag selects an implementation
//! once at startup rather than branching throughout the router.

pub mod oauth;
pub mod passthrough;

pub use oauth::OverrideAuthProvider;
pub use passthrough::PassthroughProvider;

use std::future::Future;
use std::pin::Pin;

use reqwest::header::HeaderMap;
use serde::Serialize;

/// Auth material available for one attempt when override_auth is enabled.
/// `bearer_token` is the access token normally, or the id token on the
/// one-shot retry after a primary auth failure.
pub struct AuthContext<'a> {
    pub bearer_token: &'a str,
    pub account: &'a gateway_pool::AccountSnapshot,
}

/// Health status reported by a provider for the `/health` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<serde_json::Value>,
}

/// Uses `Pin<Box<dyn Future>>` so the trait stays object-safe behind
/// `Arc<dyn Provider>`.
pub trait Provider: Send + Sync {
    /// Identifier for logging and health reporting.
    fn id(&self) -> &str;

    /// Whether this provider rewrites authorization and injects
    /// account-identifying headers. Drives whether the router needs a
    /// fresh access token before building headers at all.
    fn override_auth(&self) -> bool;

    /// Build the header set for one forwarded attempt. `auth` is `None`
    /// when override_auth is disabled, or when building headers before an
    /// account has been selected; implementations that need it and don't
    /// receive it should fall back to passing inbound headers through.
    fn build_headers(&self, inbound: &HeaderMap, auth: Option<AuthContext<'_>>) -> HeaderMap;

    fn health(&self) -> Pin<Box<dyn Future<Output = ProviderHealth> + Send + '_>>;
}

/// Headers the upstream client computes itself, plus the hop-by-hop set
/// that standard reverse-proxy hygiene never forwards verbatim.
fn strip_hop_headers(headers: &mut HeaderMap) {
    headers.remove(reqwest::header::HOST);
    headers.remove(reqwest::header::CONTENT_LENGTH);
    headers.remove(reqwest::header::CONNECTION);
    headers.remove(reqwest::header::PROXY_AUTHENTICATE);
    headers.remove(reqwest::header::PROXY_AUTHORIZATION);
    headers.remove(reqwest::header::TE);
    headers.remove(reqwest::header::TRAILER);
    headers.remove(reqwest::header::TRANSFER_ENCODING);
    headers.remove(reqwest::header::UPGRADE);
    headers.remove(reqwest::header::HeaderName::from_static("keep-alive"));
}
