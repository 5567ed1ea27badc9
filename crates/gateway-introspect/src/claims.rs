//! Claim derivation for ChatGPT-style OAuth tokens.
//!
//! A token is three dot-separated base64url segments. We decode the middle
//! one as JSON and pull out the handful of fields the gateway routes on. Any
//! failure — wrong segment count, bad base64, bad JSON — yields an all-unset
//! `TokenDetails` rather than an error; a token we can't introspect is still
//! usable as a bearer credential, it's just opaque to sticky routing.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;

/// Namespace under which ChatGPT/ Codex identity claims are nested in both
/// the access and id tokens.
const AUTH_CLAIM_NAMESPACE: &str = "https://api.openai.com/auth";

/// Claims derived from an access/id token pair. Every field is best-effort;
/// `None` means "not present in either token", not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenDetails {
    /// Unix timestamp in milliseconds.
    pub expires_at: Option<i64>,
    pub session_id: Option<String>,
    pub chatgpt_account_id: Option<String>,
    pub chatgpt_user_id: Option<String>,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
}

/// Derive [`TokenDetails`] from an access token and an optional id token.
///
/// Expiry is always read from the access token (that's the token actually
/// sent as the bearer credential). Identity claims are read from the id
/// token when present — it's the one that normally carries profile data —
/// falling back to the access token's own claims otherwise.
pub fn derive(access_token: &str, id_token: Option<&str>) -> TokenDetails {
    let access_claims = decode_segment(access_token);
    let id_claims = id_token.and_then(decode_segment);

    let expires_at = access_claims
        .as_ref()
        .and_then(|c| c.get("exp"))
        .and_then(Value::as_i64)
        .map(|exp| exp * 1000);

    let session_id = session_id_from(access_claims.as_ref()).or_else(|| session_id_from(id_claims.as_ref()));

    let primary_auth_ns = id_claims
        .as_ref()
        .and_then(auth_namespace)
        .or_else(|| access_claims.as_ref().and_then(auth_namespace));

    let chatgpt_account_id = primary_auth_ns
        .and_then(|ns| ns.get("chatgpt_account_id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let chatgpt_user_id = primary_auth_ns
        .and_then(|ns| ns.get("chatgpt_user_id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let user_id = primary_auth_ns
        .and_then(|ns| ns.get("user_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            id_claims
                .as_ref()
                .or(access_claims.as_ref())
                .and_then(|c| c.get("sub"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

    let organization_id = primary_auth_ns.and_then(organization_id_from);

    TokenDetails {
        expires_at,
        session_id,
        chatgpt_account_id,
        chatgpt_user_id,
        user_id,
        organization_id,
    }
}

/// Expiry alone, as milliseconds since epoch.
pub fn expiry(token: &str) -> Option<i64> {
    decode_segment(token)
        .and_then(|c| c.get("exp").and_then(Value::as_i64))
        .map(|exp| exp * 1000)
}

/// Session id alone.
pub fn session_id(token: &str) -> Option<String> {
    session_id_from(decode_segment(token).as_ref())
}

fn session_id_from(claims: Option<&Value>) -> Option<String> {
    let claims = claims?;
    claims
        .get("session_id")
        .or_else(|| claims.get("sid"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn auth_namespace(claims: &Value) -> Option<&Value> {
    claims.get(AUTH_CLAIM_NAMESPACE)
}

/// Prefer the organization flagged `is_default: true`; otherwise the first
/// entry in the array.
fn organization_id_from(auth_ns: &Value) -> Option<String> {
    let orgs = auth_ns.get("organizations")?.as_array()?;
    let default_org = orgs
        .iter()
        .find(|org| org.get("is_default").and_then(Value::as_bool) == Some(true));
    default_org
        .or_else(|| orgs.first())
        .and_then(|org| org.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Decode the claims (second) segment of a dot-separated JWT-shaped token.
/// Returns `None` on anything malformed rather than propagating an error —
/// per contract, introspection never fails loudly.
fn decode_segment(token: &str) -> Option<Value> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    if parts.next().is_none() {
        // Fewer than 3 segments — not JWT-shaped.
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// True iff `expires_at` is unset, or more than `buffer_s` seconds remain
/// before expiry, measured against the current wall clock.
pub fn is_fresh(expires_at: Option<i64>, buffer_s: i64) -> bool {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    is_fresh_at(expires_at, buffer_s, now_ms)
}

/// Same as [`is_fresh`] but with an explicit "now", for deterministic tests.
pub fn is_fresh_at(expires_at: Option<i64>, buffer_s: i64, now_ms: i64) -> bool {
    match expires_at {
        None => true,
        Some(exp) => exp - now_ms > buffer_s * 1000,
    }
}
