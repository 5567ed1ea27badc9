//! Override-auth provider: rewrites `authorization`, drops `cookie`, and
//! injects account-identifying headers derived from the selected
//! account's token claims.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use gateway_pool::Pool;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::{AuthContext, Provider, ProviderHealth, strip_hop_headers};

pub struct OverrideAuthProvider {
    pool: Arc<Pool>,
}

impl OverrideAuthProvider {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self { pool }
    }
}

impl Provider for OverrideAuthProvider {
    fn id(&self) -> &str {
        "oauth"
    }

    fn override_auth(&self) -> bool {
        true
    }

    fn build_headers(&self, inbound: &HeaderMap, auth: Option<AuthContext<'_>>) -> HeaderMap {
        build_override_auth_headers(inbound, auth)
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = ProviderHealth> + Send + '_>> {
        Box::pin(async {
            let pool_health = self.pool.health().await;
            let status = pool_health
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("unhealthy")
                .to_string();
            ProviderHealth { status, pool: Some(pool_health) }
        })
    }
}

fn build_override_auth_headers(inbound: &HeaderMap, auth: Option<AuthContext<'_>>) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_headers(&mut headers);
    headers.remove(reqwest::header::AUTHORIZATION);
    headers.remove(reqwest::header::COOKIE);

    let Some(auth) = auth else {
        return headers;
    };

    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", auth.bearer_token)) {
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }

    let account = auth.account;
    let account_id = account.chatgpt_account_id.as_deref().or(account.account_id.as_deref());
    let user_id = account.user_id.as_deref().or(account.chatgpt_user_id.as_deref());

    insert_pair(&mut headers, "openai-session", "x-openai-session", account.session_id.as_deref());
    insert_pair(&mut headers, "openai-account-id", "x-openai-account-id", account_id);
    insert_pair(&mut headers, "openai-user-id", "x-openai-user-id", user_id);
    insert_pair(
        &mut headers,
        "openai-organization",
        "openai-organization-id",
        account.organization_id.as_deref(),
    );

    headers
}

fn insert_pair(headers: &mut HeaderMap, primary: &'static str, alias: &'static str, value: Option<&str>) {
    let Some(value) = value else { return };
    let Ok(header_value) = HeaderValue::from_str(value) else {
        return;
    };
    headers.insert(HeaderName::from_static(primary), header_value.clone());
    headers.insert(HeaderName::from_static(alias), header_value);
}
