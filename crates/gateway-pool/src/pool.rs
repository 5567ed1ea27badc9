//! The account pool: selection, cooldown state, and refresh coalescing.
//!
//! Account order is fixed at load time (default account first, then
//! registration order) and never changes afterwards — accounts are neither
//! added nor removed at runtime, since the admin surface that would do that
//! is a separate product mode. Only each account's status (cooldown,
//! failure count, tokens) mutates.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::Shared;
use gateway_store::{AccountStore, StatusPatch, TokenPair};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::state::{AccountState, now_ms};
use crate::sticky::StickyTable;

/// Buffer within which a token is considered "about to expire" and must be
/// refreshed before use, per the freshness contract.
const FRESH_BUFFER_S: i64 = 90;

/// Default penalty box for auth failures, used when the caller doesn't
/// override it via [`Pool::load`].
pub const DEFAULT_AUTH_FAILURE_COOLDOWN_MS: i64 = 60_000;

type RefreshOutcome = std::result::Result<String, String>;
type SharedRefresh = Shared<Pin<Box<dyn Future<Output = RefreshOutcome> + Send>>>;

/// A read-only view of an account's current token material, for header
/// construction by the request router.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub name: String,
    pub access_token: String,
    pub id_token: Option<String>,
    pub session_id: Option<String>,
    pub account_id: Option<String>,
    pub chatgpt_account_id: Option<String>,
    pub chatgpt_user_id: Option<String>,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
}

pub struct Pool {
    accounts: Vec<Arc<AccountState>>,
    index: HashMap<String, usize>,
    sticky: StickyTable,
    refreshes: Mutex<HashMap<String, SharedRefresh>>,
    store: Arc<dyn AccountStore>,
    http_client: reqwest::Client,
    client_id: String,
    auth_failure_cooldown_ms: i64,
    token_endpoint: String,
}

impl Pool {
    /// Load the pool from the account store. Accounts whose token file is
    /// missing or unusable (no access/refresh token) are dropped with a
    /// warning rather than failing the whole load.
    ///
    /// `auth_failure_cooldown_ms` is the penalty applied by
    /// [`Pool::mark_auth_failure`]; pass [`DEFAULT_AUTH_FAILURE_COOLDOWN_MS`]
    /// to keep the built-in default.
    pub async fn load(
        store: Arc<dyn AccountStore>,
        http_client: reqwest::Client,
        client_id: String,
        auth_failure_cooldown_ms: i64,
    ) -> Result<Self> {
        Self::load_inner(
            store,
            http_client,
            client_id,
            auth_failure_cooldown_ms,
            gateway_auth::TOKEN_ENDPOINT.to_string(),
        )
        .await
    }

    /// Same as [`Pool::load`] but against an explicit token endpoint, so
    /// tests can point refreshes at a local mock instead of the real
    /// identity provider.
    async fn load_inner(
        store: Arc<dyn AccountStore>,
        http_client: reqwest::Client,
        client_id: String,
        auth_failure_cooldown_ms: i64,
        token_endpoint: String,
    ) -> Result<Self> {
        let records = store
            .load_ordered_accounts()
            .await
            .map_err(|e| Error::Store(e.to_string()))?;

        let mut accounts = Vec::with_capacity(records.len());
        let mut index = HashMap::with_capacity(records.len());

        for record in records {
            let tokens = store
                .load_tokens(&record.account_dir)
                .await
                .map_err(|e| Error::Store(e.to_string()))?;

            let Some(tokens) = tokens else {
                warn!(account = %record.name, "dropping account: no usable tokens at load");
                continue;
            };

            index.insert(record.name.clone(), accounts.len());
            accounts.push(Arc::new(AccountState::new(record.name, record.account_dir, tokens)));
        }

        info!(accounts = accounts.len(), "pool loaded");

        Ok(Self {
            accounts,
            index,
            sticky: StickyTable::new(),
            refreshes: Mutex::new(HashMap::new()),
            store,
            http_client,
            client_id,
            auth_failure_cooldown_ms,
            token_endpoint,
        })
    }

    pub fn size(&self) -> usize {
        self.accounts.len()
    }

    fn state_for(&self, name: &str) -> Option<&Arc<AccountState>> {
        self.index.get(name).map(|&i| &self.accounts[i])
    }

    /// First eligible account in registered order, skipping `excluded`.
    pub fn pick(&self, excluded: &HashSet<String>) -> Option<String> {
        let now = now_ms();
        self.accounts
            .iter()
            .find(|a| !excluded.contains(&a.name) && a.is_eligible(now))
            .map(|a| a.name.clone())
    }

    /// The sticky assignment for a session key, if it still points to a
    /// present, non-excluded, eligible account.
    pub async fn sticky(&self, session_key: &str, excluded: &HashSet<String>) -> Option<String> {
        let name = self.sticky.get(session_key).await?;
        let state = self.state_for(&name)?;
        if excluded.contains(&name) || !state.is_eligible(now_ms()) {
            return None;
        }
        Some(name)
    }

    pub async fn assign(&self, session_key: &str, account_name: &str) {
        self.sticky.assign(session_key, account_name).await;
    }

    pub async fn clear_assignment(&self, session_key: &str) {
        self.sticky.clear(session_key).await;
    }

    /// Best-effort attempt-timestamp notification. Never surfaces an error
    /// to the caller.
    pub async fn mark_attempt(&self, account_name: &str) {
        let patch = StatusPatch {
            last_attempt_ms: Some(now_ms()),
            ..Default::default()
        };
        if let Err(e) = self.store.record_status(account_name, patch).await {
            debug!(account = account_name, error = %e, "failed to record attempt status");
        }
    }

    pub async fn mark_success(&self, account_name: &str) {
        if let Some(state) = self.state_for(account_name) {
            state.mark_success();
        }
        let patch = StatusPatch {
            last_success_ms: Some(now_ms()),
            consecutive_failures: Some(0),
            ..Default::default()
        };
        if let Err(e) = self.store.record_status(account_name, patch).await {
            debug!(account = account_name, error = %e, "failed to record success status");
        }
    }

    /// `resets_at_ms`, if given and in the future, wins over the configured
    /// flat cooldown.
    pub async fn mark_quota(&self, account_name: &str, cooldown_s: u64, resets_at_ms: Option<i64>) {
        let now = now_ms();
        let until = match resets_at_ms {
            Some(t) if t > now => t,
            _ => now + (cooldown_s as i64) * 1000,
        };

        let mut failures = None;
        if let Some(state) = self.state_for(account_name) {
            state.extend_cooldown(until, "usage_limit_reached".into());
            failures = Some(state.consecutive_failures());
        }

        let patch = StatusPatch {
            last_error: Some("usage_limit_reached".into()),
            cooldown_until_ms: Some(until),
            consecutive_failures: failures,
            ..Default::default()
        };
        if let Err(e) = self.store.record_status(account_name, patch).await {
            debug!(account = account_name, error = %e, "failed to record quota status");
        }
    }

    pub async fn mark_auth_failure(&self, account_name: &str, reason: &str) {
        let now = now_ms();
        let until = now + self.auth_failure_cooldown_ms;

        let mut failures = None;
        if let Some(state) = self.state_for(account_name) {
            state.extend_cooldown(until, reason.to_string());
            failures = Some(state.consecutive_failures());
        }

        let patch = StatusPatch {
            last_error: Some(reason.to_string()),
            cooldown_until_ms: Some(until),
            consecutive_failures: failures,
            ..Default::default()
        };
        if let Err(e) = self.store.record_status(account_name, patch).await {
            debug!(account = account_name, error = %e, "failed to record auth failure status");
        }
    }

    /// Replace an account's tokens after a successful refresh. In-memory
    /// state updates unconditionally; persistence failures are logged, not
    /// propagated — the caller already has a usable access token.
    pub async fn update_tokens(&self, account_name: &str, new_tokens: TokenPair) {
        let Some(state) = self.state_for(account_name) else {
            warn!(account = account_name, "update_tokens for unknown account");
            return;
        };

        if let Err(e) = self.store.save_tokens(&state.account_dir, &new_tokens).await {
            warn!(account = account_name, error = %e, "failed to persist refreshed tokens");
        }

        *state.tokens.write().await = new_tokens;
        state.reset_after_refresh();
    }

    /// A fresh access token for the account, refreshing if necessary.
    /// Concurrent callers for the same account share one refresh.
    pub async fn ensure_access_token(&self, account_name: &str) -> Result<String> {
        let state = self
            .state_for(account_name)
            .ok_or_else(|| Error::NotFound(account_name.to_string()))?
            .clone();

        {
            let tokens = state.tokens.read().await;
            if gateway_introspect::is_fresh(tokens.details.expires_at, FRESH_BUFFER_S) {
                return Ok(tokens.access_token.expose().clone());
            }
        }

        self.refresh_coalesced(account_name, state).await
    }

    /// Account names in pool order (default-first, then registration
    /// order). Used by the proactive refresh cycle to scan every account.
    pub fn account_names(&self) -> Vec<String> {
        self.accounts.iter().map(|a| a.name.clone()).collect()
    }

    /// Refresh an account's token if it is within `threshold_s` of expiry,
    /// regardless of the tighter request-time freshness buffer. Used by the
    /// background refresh task so accounts renew before a request would
    /// ever need to.
    pub(crate) async fn refresh_if_stale(
        &self,
        account_name: &str,
        threshold_s: i64,
    ) -> crate::refresh::RefreshCycleOutcome {
        use crate::refresh::RefreshCycleOutcome;

        let Some(state) = self.state_for(account_name).cloned() else {
            return RefreshCycleOutcome::Skipped;
        };

        let stale = {
            let tokens = state.tokens.read().await;
            !gateway_introspect::is_fresh(tokens.details.expires_at, threshold_s)
        };
        if !stale {
            return RefreshCycleOutcome::Skipped;
        }

        match self.refresh_coalesced(account_name, state).await {
            Ok(_) => RefreshCycleOutcome::Refreshed,
            Err(e) => RefreshCycleOutcome::Failed(e.to_string()),
        }
    }

    async fn refresh_coalesced(&self, account_name: &str, state: Arc<AccountState>) -> Result<String> {
        let shared = {
            let mut refreshes = self.refreshes.lock().await;
            if let Some(existing) = refreshes.get(account_name) {
                existing.clone()
            } else {
                let fut = build_refresh_future(
                    state,
                    self.store.clone(),
                    self.http_client.clone(),
                    self.client_id.clone(),
                    self.token_endpoint.clone(),
                );
                let shared: SharedRefresh = fut.shared();
                refreshes.insert(account_name.to_string(), shared.clone());
                shared
            }
        };

        let result = shared.await;
        self.refreshes.lock().await.remove(account_name);
        result.map_err(Error::RefreshFailed)
    }

    pub async fn snapshot(&self, account_name: &str) -> Option<AccountSnapshot> {
        let state = self.state_for(account_name)?;
        let tokens = state.tokens.read().await;
        Some(AccountSnapshot {
            name: state.name.clone(),
            access_token: tokens.access_token.expose().clone(),
            id_token: tokens.id_token.as_ref().map(|s| s.expose().clone()),
            session_id: tokens.details.session_id.clone(),
            account_id: tokens.account_id.clone(),
            chatgpt_account_id: tokens.details.chatgpt_account_id.clone(),
            chatgpt_user_id: tokens.details.chatgpt_user_id.clone(),
            user_id: tokens.details.user_id.clone(),
            organization_id: tokens.details.organization_id.clone(),
        })
    }

    /// Summary for the `/health` endpoint.
    pub async fn health(&self) -> serde_json::Value {
        let now = now_ms();
        let mut accounts = Vec::with_capacity(self.accounts.len());
        let mut available = 0usize;

        for state in &self.accounts {
            let eligible = state.is_eligible(now);
            if eligible {
                available += 1;
            }
            accounts.push(serde_json::json!({
                "name": state.name,
                "status": if eligible { "available" } else { "cooling_down" },
                "consecutive_failures": state.consecutive_failures(),
                "last_error": state.last_error(),
            }));
        }

        let total = self.accounts.len();
        let status = if total == 0 {
            "unhealthy"
        } else if available == total {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "accounts_total": total,
            "accounts_available": available,
            "accounts": accounts,
        })
    }
}

/// Build the 'static refresh future for one account. Captures only owned
/// handles so it can be driven by any of the concurrent callers that race
/// to poll the `Shared` wrapper.
fn build_refresh_future(
    state: Arc<AccountState>,
    store: Arc<dyn AccountStore>,
    http_client: reqwest::Client,
    client_id: String,
    token_endpoint: String,
) -> Pin<Box<dyn Future<Output = RefreshOutcome> + Send>> {
    Box::pin(async move {
        let refresh_token = {
            let tokens = state.tokens.read().await;
            tokens.refresh_token.expose().clone()
        };

        let response = gateway_auth::refresh_token_at(&http_client, &token_endpoint, &refresh_token, &client_id)
            .await
            .map_err(|e| e.to_string())?;

        let new_tokens = TokenPair::new(
            response.access_token.clone(),
            response.refresh_token,
            response.id_token,
            response.account_id,
        );

        if let Err(e) = store.save_tokens(&state.account_dir, &new_tokens).await {
            warn!(account = %state.name, error = %e, "failed to persist refreshed tokens");
        }

        let access_token = new_tokens.access_token.expose().clone();
        *state.tokens.write().await = new_tokens;
        state.reset_after_refresh();

        Ok(access_token)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::mock_token_endpoint;
    use super::*;
    use gateway_store::FileAccountStore;

    async fn write_account(base: &std::path::Path, name: &str, refresh: &str, access_expiry_s: i64) {
        let registry_path = base.join("registry.json");
        let mut registry: serde_json::Value = if registry_path.exists() {
            serde_json::from_str(&tokio::fs::read_to_string(&registry_path).await.unwrap()).unwrap()
        } else {
            serde_json::json!({"default": name, "accounts": []})
        };
        registry["accounts"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::json!(name));
        tokio::fs::write(&registry_path, serde_json::to_string(&registry).unwrap())
            .await
            .unwrap();

        let account_dir = base.join("accounts").join(name);
        tokio::fs::create_dir_all(&account_dir).await.unwrap();

        let header = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            br#"{"alg":"none"}"#,
        );
        let claims = format!(r#"{{"exp":{access_expiry_s}}}"#);
        let claims_b64 =
            base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, claims);
        let access_token = format!("{header}.{claims_b64}.sig");

        let tokens_json = serde_json::json!({
            "tokens": {
                "access_token": access_token,
                "refresh_token": refresh,
            }
        });
        tokio::fs::write(
            account_dir.join("tokens.json"),
            serde_json::to_string(&tokens_json).unwrap(),
        )
        .await
        .unwrap();
    }

    fn far_future_epoch_s() -> i64 {
        4_102_444_800 // year 2100, seconds
    }

    fn past_epoch_s() -> i64 {
        1_000_000
    }

    #[tokio::test]
    async fn pick_returns_default_first() {
        let dir = tempfile::tempdir().unwrap();
        write_account(dir.path(), "a", "rt_a", far_future_epoch_s()).await;
        write_account(dir.path(), "b", "rt_b", far_future_epoch_s()).await;

        let store = Arc::new(FileAccountStore::new(dir.path().to_path_buf()));
        let pool = Pool::load(store, reqwest::Client::new(), "client-id".into(), DEFAULT_AUTH_FAILURE_COOLDOWN_MS)
            .await
            .unwrap();

        assert_eq!(pool.pick(&HashSet::new()), Some("a".to_string()));
    }

    #[tokio::test]
    async fn pick_skips_excluded() {
        let dir = tempfile::tempdir().unwrap();
        write_account(dir.path(), "a", "rt_a", far_future_epoch_s()).await;
        write_account(dir.path(), "b", "rt_b", far_future_epoch_s()).await;

        let store = Arc::new(FileAccountStore::new(dir.path().to_path_buf()));
        let pool = Pool::load(store, reqwest::Client::new(), "client-id".into(), DEFAULT_AUTH_FAILURE_COOLDOWN_MS)
            .await
            .unwrap();

        let mut excluded = HashSet::new();
        excluded.insert("a".to_string());
        assert_eq!(pool.pick(&excluded), Some("b".to_string()));
    }

    #[tokio::test]
    async fn accounts_missing_refresh_token_are_dropped_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let account_dir = dir.path().join("accounts").join("a");
        tokio::fs::create_dir_all(&account_dir).await.unwrap();
        tokio::fs::write(
            account_dir.join("tokens.json"),
            r#"{"tokens":{"access_token":"at","refresh_token":""}}"#,
        )
        .await
        .unwrap();
        tokio::fs::write(
            dir.path().join("registry.json"),
            r#"{"default":"a","accounts":["a"]}"#,
        )
        .await
        .unwrap();

        let store = Arc::new(FileAccountStore::new(dir.path().to_path_buf()));
        let pool = Pool::load(store, reqwest::Client::new(), "client-id".into(), DEFAULT_AUTH_FAILURE_COOLDOWN_MS)
            .await
            .unwrap();

        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn mark_quota_sets_cooldown_from_resets_at() {
        let dir = tempfile::tempdir().unwrap();
        write_account(dir.path(), "a", "rt_a", far_future_epoch_s()).await;

        let store = Arc::new(FileAccountStore::new(dir.path().to_path_buf()));
        let pool = Pool::load(store, reqwest::Client::new(), "client-id".into(), DEFAULT_AUTH_FAILURE_COOLDOWN_MS)
            .await
            .unwrap();

        let resets_at = now_ms() + 500_000;
        pool.mark_quota("a", 900, Some(resets_at)).await;

        let empty = HashSet::new();
        assert_eq!(pool.pick(&empty), None);
    }

    #[tokio::test]
    async fn mark_quota_falls_back_to_flat_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        write_account(dir.path(), "a", "rt_a", far_future_epoch_s()).await;

        let store = Arc::new(FileAccountStore::new(dir.path().to_path_buf()));
        let pool = Pool::load(store, reqwest::Client::new(), "client-id".into(), DEFAULT_AUTH_FAILURE_COOLDOWN_MS)
            .await
            .unwrap();

        pool.mark_quota("a", 900, None).await;
        assert_eq!(pool.pick(&HashSet::new()), None);
    }

    #[tokio::test]
    async fn mark_success_clears_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        write_account(dir.path(), "a", "rt_a", far_future_epoch_s()).await;

        let store = Arc::new(FileAccountStore::new(dir.path().to_path_buf()));
        let pool = Pool::load(store, reqwest::Client::new(), "client-id".into(), DEFAULT_AUTH_FAILURE_COOLDOWN_MS)
            .await
            .unwrap();

        pool.mark_quota("a", 900, None).await;
        pool.mark_success("a").await;
        assert_eq!(pool.pick(&HashSet::new()), Some("a".to_string()));
    }

    #[tokio::test]
    async fn sticky_routes_to_assigned_account() {
        let dir = tempfile::tempdir().unwrap();
        write_account(dir.path(), "a", "rt_a", far_future_epoch_s()).await;
        write_account(dir.path(), "b", "rt_b", far_future_epoch_s()).await;

        let store = Arc::new(FileAccountStore::new(dir.path().to_path_buf()));
        let pool = Pool::load(store, reqwest::Client::new(), "client-id".into(), DEFAULT_AUTH_FAILURE_COOLDOWN_MS)
            .await
            .unwrap();

        pool.assign("session-1", "b").await;
        let empty = HashSet::new();
        assert_eq!(pool.sticky("session-1", &empty).await, Some("b".to_string()));
    }

    #[tokio::test]
    async fn sticky_excluded_for_current_request_is_none() {
        let dir = tempfile::tempdir().unwrap();
        write_account(dir.path(), "a", "rt_a", far_future_epoch_s()).await;

        let store = Arc::new(FileAccountStore::new(dir.path().to_path_buf()));
        let pool = Pool::load(store, reqwest::Client::new(), "client-id".into(), DEFAULT_AUTH_FAILURE_COOLDOWN_MS)
            .await
            .unwrap();

        pool.assign("session-1", "a").await;
        let mut excluded = HashSet::new();
        excluded.insert("a".to_string());
        assert_eq!(pool.sticky("session-1", &excluded).await, None);
    }

    #[tokio::test]
    async fn ensure_access_token_returns_current_token_when_fresh() {
        let dir = tempfile::tempdir().unwrap();
        write_account(dir.path(), "a", "rt_a", far_future_epoch_s()).await;

        let store = Arc::new(FileAccountStore::new(dir.path().to_path_buf()));
        let pool = Pool::load(store, reqwest::Client::new(), "client-id".into(), DEFAULT_AUTH_FAILURE_COOLDOWN_MS)
            .await
            .unwrap();

        let token = pool.ensure_access_token("a").await.unwrap();
        assert!(!token.is_empty());
    }

    #[tokio::test]
    async fn ensure_access_token_coalesces_concurrent_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        write_account(dir.path(), "a", "rt_a", past_epoch_s()).await;

        let (endpoint, token_endpoint_state) = mock_token_endpoint::spawn(401, r#"{"error":"invalid_grant"}"#).await;

        let store = Arc::new(FileAccountStore::new(dir.path().to_path_buf()));
        let pool = Arc::new(
            Pool::load_inner(
                store,
                reqwest::Client::new(),
                "client-id".into(),
                DEFAULT_AUTH_FAILURE_COOLDOWN_MS,
                endpoint,
            )
            .await
            .unwrap(),
        );

        // Stale token triggers a refresh against the mock endpoint, which
        // always rejects. What matters here is that all concurrent callers
        // observe the same outcome and the endpoint is hit exactly once,
        // not once per caller.
        let mut handles = Vec::new();
        for _ in 0..5 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.ensure_access_token("a").await.is_err() }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        assert!(results.iter().all(|&failed| failed == results[0]));
        assert_eq!(token_endpoint_state.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn snapshot_reflects_current_tokens() {
        let dir = tempfile::tempdir().unwrap();
        write_account(dir.path(), "a", "rt_a", far_future_epoch_s()).await;

        let store = Arc::new(FileAccountStore::new(dir.path().to_path_buf()));
        let pool = Pool::load(store, reqwest::Client::new(), "client-id".into(), DEFAULT_AUTH_FAILURE_COOLDOWN_MS)
            .await
            .unwrap();

        let snap = pool.snapshot("a").await.unwrap();
        assert_eq!(snap.name, "a");
        assert!(!snap.access_token.is_empty());
    }

    #[tokio::test]
    async fn health_reports_status() {
        let dir = tempfile::tempdir().unwrap();
        write_account(dir.path(), "a", "rt_a", far_future_epoch_s()).await;

        let store = Arc::new(FileAccountStore::new(dir.path().to_path_buf()));
        let pool = Pool::load(store, reqwest::Client::new(), "client-id".into(), DEFAULT_AUTH_FAILURE_COOLDOWN_MS)
            .await
            .unwrap();

        let health = pool.health().await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["accounts_total"], 1);
    }
}
