//! Types shared between the store adapter and its consumers (the pool, the
//! refresher). `TokenPair` is the runtime shape; `TokenFileOnDisk` is what
//! actually gets serialized — kept separate so the derived claim fields
//! never need their own (de)serialization impl.

use std::path::PathBuf;

use gateway_common::Secret;
use gateway_introspect::TokenDetails;
use serde::{Deserialize, Serialize};

/// One registered account as reported by [`crate::AccountStore::load_ordered_accounts`].
#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub name: String,
    pub account_dir: PathBuf,
}

/// Runtime token material for one account, plus claims derived from the
/// token text. Construct via [`TokenPair::new`] so the two stay in sync.
#[derive(Clone)]
pub struct TokenPair {
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    pub id_token: Option<Secret<String>>,
    pub account_id: Option<String>,
    pub details: TokenDetails,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &self.access_token)
            .field("refresh_token", &self.refresh_token)
            .field("id_token", &self.id_token)
            .field("account_id", &self.account_id)
            .field("details", &self.details)
            .finish()
    }
}

impl TokenPair {
    pub fn new(
        access_token: String,
        refresh_token: String,
        id_token: Option<String>,
        account_id: Option<String>,
    ) -> Self {
        let details = gateway_introspect::derive(&access_token, id_token.as_deref());
        Self {
            access_token: Secret::new(access_token),
            refresh_token: Secret::new(refresh_token),
            id_token: id_token.map(Secret::new),
            account_id,
            details,
        }
    }

    /// Whether the pair has non-empty access and refresh tokens. Accounts
    /// whose stored tokens fail this check are dropped from the pool at
    /// load, per contract.
    pub fn is_usable(&self) -> bool {
        !self.access_token.expose().is_empty() && !self.refresh_token.expose().is_empty()
    }
}

/// On-disk shape of the `tokens` sub-object within a per-account token file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub(crate) struct RawTokens {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
}

/// The full per-account token file: `tokens.{...}` plus a `last_refresh`
/// timestamp the store stamps on every write.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub(crate) struct TokenFileOnDisk {
    pub tokens: RawTokens,
    #[serde(default)]
    pub last_refresh: Option<String>,
}

impl From<&TokenPair> for TokenFileOnDisk {
    fn from(pair: &TokenPair) -> Self {
        TokenFileOnDisk {
            tokens: RawTokens {
                access_token: pair.access_token.expose().clone(),
                refresh_token: pair.refresh_token.expose().clone(),
                id_token: pair.id_token.as_ref().map(|s| s.expose().clone()),
                account_id: pair.account_id.clone(),
            },
            last_refresh: Some(now_rfc3339()),
        }
    }
}

impl TokenFileOnDisk {
    pub(crate) fn into_pair(self) -> Option<TokenPair> {
        let pair = TokenPair::new(
            self.tokens.access_token,
            self.tokens.refresh_token,
            self.tokens.id_token,
            self.tokens.account_id,
        );
        if pair.is_usable() { Some(pair) } else { None }
    }
}

/// Best-effort status update for the registered-account's diagnostic record.
/// Every field is optional; a patch only touches what it sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusPatch {
    #[serde(default)]
    pub last_attempt_ms: Option<i64>,
    #[serde(default)]
    pub last_success_ms: Option<i64>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub cooldown_until_ms: Option<i64>,
    #[serde(default)]
    pub consecutive_failures: Option<u32>,
}

/// Registry file listing account names in registration order with a
/// nominated default.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub(crate) struct Registry {
    pub default: Option<String>,
    pub accounts: Vec<String>,
}

/// Render the current time as an RFC3339 UTC timestamp for the
/// `last_refresh` stamp written on every token-file save.
pub(crate) fn now_rfc3339() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format_unix_secs(secs)
}

fn format_unix_secs(secs: u64) -> String {
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
