//! The `AccountStore` trait consumed by the pool. Dyn-compatible via manual
//! boxed futures so the pool can hold an `Arc<dyn AccountStore>` without
//! committing to a concrete backing adapter.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::error::Result;
use crate::types::{AccountRecord, StatusPatch, TokenPair};

pub trait AccountStore: Send + Sync {
    /// Registered account names and their directories, default-first then
    /// remaining accounts in their registered order.
    fn load_ordered_accounts(&self) -> Pin<Box<dyn Future<Output = Result<Vec<AccountRecord>>> + Send + '_>>;

    /// Current token material for one account. `Ok(None)` covers both "no
    /// file yet" and "file present but unusable" (missing access/refresh
    /// token) — either way the account is dropped from the pool at load.
    fn load_tokens<'a>(
        &'a self,
        account_dir: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TokenPair>>> + Send + 'a>>;

    /// Persist new tokens for an account. Implementations must write
    /// atomically (temp file + rename) since this races with process
    /// restarts and admin-side tooling reading the same file.
    fn save_tokens<'a>(
        &'a self,
        account_dir: &'a Path,
        tokens: &'a TokenPair,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Best-effort diagnostic write. Callers must never fail a request
    /// because this errored — the pool only logs a failure here.
    fn record_status<'a>(
        &'a self,
        name: &'a str,
        patch: StatusPatch,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}
