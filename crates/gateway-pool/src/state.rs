//! Per-account mutable state held by the pool.

use std::path::PathBuf;
use std::sync::Mutex as SyncMutex;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use gateway_store::TokenPair;
use tokio::sync::RwLock;

/// One registered account's live state. Cheap fields (cooldown deadline,
/// failure counter) are plain atomics so selection can read them without
/// awaiting a lock; `tokens` needs a lock since it's replaced wholesale on
/// refresh.
pub(crate) struct AccountState {
    pub name: String,
    pub account_dir: PathBuf,
    pub tokens: RwLock<TokenPair>,
    /// 0 means "no cooldown". Unix millis otherwise.
    cooldown_until_ms: AtomicI64,
    consecutive_failures: AtomicU32,
    last_error: SyncMutex<Option<String>>,
}

impl AccountState {
    pub fn new(name: String, account_dir: PathBuf, tokens: TokenPair) -> Self {
        Self {
            name,
            account_dir,
            tokens: RwLock::new(tokens),
            cooldown_until_ms: AtomicI64::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_error: SyncMutex::new(None),
        }
    }

    pub fn cooldown_until_ms(&self) -> i64 {
        self.cooldown_until_ms.load(Ordering::Acquire)
    }

    pub fn is_eligible(&self, now_ms: i64) -> bool {
        self.cooldown_until_ms() <= now_ms
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn mark_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.cooldown_until_ms.store(0, Ordering::Release);
        *self.last_error.lock().unwrap() = None;
    }

    /// Move the cooldown deadline forward, never backward, per the
    /// monotonicity invariant for a single account within one incident.
    pub fn extend_cooldown(&self, until_ms: i64, reason: String) {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
        *self.last_error.lock().unwrap() = Some(reason);
        self.cooldown_until_ms
            .fetch_max(until_ms, Ordering::AcqRel);
    }

    pub fn reset_after_refresh(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.cooldown_until_ms.store(0, Ordering::Release);
        *self.last_error.lock().unwrap() = None;
    }
}

/// Current wall clock as unix milliseconds.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
