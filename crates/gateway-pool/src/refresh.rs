//! Proactive background token refresh.
//!
//! Runs independently of the request path so most accounts never hit the
//! request-time refresh branch at all. Failures here just leave the
//! account for `ensure_access_token` to retry on the next request, except
//! an invalid-refresh-token rejection, which puts the account into the
//! same cooldown an auth failure at request time would.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::pool::Pool;

/// Spawn a task that proactively refreshes any account whose access token
/// will expire within `threshold` of the current tick, every `interval`.
pub fn spawn_refresh_task(pool: Arc<Pool>, interval: Duration, threshold_s: i64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // tokens were just loaded, skip the immediate tick

        loop {
            ticker.tick().await;
            refresh_cycle(&pool, threshold_s).await;
        }
    })
}

async fn refresh_cycle(pool: &Pool, threshold_s: i64) {
    for name in pool.account_names() {
        match pool.refresh_if_stale(&name, threshold_s).await {
            RefreshCycleOutcome::Skipped => {}
            RefreshCycleOutcome::Refreshed => {
                info!(account = %name, "background token refresh succeeded");
            }
            RefreshCycleOutcome::Failed(msg) => {
                warn!(account = %name, error = %msg, "background refresh failed, will retry next cycle");
            }
        }
    }
}

pub(crate) enum RefreshCycleOutcome {
    Skipped,
    Refreshed,
    Failed(String),
}
