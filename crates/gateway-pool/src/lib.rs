//! Account pool: selection, cooldown, sticky sessions, and concurrency-safe
//! token refresh.
//!
//! The pool owns one [`state::AccountState`] per registered account and
//! exposes the primitives the request router drives: `pick`/`sticky` for
//! selection, `mark_*` for recording outcomes, and `ensure_access_token`
//! for refresh-on-demand with single-flight coalescing across concurrent
//! requests. A background task ([`spawn_refresh_task`]) refreshes tokens
//! ahead of expiry so most requests never take the request-time refresh
//! path at all.

mod error;
mod pool;
mod refresh;
mod state;
mod sticky;

pub use error::{Error, Result};
pub use pool::{AccountSnapshot, DEFAULT_AUTH_FAILURE_COOLDOWN_MS, Pool};
pub use refresh::spawn_refresh_task;
