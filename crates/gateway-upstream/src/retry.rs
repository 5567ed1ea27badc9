//! Exponential-backoff-with-jitter delay computation for transient retries.

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
}

/// Delay before retry `attempt_index` (0-indexed): `min(max, base*2^i)` plus
/// a uniform random jitter in `[0, jitter_ms)`.
pub fn backoff_delay_ms(retry: &RetryConfig, attempt_index: u32) -> u64 {
    let exp = 1u64.checked_shl(attempt_index).unwrap_or(u64::MAX);
    let backoff = retry.base_ms.saturating_mul(exp).min(retry.max_ms);
    let jitter = if retry.jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..retry.jitter_ms)
    };
    backoff + jitter
}
