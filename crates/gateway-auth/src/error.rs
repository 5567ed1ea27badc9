//! Error types for OAuth token refresh.

/// Errors from OAuth refresh operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("token refresh request failed: {0}")]
    Http(String),

    #[error("token_refresh_failed: {0}")]
    RefreshFailed(String),

    #[error("refresh token rejected: {0}")]
    InvalidCredentials(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
