//! Top-level error type for the gateway binary.
//!
//! Wraps each crate's own error with `#[from]` rather than re-deriving the
//! detail, so a failure keeps the context its originating layer attached.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Pool(#[from] gateway_pool::Error),

    #[error(transparent)]
    Store(#[from] gateway_store::Error),

    #[error(transparent)]
    Upstream(#[from] gateway_upstream::Error),

    #[error("failed to bind listener: {0}")]
    ListenerBind(String),
}

pub type Result<T> = std::result::Result<T, Error>;
