use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid upstream base url: {0}")]
    InvalidBaseUrl(String),
}

pub type Result<T> = std::result::Result<T, Error>;
