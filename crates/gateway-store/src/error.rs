//! Error types for account store operations.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("registry parse error: {0}")]
    RegistryParse(String),

    #[error("token file parse error: {0}")]
    TokenParse(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
