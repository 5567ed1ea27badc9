//! OAuth token refresh for the gateway's upstream identity provider.
//!
//! This crate only knows how to exchange a refresh token for a new token
//! pair. It has no notion of accounts, pools, or persistence — that lives
//! in `gateway-store` and `gateway-pool`. Keeping refresh isolated here
//! means it can be exercised and tested without either of those.

pub mod constants;
pub mod error;
pub mod token;

pub use constants::{DEFAULT_CLIENT_ID, TOKEN_ENDPOINT};
pub use error::{Error, Result};
pub use token::{TokenResponse, refresh_token, refresh_token_at};
