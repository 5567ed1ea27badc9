//! Common types shared across the gateway's crates: a redacting wrapper
//! for sensitive values.

mod secret;

pub use secret::Secret;
