//! Pure parsing of JWT-shaped access/id tokens into the claims the gateway
//! cares about: expiry, session id, and ChatGPT/organization identity.
//!
//! Tokens are treated as opaque three-segment strings. Nothing here ever
//! validates a signature — the upstream is the one that will reject a bad
//! token, this crate only reads the second segment to decide which account
//! a token belongs to and whether it is about to expire.

mod claims;

pub use claims::{TokenDetails, derive, expiry, is_fresh, is_fresh_at, session_id};
