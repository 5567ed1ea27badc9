//! The upstream client: target URL construction and one forwarded request,
//! including its internal transient-failure retry loop. Classification of
//! the result (`ok`/`auth_failure`/`quota`/`transient`/`fatal`/`aborted`) is
//! owned here so the request router only has to react to a tag, never to
//! raw status codes.

mod error;
mod forward;
mod retry;
mod url_rewrite;

pub use error::{Error, Result};
pub use forward::{ForwardResult, fetch};
pub use retry::RetryConfig;
pub use url_rewrite::compute_target_url;
