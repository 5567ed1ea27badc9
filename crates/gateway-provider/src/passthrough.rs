//! Passthrough provider: inbound headers reach the upstream unchanged
//! (besides the two hop headers the client recomputes). Used when
//! override_auth is disabled and the caller's own Authorization/Cookie
//! should simply ride through.

use std::future::Future;
use std::pin::Pin;

use reqwest::header::HeaderMap;

use crate::{AuthContext, Provider, ProviderHealth, strip_hop_headers};

#[derive(Default)]
pub struct PassthroughProvider;

impl PassthroughProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Provider for PassthroughProvider {
    fn id(&self) -> &str {
        "passthrough"
    }

    fn override_auth(&self) -> bool {
        false
    }

    fn build_headers(&self, inbound: &HeaderMap, _auth: Option<AuthContext<'_>>) -> HeaderMap {
        let mut headers = inbound.clone();
        strip_hop_headers(&mut headers);
        headers
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = ProviderHealth> + Send + '_>> {
        Box::pin(async {
            ProviderHealth {
                status: "healthy".to_string(),
                pool: None,
            }
        })
    }
}
