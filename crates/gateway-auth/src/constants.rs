//! OAuth constants for the upstream identity provider.
//!
//! These are client-identification values, not secrets — the actual
//! credentials (access/refresh tokens) live in the account store.

/// Token endpoint used for refresh. Not configurable: the gateway only
/// ever talks to this identity provider.
pub const TOKEN_ENDPOINT: &str = "https://auth.openai.com/oauth/token";

/// Default `oauth_client_id` when the operator hasn't overridden it in
/// configuration. Matches the public client id used by the Codex CLI.
pub const DEFAULT_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
