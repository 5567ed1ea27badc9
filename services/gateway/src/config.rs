//! Configuration types and loading.
//!
//! Resolution order: built-in defaults, then the TOML config file (if
//! present), then `GATEWAY_*` environment variables, then an explicit
//! `--config` CLI flag for the file path itself. A missing file is not an
//! error; every field has a default so the gateway runs with zero
//! configuration, and any field can be pinned for a single run via its
//! environment variable without touching the file on disk.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: IpAddr,
    pub port: u16,
    pub base_url: String,
    pub oauth_client_id: String,
    pub cooldown_seconds: u64,
    pub max_retry_passes: u32,
    pub request_timeout_ms: u64,
    pub upstream_max_retries: u32,
    pub upstream_retry_base_ms: u64,
    pub upstream_retry_max_ms: u64,
    pub upstream_retry_jitter_ms: u64,
    pub override_auth: bool,
    pub auth_failure_cooldown_ms: i64,
    pub account_store_path: PathBuf,
    pub refresh_interval_secs: u64,
    pub refresh_threshold_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([127, 0, 0, 1]),
            port: 4319,
            base_url: "https://chatgpt.com/backend-api/codex".to_string(),
            oauth_client_id: gateway_auth::DEFAULT_CLIENT_ID.to_string(),
            cooldown_seconds: 900,
            max_retry_passes: 1,
            request_timeout_ms: 120_000,
            upstream_max_retries: 2,
            upstream_retry_base_ms: 200,
            upstream_retry_max_ms: 2_000,
            upstream_retry_jitter_ms: 120,
            override_auth: true,
            auth_failure_cooldown_ms: gateway_pool::DEFAULT_AUTH_FAILURE_COOLDOWN_MS,
            account_store_path: default_account_store_path(),
            refresh_interval_secs: 300,
            refresh_threshold_secs: 600,
        }
    }
}

/// Parse an environment variable into `*field` when present. A set but
/// unparseable value is a configuration error rather than a silently
/// ignored override — an operator who set `GATEWAY_PORT=notaport` almost
/// certainly wants to know.
fn set_from_env<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    field: &mut T,
) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(name) else {
        return Ok(());
    };
    *field = value
        .parse()
        .map_err(|e| Error::Config(format!("{name}={value:?} is invalid: {e}")))?;
    Ok(())
}

fn set_from_env_string(lookup: &impl Fn(&str) -> Option<String>, name: &str, field: &mut String) {
    if let Some(value) = lookup(name) {
        *field = value;
    }
}

/// The shipped store adapter lays its registry and per-account token files
/// out under a base directory (see `gateway_store::FileAccountStore`), so
/// this is a directory path despite the singular name in the option table.
fn default_account_store_path() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".codex-gateway")
}

impl Config {
    /// Resolve the config file path: the CLI flag wins, otherwise the
    /// well-known default location under the user's home directory.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(path) = cli_path {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".codex-gateway")
            .join("config.toml")
    }

    /// Load configuration from `path`, then apply any `GATEWAY_*`
    /// environment variable overrides on top. A missing file yields
    /// built-in defaults; a present-but-invalid file surfaces the `toml`
    /// crate's own line/column diagnostics rather than panicking.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(Error::Config(format!("failed to read {}: {e}", path.display()))),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Overlay `GATEWAY_*` environment variables onto an already-loaded
    /// config. Takes a lookup closure rather than calling `std::env::var`
    /// directly so tests can supply a fixed map instead of mutating the
    /// process environment.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        set_from_env(&lookup, "GATEWAY_BIND_ADDRESS", &mut self.bind_address)?;
        set_from_env(&lookup, "GATEWAY_PORT", &mut self.port)?;
        set_from_env_string(&lookup, "GATEWAY_BASE_URL", &mut self.base_url);
        set_from_env_string(&lookup, "GATEWAY_OAUTH_CLIENT_ID", &mut self.oauth_client_id);
        set_from_env(&lookup, "GATEWAY_COOLDOWN_SECONDS", &mut self.cooldown_seconds)?;
        set_from_env(&lookup, "GATEWAY_MAX_RETRY_PASSES", &mut self.max_retry_passes)?;
        set_from_env(&lookup, "GATEWAY_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms)?;
        set_from_env(&lookup, "GATEWAY_UPSTREAM_MAX_RETRIES", &mut self.upstream_max_retries)?;
        set_from_env(&lookup, "GATEWAY_UPSTREAM_RETRY_BASE_MS", &mut self.upstream_retry_base_ms)?;
        set_from_env(&lookup, "GATEWAY_UPSTREAM_RETRY_MAX_MS", &mut self.upstream_retry_max_ms)?;
        set_from_env(&lookup, "GATEWAY_UPSTREAM_RETRY_JITTER_MS", &mut self.upstream_retry_jitter_ms)?;
        set_from_env(&lookup, "GATEWAY_OVERRIDE_AUTH", &mut self.override_auth)?;
        set_from_env(&lookup, "GATEWAY_AUTH_FAILURE_COOLDOWN_MS", &mut self.auth_failure_cooldown_ms)?;
        if let Some(value) = lookup("GATEWAY_ACCOUNT_STORE_PATH") {
            self.account_store_path = PathBuf::from(value);
        }
        set_from_env(&lookup, "GATEWAY_REFRESH_INTERVAL_SECS", &mut self.refresh_interval_secs)?;
        set_from_env(&lookup, "GATEWAY_REFRESH_THRESHOLD_SECS", &mut self.refresh_threshold_secs)?;
        Ok(())
    }

    pub fn retry_config(&self) -> gateway_upstream::RetryConfig {
        gateway_upstream::RetryConfig {
            max_retries: self.upstream_max_retries,
            base_ms: self.upstream_retry_base_ms,
            max_ms: self.upstream_retry_max_ms,
            jitter_ms: self.upstream_retry_jitter_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(config.port, 4319);
        assert_eq!(config.bind_address, IpAddr::from([127, 0, 0, 1]));
        assert!(config.override_auth);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = 9000\ncooldown_seconds = 60\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.cooldown_seconds, 60);
        // Untouched fields keep their defaults.
        assert_eq!(config.max_retry_passes, 1);
        assert_eq!(config.base_url, "https://chatgpt.com/backend-api/codex");
    }

    #[test]
    fn invalid_toml_surfaces_parse_error_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = [not valid").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn resolve_path_prefers_explicit_cli_flag() {
        let resolved = Config::resolve_path(Some("/tmp/custom.toml"));
        assert_eq!(resolved, PathBuf::from("/tmp/custom.toml"));
    }

    fn env_map(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: Vec<(String, String)> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| pairs.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
    }

    #[test]
    fn env_override_wins_over_toml_and_defaults() {
        let mut config = Config { port: 9000, ..Config::default() };
        config
            .apply_env_overrides(env_map(&[("GATEWAY_PORT", "8080"), ("GATEWAY_COOLDOWN_SECONDS", "30")]))
            .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.cooldown_seconds, 30);
    }

    #[test]
    fn env_override_absent_keeps_existing_value() {
        let mut config = Config::default();
        config.apply_env_overrides(env_map(&[])).unwrap();
        assert_eq!(config.port, 4319);
    }

    #[test]
    fn invalid_env_override_surfaces_as_config_error() {
        let mut config = Config::default();
        let err = config.apply_env_overrides(env_map(&[("GATEWAY_PORT", "not-a-port")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_override_sets_account_store_path() {
        let mut config = Config::default();
        config.apply_env_overrides(env_map(&[("GATEWAY_ACCOUNT_STORE_PATH", "/tmp/custom-accounts")])).unwrap();
        assert_eq!(config.account_store_path, PathBuf::from("/tmp/custom-accounts"));
    }

    #[test]
    fn env_override_parses_bool_field() {
        let mut config = Config::default();
        config.apply_env_overrides(env_map(&[("GATEWAY_OVERRIDE_AUTH", "false")])).unwrap();
        assert!(!config.override_auth);
    }
}
