//! JSON-file backed `AccountStore`.
//!
//! Layout under `base_dir`:
//!
//! ```text
//! registry.json              { "default": "acct-a", "accounts": ["acct-a", "acct-b"] }
//! accounts/<name>/tokens.json   { "tokens": {...}, "last_refresh": "..." }
//! accounts/<name>/status.json   best-effort diagnostic StatusPatch snapshot
//! ```
//!
//! All writes go through a temp-file-then-rename, with 0600 permissions on
//! Unix, the same pattern used for credential persistence elsewhere in this
//! codebase.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::debug;

use crate::account_store::AccountStore;
use crate::error::{Error, Result};
use crate::types::{AccountRecord, Registry, StatusPatch, TokenFileOnDisk, TokenPair};

pub struct FileAccountStore {
    base_dir: PathBuf,
    /// Serializes writes; the pool's own per-account refresh coalescing
    /// keeps concurrent writers to the same account file rare, but the
    /// registry and status files can still be touched from multiple tasks.
    write_lock: Mutex<()>,
}

impl FileAccountStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            write_lock: Mutex::new(()),
        }
    }

    fn registry_path(&self) -> PathBuf {
        self.base_dir.join("registry.json")
    }

    fn account_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join("accounts").join(name)
    }

    fn tokens_path(account_dir: &Path) -> PathBuf {
        account_dir.join("tokens.json")
    }

    fn status_path(account_dir: &Path) -> PathBuf {
        account_dir.join("status.json")
    }
}

impl AccountStore for FileAccountStore {
    fn load_ordered_accounts(&self) -> Pin<Box<dyn Future<Output = Result<Vec<AccountRecord>>> + Send + '_>> {
        Box::pin(async move {
            let path = self.registry_path();
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                debug!(path = %path.display(), "registry not found, starting with zero accounts");
                return Ok(Vec::new());
            }

            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(e.to_string()))?;
            let registry: Registry =
                serde_json::from_str(&contents).map_err(|e| Error::RegistryParse(e.to_string()))?;

            let mut ordered: Vec<String> = Vec::with_capacity(registry.accounts.len());
            if let Some(default) = &registry.default {
                if registry.accounts.contains(default) {
                    ordered.push(default.clone());
                }
            }
            for name in &registry.accounts {
                if !ordered.contains(name) {
                    ordered.push(name.clone());
                }
            }

            Ok(ordered
                .into_iter()
                .map(|name| {
                    let account_dir = self.account_dir(&name);
                    AccountRecord { name, account_dir }
                })
                .collect())
        })
    }

    fn load_tokens<'a>(
        &'a self,
        account_dir: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<Option<TokenPair>>> + Send + 'a>> {
        Box::pin(async move {
            let path = Self::tokens_path(account_dir);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(None);
            }

            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(e.to_string()))?;
            let file: TokenFileOnDisk =
                serde_json::from_str(&contents).map_err(|e| Error::TokenParse(e.to_string()))?;
            Ok(file.into_pair())
        })
    }

    fn save_tokens<'a>(
        &'a self,
        account_dir: &'a Path,
        tokens: &'a TokenPair,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            tokio::fs::create_dir_all(account_dir)
                .await
                .map_err(|e| Error::Io(e.to_string()))?;

            let file = TokenFileOnDisk::from(tokens);
            let json = serde_json::to_string_pretty(&file)
                .map_err(|e| Error::TokenParse(e.to_string()))?;
            write_atomic(&Self::tokens_path(account_dir), json.as_bytes()).await
        })
    }

    fn record_status<'a>(
        &'a self,
        name: &'a str,
        patch: StatusPatch,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let dir = self.account_dir(name);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::Io(e.to_string()))?;

            let json =
                serde_json::to_string_pretty(&patch).map_err(|e| Error::TokenParse(e.to_string()))?;
            write_atomic(&Self::status_path(&dir), json.as_bytes()).await
        })
    }
}

/// Write `data` to `path` via temp-file-then-rename, with 0600 permissions
/// on Unix. Prevents torn reads of a partially-written token file.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("token path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("store"),
        std::process::id()
    ));

    tokio::fs::write(&tmp_path, data)
        .await
        .map_err(|e| Error::Io(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(e.to_string()))?;

    debug!(path = %path.display(), "wrote store file atomically");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenPair;

    async fn write_registry(base: &Path, default: Option<&str>, accounts: &[&str]) {
        tokio::fs::create_dir_all(base).await.unwrap();
        let registry = Registry {
            default: default.map(str::to_string),
            accounts: accounts.iter().map(|s| s.to_string()).collect(),
        };
        let json = serde_json::to_string(&registry).unwrap();
        tokio::fs::write(base.join("registry.json"), json)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_registry_yields_empty_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAccountStore::new(dir.path().to_path_buf());
        let accounts = store.load_ordered_accounts().await.unwrap();
        assert!(accounts.is_empty());
    }

    #[tokio::test]
    async fn default_account_ordered_first() {
        let dir = tempfile::tempdir().unwrap();
        write_registry(dir.path(), Some("b"), &["a", "b", "c"]).await;

        let store = FileAccountStore::new(dir.path().to_path_buf());
        let accounts = store.load_ordered_accounts().await.unwrap();
        let names: Vec<_> = accounts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn unknown_default_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_registry(dir.path(), Some("missing"), &["a", "b"]).await;

        let store = FileAccountStore::new(dir.path().to_path_buf());
        let accounts = store.load_ordered_accounts().await.unwrap();
        let names: Vec<_> = accounts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn save_then_load_roundtrips_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAccountStore::new(dir.path().to_path_buf());
        let account_dir = dir.path().join("accounts").join("acct-1");

        let pair = TokenPair::new("at_1".into(), "rt_1".into(), Some("it_1".into()), Some("acc-1".into()));
        store.save_tokens(&account_dir, &pair).await.unwrap();

        let loaded = store.load_tokens(&account_dir).await.unwrap().unwrap();
        assert_eq!(loaded.access_token.expose(), "at_1");
        assert_eq!(loaded.refresh_token.expose(), "rt_1");
        assert_eq!(loaded.id_token.unwrap().expose(), "it_1");
        assert_eq!(loaded.account_id.as_deref(), Some("acc-1"));
    }

    #[tokio::test]
    async fn load_tokens_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAccountStore::new(dir.path().to_path_buf());
        let account_dir = dir.path().join("accounts").join("ghost");
        assert!(store.load_tokens(&account_dir).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn load_tokens_missing_refresh_token_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let account_dir = dir.path().join("accounts").join("acct-1");
        tokio::fs::create_dir_all(&account_dir).await.unwrap();
        tokio::fs::write(
            account_dir.join("tokens.json"),
            r#"{"tokens":{"access_token":"at_1","refresh_token":""}}"#,
        )
        .await
        .unwrap();

        let store = FileAccountStore::new(dir.path().to_path_buf());
        assert!(store.load_tokens(&account_dir).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_status_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAccountStore::new(dir.path().to_path_buf());
        store
            .record_status(
                "acct-1",
                StatusPatch {
                    last_attempt_ms: Some(123),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let path = dir.path().join("accounts").join("acct-1").join("status.json");
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn token_file_is_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileAccountStore::new(dir.path().to_path_buf());
        let account_dir = dir.path().join("accounts").join("acct-1");
        let pair = TokenPair::new("at".into(), "rt".into(), None, None);
        store.save_tokens(&account_dir, &pair).await.unwrap();

        let metadata = tokio::fs::metadata(account_dir.join("tokens.json"))
            .await
            .unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }
}
