//! Token cache and refresh serialization. One mutex per account: concurrent
//! callers for the same account coalesce on a single refresh outcome while
//! different accounts refresh in parallel. Cache entries live in memory and
//! in one JSON file per account (mode 0600) under the cache directory.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::models::{Account, AccountType, TokenCacheEntry};
use crate::store::Store;
use crate::token::refresh::{jwt_expiry, refresh_credentials};

pub struct TokenManager {
    store: Arc<Store>,
    http: reqwest::Client,
    cache_dir: PathBuf,
    memory: DashMap<String, TokenCacheEntry>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl TokenManager {
    pub fn new(store: Arc<Store>, cache_dir: PathBuf) -> ProxyResult<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            store,
            http,
            cache_dir,
            memory: DashMap::new(),
            locks: DashMap::new(),
        })
    }

    fn lock_for(&self, account_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn cache_path(&self, account_id: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", account_id))
    }

    fn load_cache_file(&self, account_id: &str) -> Option<TokenCacheEntry> {
        let raw = std::fs::read_to_string(self.cache_path(account_id)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn write_cache_file(&self, account_id: &str, entry: &TokenCacheEntry) {
        let path = self.cache_path(account_id);
        let payload = match serde_json::to_string(entry) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("[Token] failed to serialize cache entry for {}: {}", account_id, e);
                return;
            }
        };
        #[cfg(unix)]
        let result = {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)
                .and_then(|mut f| f.write_all(payload.as_bytes()))
        };
        #[cfg(not(unix))]
        let result = std::fs::write(&path, payload);
        if let Err(e) = result {
            warn!("[Token] failed to persist cache file for {}: {}", account_id, e);
        }
    }

    fn fresh_entry(&self, account_id: &str, now: i64) -> Option<TokenCacheEntry> {
        if let Some(entry) = self.memory.get(account_id) {
            if !entry.is_expired(now) {
                return Some(entry.clone());
            }
        }
        if let Some(entry) = self.load_cache_file(account_id) {
            if !entry.is_expired(now) {
                self.memory.insert(account_id.to_string(), entry.clone());
                return Some(entry);
            }
        }
        None
    }

    /// Returns an access token with at least five minutes of remaining life,
    /// refreshing if needed.
    pub async fn get_valid_token(&self, account: &Account) -> ProxyResult<String> {
        // Custom-API accounts carry a static key in client_secret.
        if account.account_type == AccountType::CustomApi {
            return Ok(account.client_secret.clone());
        }

        let now = chrono::Utc::now().timestamp();
        if let Some(entry) = self.fresh_entry(&account.id, now) {
            return Ok(entry.access_token);
        }

        let lock = self.lock_for(&account.id);
        let _guard = lock.lock().await;

        // Whoever held the lock before us may already have refreshed.
        let now = chrono::Utc::now().timestamp();
        if let Some(entry) = self.fresh_entry(&account.id, now) {
            return Ok(entry.access_token);
        }

        let entry = self.refresh_locked(account).await?;
        Ok(entry.access_token)
    }

    /// Refresh regardless of cache state (admin-triggered or after an
    /// upstream reported the token invalid). Serialized per account.
    pub async fn force_refresh(&self, account: &Account) -> ProxyResult<TokenCacheEntry> {
        let lock = self.lock_for(&account.id);
        let _guard = lock.lock().await;
        self.refresh_locked(account).await
    }

    async fn refresh_locked(&self, account: &Account) -> ProxyResult<TokenCacheEntry> {
        // Use the latest refresh token; a previous rotation may have
        // invalidated the one on the caller's account snapshot.
        let mut refresh_account = account.clone();
        if let Some(current) = self.store.get_account(&account.id).await? {
            refresh_account.refresh_token = current.refresh_token;
            refresh_account.client_id = current.client_id;
            refresh_account.client_secret = current.client_secret;
        }

        debug!("[Token] refreshing access token for account {}", account.id);
        let outcome = match refresh_credentials(&self.http, &refresh_account).await {
            Ok(outcome) => outcome,
            Err(reason) => {
                if let Err(e) = self.store.mark_refresh_failed(&account.id).await {
                    warn!("[Token] failed to record refresh failure for {}: {}", account.id, e);
                }
                return Err(ProxyError::TokenRefresh {
                    account_id: account.id.clone(),
                    reason,
                });
            }
        };

        let now = chrono::Utc::now().timestamp();
        let mut expires_at = now + outcome.expires_in;
        // The exp claim, when present, is authoritative over expires_in.
        if let Some(exp) = jwt_expiry(&outcome.access_token) {
            expires_at = expires_at.min(exp);
        }

        let entry = TokenCacheEntry {
            access_token: outcome.access_token.clone(),
            refresh_token: outcome
                .refresh_token
                .clone()
                .unwrap_or_else(|| refresh_account.refresh_token.clone()),
            expires_at,
        };

        self.store
            .update_refresh(
                &account.id,
                &outcome.access_token,
                outcome.refresh_token.as_deref(),
                "success",
            )
            .await?;
        self.write_cache_file(&account.id, &entry);
        self.memory.insert(account.id.clone(), entry.clone());
        info!(
            "[Token] refreshed token for account {} (expires_at={})",
            account.id, expires_at
        );
        Ok(entry)
    }

    /// Drop the cached token so the next call refreshes. Used after an
    /// upstream 401/403 that matches the provider's token-invalid marker.
    pub fn invalidate(&self, account_id: &str) {
        self.memory.remove(account_id);
        let _ = std::fs::remove_file(self.cache_path(account_id));
    }

    /// Forget everything about a deleted account.
    pub fn forget(&self, account_id: &str) {
        self.invalidate(account_id);
        self.locks.remove(account_id);
    }

    /// Background task: refresh every enabled refreshable account on a fixed
    /// interval. Per-account failures are logged and skipped.
    pub fn spawn_background_refresh(
        self: Arc<Self>,
        interval_hours: u64,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            let period = Duration::from_secs(interval_hours.max(1) * 3600);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[Token] background refresh task stopping");
                        return;
                    }
                    _ = tokio::time::sleep(period) => {}
                }
                let accounts = match manager.store.list_accounts().await {
                    Ok(accounts) => accounts,
                    Err(e) => {
                        warn!("[Token] background refresh could not list accounts: {}", e);
                        continue;
                    }
                };
                for account in accounts {
                    if cancel.is_cancelled() {
                        return;
                    }
                    if !account.enabled || account.account_type == AccountType::CustomApi {
                        continue;
                    }
                    match manager.force_refresh(&account).await {
                        Ok(_) => debug!("[Token] background refresh ok for {}", account.id),
                        Err(e) => {
                            warn!("[Token] background refresh failed for {}: {}", account.id, e)
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn manager() -> (tempfile::TempDir, Arc<TokenManager>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let store = Arc::new(Store::open(&config).await.expect("store"));
        let manager =
            Arc::new(TokenManager::new(store, dir.path().join("token_cache")).expect("manager"));
        (dir, manager)
    }

    #[tokio::test]
    async fn custom_api_accounts_use_static_key() {
        let (_dir, manager) = manager().await;
        let account = Account::new(
            "c1".into(),
            AccountType::CustomApi,
            "c".into(),
            String::new(),
            "sk-static-key".into(),
            String::new(),
        );
        let token = manager.get_valid_token(&account).await.unwrap();
        assert_eq!(token, "sk-static-key");
    }

    #[tokio::test]
    async fn fresh_cache_entry_is_returned_without_refresh() {
        let (_dir, manager) = manager().await;
        let now = chrono::Utc::now().timestamp();
        manager.memory.insert(
            "a1".into(),
            TokenCacheEntry {
                access_token: "cached".into(),
                refresh_token: "r".into(),
                expires_at: now + 3600,
            },
        );
        let account = Account::new(
            "a1".into(),
            AccountType::AmazonQ,
            "a".into(),
            "cid".into(),
            "cs".into(),
            "rt".into(),
        );
        let token = manager.get_valid_token(&account).await.unwrap();
        assert_eq!(token, "cached");
    }

    #[tokio::test]
    async fn cache_file_roundtrip_and_invalidate() {
        let (_dir, manager) = manager().await;
        let now = chrono::Utc::now().timestamp();
        let entry = TokenCacheEntry {
            access_token: "on-disk".into(),
            refresh_token: "r".into(),
            expires_at: now + 3600,
        };
        manager.write_cache_file("a2", &entry);
        let loaded = manager.load_cache_file("a2").expect("cache file");
        assert_eq!(loaded.access_token, "on-disk");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(manager.cache_path("a2"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        manager.invalidate("a2");
        assert!(manager.load_cache_file("a2").is_none());
    }
}
