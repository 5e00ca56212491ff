//! Credential store (accounts, call logs, usage, admins). Two back-ends sit
//! behind one facade: the embedded SQLite file and a networked MySQL
//! database, selected by configuration. All operations are atomic at the
//! single-row level; secrets are stored plaintext — at-rest encryption is
//! the operator's concern on the file/volume.

mod mysql;
mod sqlite;

pub use mysql::MySqlStore;
pub use sqlite::SqliteStore;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::error::{ProxyError, ProxyResult};
use crate::models::{Account, ModelMapping};

/// Field-wise account update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountPatch {
    pub label: Option<String>,
    pub enabled: Option<bool>,
    pub weight: Option<u32>,
    #[serde(rename = "rateLimitPerHour")]
    pub rate_limit_per_hour: Option<u32>,
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
    #[serde(rename = "clientSecret")]
    pub client_secret: Option<String>,
    #[serde(rename = "refreshToken")]
    pub refresh_token: Option<String>,
    pub extension: Option<Value>,
    #[serde(rename = "modelMappings")]
    pub model_mappings: Option<Vec<ModelMapping>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallStats {
    pub last_hour: i64,
    pub last_day: i64,
    pub total: i64,
}

#[derive(Debug, Clone)]
pub struct UsageRow {
    pub account_id: Option<String>,
    pub model: String,
    pub channel: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelUsage {
    pub model: String,
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub by_model: Vec<ModelUsage>,
}

pub enum Store {
    Sqlite(SqliteStore),
    MySql(MySqlStore),
}

fn store_err(message: String) -> ProxyError {
    ProxyError::Config(message)
}

impl Store {
    pub async fn open(config: &Config) -> ProxyResult<Self> {
        match &config.mysql {
            Some(mysql) => {
                tracing::info!("[Store] using MySQL backend at {}", mysql.host);
                Ok(Store::MySql(
                    MySqlStore::connect(&mysql.url()).await.map_err(store_err)?,
                ))
            }
            None => {
                let path = config.data_dir.join("accounts.db");
                tracing::info!("[Store] using embedded backend at {}", path.display());
                Ok(Store::Sqlite(SqliteStore::open(path).map_err(store_err)?))
            }
        }
    }

    pub async fn create_account(&self, account: &Account) -> ProxyResult<()> {
        match self {
            Store::Sqlite(s) => s.create_account(account).map_err(store_err),
            Store::MySql(s) => s.create_account(account).await.map_err(store_err),
        }
    }

    pub async fn get_account(&self, id: &str) -> ProxyResult<Option<Account>> {
        match self {
            Store::Sqlite(s) => s.get_account(id).map_err(store_err),
            Store::MySql(s) => s.get_account(id).await.map_err(store_err),
        }
    }

    pub async fn list_accounts(&self) -> ProxyResult<Vec<Account>> {
        match self {
            Store::Sqlite(s) => s.list_accounts().map_err(store_err),
            Store::MySql(s) => s.list_accounts().await.map_err(store_err),
        }
    }

    pub async fn update_account(&self, id: &str, patch: &AccountPatch) -> ProxyResult<()> {
        match self {
            Store::Sqlite(s) => s.update_account(id, patch).map_err(ProxyError::Account),
            Store::MySql(s) => s
                .update_account(id, patch)
                .await
                .map_err(ProxyError::Account),
        }
    }

    pub async fn delete_account(&self, id: &str) -> ProxyResult<()> {
        match self {
            Store::Sqlite(s) => s.delete_account(id).map_err(ProxyError::Account),
            Store::MySql(s) => s.delete_account(id).await.map_err(ProxyError::Account),
        }
    }

    pub async fn mark_selected(&self, id: &str, now: i64) -> ProxyResult<()> {
        match self {
            Store::Sqlite(s) => s.mark_selected(id, now).map_err(store_err),
            Store::MySql(s) => s.mark_selected(id, now).await.map_err(store_err),
        }
    }

    pub async fn record_outcome(&self, id: &str, success: bool) -> ProxyResult<()> {
        match self {
            Store::Sqlite(s) => s.record_outcome(id, success).map_err(store_err),
            Store::MySql(s) => s.record_outcome(id, success).await.map_err(store_err),
        }
    }

    pub async fn set_cooldown(&self, id: &str, until: Option<i64>) -> ProxyResult<()> {
        match self {
            Store::Sqlite(s) => s.set_cooldown(id, until).map_err(store_err),
            Store::MySql(s) => s.set_cooldown(id, until).await.map_err(store_err),
        }
    }

    pub async fn update_refresh(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        status: &str,
    ) -> ProxyResult<()> {
        match self {
            Store::Sqlite(s) => s
                .update_refresh(id, access_token, refresh_token, status)
                .map_err(store_err),
            Store::MySql(s) => s
                .update_refresh(id, access_token, refresh_token, status)
                .await
                .map_err(store_err),
        }
    }

    pub async fn mark_refresh_failed(&self, id: &str) -> ProxyResult<()> {
        match self {
            Store::Sqlite(s) => s.mark_refresh_failed(id).map_err(store_err),
            Store::MySql(s) => s.mark_refresh_failed(id).await.map_err(store_err),
        }
    }

    pub async fn record_call(&self, account_id: &str, model: &str, timestamp: i64) -> ProxyResult<()> {
        match self {
            Store::Sqlite(s) => s.record_call(account_id, model, timestamp).map_err(store_err),
            Store::MySql(s) => s
                .record_call(account_id, model, timestamp)
                .await
                .map_err(store_err),
        }
    }

    pub async fn count_calls_since(&self, account_id: &str, since: i64) -> ProxyResult<i64> {
        match self {
            Store::Sqlite(s) => s.count_calls_since(account_id, since).map_err(store_err),
            Store::MySql(s) => s
                .count_calls_since(account_id, since)
                .await
                .map_err(store_err),
        }
    }

    pub async fn call_stats(&self, account_id: &str, now: i64) -> ProxyResult<CallStats> {
        match self {
            Store::Sqlite(s) => s.call_stats(account_id, now).map_err(store_err),
            Store::MySql(s) => s.call_stats(account_id, now).await.map_err(store_err),
        }
    }

    pub async fn purge_calls_before(&self, cutoff: i64) -> ProxyResult<u64> {
        match self {
            Store::Sqlite(s) => s
                .purge_calls_before(cutoff)
                .map(|n| n as u64)
                .map_err(store_err),
            Store::MySql(s) => s.purge_calls_before(cutoff).await.map_err(store_err),
        }
    }

    pub async fn record_usage(&self, row: &UsageRow) -> ProxyResult<()> {
        match self {
            Store::Sqlite(s) => s.record_usage(row).map_err(store_err),
            Store::MySql(s) => s.record_usage(row).await.map_err(store_err),
        }
    }

    pub async fn usage_summary(&self, since: Option<i64>) -> ProxyResult<UsageSummary> {
        match self {
            Store::Sqlite(s) => s.usage_summary(since).map_err(store_err),
            Store::MySql(s) => s.usage_summary(since).await.map_err(store_err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountType;

    #[tokio::test]
    async fn facade_roundtrip_over_embedded_backend() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let store = Store::open(&config).await.expect("open");

        let account = Account::new(
            "acc-1".into(),
            AccountType::Gemini,
            "g".into(),
            "cid".into(),
            "csec".into(),
            "rtok".into(),
        );
        store.create_account(&account).await.unwrap();
        assert_eq!(store.list_accounts().await.unwrap().len(), 1);

        store
            .update_account(
                "acc-1",
                &AccountPatch {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!store.get_account("acc-1").await.unwrap().unwrap().enabled);

        store.delete_account("acc-1").await.unwrap();
        assert!(store.get_account("acc-1").await.unwrap().is_none());
    }
}
