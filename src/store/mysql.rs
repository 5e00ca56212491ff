//! Networked store backend. Mirrors the embedded backend's schema and
//! semantics over a sqlx MySQL pool; callers go through the `Store` facade
//! and never see which backend answered.

use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;

use crate::models::{Account, AccountType, ModelMapping};
use crate::store::{AccountPatch, CallStats, ModelUsage, UsageRow, UsageSummary};

pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub async fn connect(url: &str) -> Result<Self, String> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| format!("Failed to connect to MySQL: {}", e))?;
        let store = Self { pool };
        store.init_db().await?;
        Ok(store)
    }

    async fn init_db(&self) -> Result<(), String> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS accounts (
                id VARCHAR(64) PRIMARY KEY,
                type VARCHAR(16) NOT NULL,
                label VARCHAR(255) NOT NULL,
                client_id TEXT NOT NULL,
                client_secret TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                access_token TEXT,
                extension TEXT,
                model_mappings TEXT,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                weight INT NOT NULL DEFAULT 50,
                rate_limit_per_hour INT NOT NULL DEFAULT 20,
                cooldown_until BIGINT,
                last_used_at BIGINT,
                request_count BIGINT NOT NULL DEFAULT 0,
                success_count BIGINT NOT NULL DEFAULT 0,
                error_count BIGINT NOT NULL DEFAULT 0,
                last_refresh_status VARCHAR(16),
                last_refresh_at BIGINT,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
            "CREATE TABLE IF NOT EXISTS call_logs (
                id VARCHAR(36) PRIMARY KEY,
                account_id VARCHAR(64) NOT NULL,
                model VARCHAR(128),
                timestamp BIGINT NOT NULL,
                INDEX idx_call_logs_account_ts (account_id, timestamp)
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
            "CREATE TABLE IF NOT EXISTS `usage` (
                id VARCHAR(36) PRIMARY KEY,
                account_id VARCHAR(64),
                model VARCHAR(128),
                channel VARCHAR(32),
                input_tokens BIGINT NOT NULL DEFAULT 0,
                output_tokens BIGINT NOT NULL DEFAULT 0,
                cache_creation_tokens BIGINT NOT NULL DEFAULT 0,
                cache_read_tokens BIGINT NOT NULL DEFAULT 0,
                created_at BIGINT NOT NULL,
                INDEX idx_usage_created_at (created_at)
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
            "CREATE TABLE IF NOT EXISTS admins (
                id VARCHAR(36) PRIMARY KEY,
                username VARCHAR(128) UNIQUE NOT NULL,
                password_hash VARCHAR(255) NOT NULL,
                created_at BIGINT NOT NULL
            ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
        ];
        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| format!("Failed to initialize MySQL schema: {}", e))?;
        }
        Ok(())
    }

    fn account_from_row(row: &MySqlRow) -> Account {
        let type_raw: String = row.get("type");
        let extension_raw: Option<String> = row.get("extension");
        let mappings_raw: Option<String> = row.get("model_mappings");
        Account {
            id: row.get("id"),
            account_type: AccountType::parse(&type_raw).unwrap_or(AccountType::CustomApi),
            label: row.get("label"),
            client_id: row.get("client_id"),
            client_secret: row.get("client_secret"),
            refresh_token: row.get("refresh_token"),
            access_token: row.get("access_token"),
            extension: extension_raw
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or(serde_json::Value::Null),
            model_mappings: mappings_raw
                .and_then(|raw| serde_json::from_str::<Vec<ModelMapping>>(&raw).ok())
                .unwrap_or_default(),
            enabled: row.get("enabled"),
            weight: row.get::<i32, _>("weight") as u32,
            rate_limit_per_hour: row.get::<i32, _>("rate_limit_per_hour") as u32,
            cooldown_until: row.get("cooldown_until"),
            last_used_at: row.get("last_used_at"),
            request_count: row.get("request_count"),
            success_count: row.get("success_count"),
            error_count: row.get("error_count"),
            last_refresh_status: row.get("last_refresh_status"),
            last_refresh_at: row.get("last_refresh_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    pub async fn create_account(&self, account: &Account) -> Result<(), String> {
        sqlx::query(
            "INSERT INTO accounts (
                id, type, label, client_id, client_secret, refresh_token, access_token,
                extension, model_mappings, enabled, weight, rate_limit_per_hour,
                cooldown_until, last_used_at, request_count, success_count, error_count,
                last_refresh_status, last_refresh_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&account.id)
        .bind(account.account_type.as_str())
        .bind(&account.label)
        .bind(&account.client_id)
        .bind(&account.client_secret)
        .bind(&account.refresh_token)
        .bind(&account.access_token)
        .bind(serde_json::to_string(&account.extension).ok())
        .bind(serde_json::to_string(&account.model_mappings).ok())
        .bind(account.enabled)
        .bind(account.weight as i32)
        .bind(account.rate_limit_per_hour as i32)
        .bind(account.cooldown_until)
        .bind(account.last_used_at)
        .bind(account.request_count)
        .bind(account.success_count)
        .bind(account.error_count)
        .bind(&account.last_refresh_status)
        .bind(account.last_refresh_at)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to insert account: {}", e))?;
        Ok(())
    }

    pub async fn get_account(&self, id: &str) -> Result<Option<Account>, String> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| format!("Failed to query account: {}", e))?;
        Ok(row.map(|r| Self::account_from_row(&r)))
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, String> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| format!("Failed to query accounts: {}", e))?;
        Ok(rows.iter().map(Self::account_from_row).collect())
    }

    pub async fn update_account(&self, id: &str, patch: &AccountPatch) -> Result<(), String> {
        let now = chrono::Utc::now().timestamp();
        let mut sets = vec!["updated_at = ?".to_string()];
        if patch.label.is_some() {
            sets.push("label = ?".into());
        }
        if patch.enabled.is_some() {
            sets.push("enabled = ?".into());
        }
        if patch.weight.is_some() {
            sets.push("weight = ?".into());
        }
        if patch.rate_limit_per_hour.is_some() {
            sets.push("rate_limit_per_hour = ?".into());
        }
        if patch.client_id.is_some() {
            sets.push("client_id = ?".into());
        }
        if patch.client_secret.is_some() {
            sets.push("client_secret = ?".into());
        }
        if patch.refresh_token.is_some() {
            sets.push("refresh_token = ?".into());
        }
        if patch.extension.is_some() {
            sets.push("extension = ?".into());
        }
        if patch.model_mappings.is_some() {
            sets.push("model_mappings = ?".into());
        }

        let sql = format!("UPDATE accounts SET {} WHERE id = ?", sets.join(", "));
        let mut query = sqlx::query(&sql).bind(now);
        if let Some(label) = &patch.label {
            query = query.bind(label);
        }
        if let Some(enabled) = patch.enabled {
            query = query.bind(enabled);
        }
        if let Some(weight) = patch.weight {
            query = query.bind(weight as i32);
        }
        if let Some(limit) = patch.rate_limit_per_hour {
            query = query.bind(limit as i32);
        }
        if let Some(client_id) = &patch.client_id {
            query = query.bind(client_id);
        }
        if let Some(secret) = &patch.client_secret {
            query = query.bind(secret);
        }
        if let Some(token) = &patch.refresh_token {
            query = query.bind(token);
        }
        if let Some(extension) = &patch.extension {
            query = query.bind(serde_json::to_string(extension).unwrap_or_default());
        }
        if let Some(mappings) = &patch.model_mappings {
            query = query.bind(serde_json::to_string(mappings).unwrap_or_default());
        }
        let result = query
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to update account: {}", e))?;
        if result.rows_affected() == 0 {
            return Err(format!("Account '{}' not found", id));
        }
        Ok(())
    }

    pub async fn delete_account(&self, id: &str) -> Result<(), String> {
        sqlx::query("DELETE FROM call_logs WHERE account_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to delete call logs: {}", e))?;
        let result = sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to delete account: {}", e))?;
        if result.rows_affected() == 0 {
            return Err(format!("Account '{}' not found", id));
        }
        Ok(())
    }

    pub async fn mark_selected(&self, id: &str, now: i64) -> Result<(), String> {
        sqlx::query(
            "UPDATE accounts SET last_used_at = ?, request_count = request_count + 1,
             updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to mark account selected: {}", e))?;
        Ok(())
    }

    pub async fn record_outcome(&self, id: &str, success: bool) -> Result<(), String> {
        let now = chrono::Utc::now().timestamp();
        let sql = if success {
            "UPDATE accounts SET success_count = success_count + 1, updated_at = ? WHERE id = ?"
        } else {
            "UPDATE accounts SET error_count = error_count + 1, updated_at = ? WHERE id = ?"
        };
        sqlx::query(sql)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to record outcome: {}", e))?;
        Ok(())
    }

    pub async fn set_cooldown(&self, id: &str, until: Option<i64>) -> Result<(), String> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE accounts SET cooldown_until = ?, updated_at = ? WHERE id = ?")
            .bind(until)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to set cooldown: {}", e))?;
        Ok(())
    }

    pub async fn update_refresh(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        status: &str,
    ) -> Result<(), String> {
        let now = chrono::Utc::now().timestamp();
        let result = match refresh_token {
            Some(rotated) => {
                sqlx::query(
                    "UPDATE accounts SET access_token = ?, refresh_token = ?,
                     last_refresh_status = ?, last_refresh_at = ?, updated_at = ? WHERE id = ?",
                )
                .bind(access_token)
                .bind(rotated)
                .bind(status)
                .bind(now)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE accounts SET access_token = ?,
                     last_refresh_status = ?, last_refresh_at = ?, updated_at = ? WHERE id = ?",
                )
                .bind(access_token)
                .bind(status)
                .bind(now)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await
            }
        };
        result.map_err(|e| format!("Failed to update refresh state: {}", e))?;
        Ok(())
    }

    pub async fn mark_refresh_failed(&self, id: &str) -> Result<(), String> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE accounts SET last_refresh_status = 'failed', last_refresh_at = ?,
             updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to mark refresh failure: {}", e))?;
        Ok(())
    }

    pub async fn record_call(
        &self,
        account_id: &str,
        model: &str,
        timestamp: i64,
    ) -> Result<(), String> {
        sqlx::query("INSERT INTO call_logs (id, account_id, model, timestamp) VALUES (?, ?, ?, ?)")
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(account_id)
            .bind(model)
            .bind(timestamp)
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to record call: {}", e))?;
        Ok(())
    }

    pub async fn count_calls_since(&self, account_id: &str, since: i64) -> Result<i64, String> {
        let row =
            sqlx::query("SELECT COUNT(*) AS c FROM call_logs WHERE account_id = ? AND timestamp >= ?")
                .bind(account_id)
                .bind(since)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| format!("Failed to count calls: {}", e))?;
        Ok(row.get::<i64, _>("c"))
    }

    pub async fn call_stats(&self, account_id: &str, now: i64) -> Result<CallStats, String> {
        Ok(CallStats {
            last_hour: self.count_calls_since(account_id, now - 3600).await?,
            last_day: self.count_calls_since(account_id, now - 86_400).await?,
            total: self.count_calls_since(account_id, 0).await?,
        })
    }

    pub async fn purge_calls_before(&self, cutoff: i64) -> Result<u64, String> {
        let result = sqlx::query("DELETE FROM call_logs WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| format!("Failed to purge call logs: {}", e))?;
        Ok(result.rows_affected())
    }

    pub async fn record_usage(&self, row: &UsageRow) -> Result<(), String> {
        sqlx::query(
            "INSERT INTO `usage` (id, account_id, model, channel, input_tokens, output_tokens,
             cache_creation_tokens, cache_read_tokens, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&row.account_id)
        .bind(&row.model)
        .bind(&row.channel)
        .bind(row.input_tokens)
        .bind(row.output_tokens)
        .bind(row.cache_creation_tokens)
        .bind(row.cache_read_tokens)
        .bind(row.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("Failed to record usage: {}", e))?;
        Ok(())
    }

    pub async fn usage_summary(&self, since: Option<i64>) -> Result<UsageSummary, String> {
        let since = since.unwrap_or(0);
        let totals = sqlx::query(
            "SELECT COUNT(*) AS requests,
             CAST(COALESCE(SUM(input_tokens), 0) AS SIGNED) AS input,
             CAST(COALESCE(SUM(output_tokens), 0) AS SIGNED) AS output,
             CAST(COALESCE(SUM(cache_creation_tokens), 0) AS SIGNED) AS cache_creation,
             CAST(COALESCE(SUM(cache_read_tokens), 0) AS SIGNED) AS cache_read
             FROM `usage` WHERE created_at >= ?",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| format!("Failed to aggregate usage: {}", e))?;

        let model_rows = sqlx::query(
            "SELECT model, COUNT(*) AS requests,
             CAST(COALESCE(SUM(input_tokens), 0) AS SIGNED) AS input,
             CAST(COALESCE(SUM(output_tokens), 0) AS SIGNED) AS output
             FROM `usage` WHERE created_at >= ? GROUP BY model ORDER BY requests DESC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| format!("Failed to aggregate by model: {}", e))?;

        Ok(UsageSummary {
            requests: totals.get::<i64, _>("requests"),
            input_tokens: totals.get::<i64, _>("input"),
            output_tokens: totals.get::<i64, _>("output"),
            cache_creation_tokens: totals.get::<i64, _>("cache_creation"),
            cache_read_tokens: totals.get::<i64, _>("cache_read"),
            by_model: model_rows
                .iter()
                .map(|row| ModelUsage {
                    model: row.get::<Option<String>, _>("model").unwrap_or_default(),
                    requests: row.get::<i64, _>("requests"),
                    input_tokens: row.get::<i64, _>("input"),
                    output_tokens: row.get::<i64, _>("output"),
                })
                .collect(),
        })
    }
}
