//! Embedded single-file store. Connections are opened per call like the rest
//! of the persistence layer; SQLite serializes writers internally.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;

use crate::models::{Account, AccountType, ModelMapping};
use crate::store::{AccountPatch, CallStats, ModelUsage, UsageRow, UsageSummary};

pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: PathBuf) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create data dir: {}", e))?;
        }
        let store = Self { path };
        store.init_db()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, String> {
        let conn = Connection::open(&self.path)
            .map_err(|e| format!("Failed to open database: {}", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| format!("Failed to enable WAL: {}", e))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|e| format!("Failed to set busy timeout: {}", e))?;
        Ok(conn)
    }

    fn init_db(&self) -> Result<(), String> {
        let conn = self.connect()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                label TEXT NOT NULL,
                client_id TEXT NOT NULL,
                client_secret TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                access_token TEXT,
                extension TEXT,
                model_mappings TEXT,
                enabled BOOLEAN NOT NULL DEFAULT 1,
                weight INTEGER NOT NULL DEFAULT 50,
                rate_limit_per_hour INTEGER NOT NULL DEFAULT 20,
                cooldown_until INTEGER,
                last_used_at INTEGER,
                request_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                last_refresh_status TEXT,
                last_refresh_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| format!("Failed to create accounts table: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS call_logs (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                model TEXT,
                timestamp INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| format!("Failed to create call_logs table: {}", e))?;
        let _ = conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_call_logs_account_ts
             ON call_logs(account_id, timestamp)",
            [],
        );

        conn.execute(
            "CREATE TABLE IF NOT EXISTS usage (
                id TEXT PRIMARY KEY,
                account_id TEXT,
                model TEXT,
                channel TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
                cache_read_tokens INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| format!("Failed to create usage table: {}", e))?;
        let _ = conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_usage_created_at ON usage(created_at)",
            [],
        );

        conn.execute(
            "CREATE TABLE IF NOT EXISTS admins (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| format!("Failed to create admins table: {}", e))?;

        Ok(())
    }

    fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
        let type_raw: String = row.get("type")?;
        let extension_raw: Option<String> = row.get("extension")?;
        let mappings_raw: Option<String> = row.get("model_mappings")?;
        Ok(Account {
            id: row.get("id")?,
            account_type: AccountType::parse(&type_raw).unwrap_or(AccountType::CustomApi),
            label: row.get("label")?,
            client_id: row.get("client_id")?,
            client_secret: row.get("client_secret")?,
            refresh_token: row.get("refresh_token")?,
            access_token: row.get("access_token")?,
            extension: extension_raw
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or(serde_json::Value::Null),
            model_mappings: mappings_raw
                .and_then(|raw| serde_json::from_str::<Vec<ModelMapping>>(&raw).ok())
                .unwrap_or_default(),
            enabled: row.get("enabled")?,
            weight: row.get::<_, i64>("weight")? as u32,
            rate_limit_per_hour: row.get::<_, i64>("rate_limit_per_hour")? as u32,
            cooldown_until: row.get("cooldown_until")?,
            last_used_at: row.get("last_used_at")?,
            request_count: row.get("request_count")?,
            success_count: row.get("success_count")?,
            error_count: row.get("error_count")?,
            last_refresh_status: row.get("last_refresh_status")?,
            last_refresh_at: row.get("last_refresh_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn create_account(&self, account: &Account) -> Result<(), String> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO accounts (
                id, type, label, client_id, client_secret, refresh_token, access_token,
                extension, model_mappings, enabled, weight, rate_limit_per_hour,
                cooldown_until, last_used_at, request_count, success_count, error_count,
                last_refresh_status, last_refresh_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            params![
                account.id,
                account.account_type.as_str(),
                account.label,
                account.client_id,
                account.client_secret,
                account.refresh_token,
                account.access_token,
                serde_json::to_string(&account.extension).ok(),
                serde_json::to_string(&account.model_mappings).ok(),
                account.enabled,
                account.weight,
                account.rate_limit_per_hour,
                account.cooldown_until,
                account.last_used_at,
                account.request_count,
                account.success_count,
                account.error_count,
                account.last_refresh_status,
                account.last_refresh_at,
                account.created_at,
                account.updated_at,
            ],
        )
        .map_err(|e| format!("Failed to insert account: {}", e))?;
        Ok(())
    }

    pub fn get_account(&self, id: &str) -> Result<Option<Account>, String> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT * FROM accounts WHERE id = ?1")
            .map_err(|e| format!("Failed to prepare query: {}", e))?;
        stmt.query_row(params![id], Self::account_from_row)
            .optional()
            .map_err(|e| format!("Failed to query account: {}", e))
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>, String> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare("SELECT * FROM accounts ORDER BY id")
            .map_err(|e| format!("Failed to prepare query: {}", e))?;
        let rows = stmt
            .query_map([], Self::account_from_row)
            .map_err(|e| format!("Failed to query accounts: {}", e))?;
        let mut accounts = Vec::new();
        for account in rows {
            accounts.push(account.map_err(|e| format!("Failed to parse account row: {}", e))?);
        }
        Ok(accounts)
    }

    pub fn update_account(&self, id: &str, patch: &AccountPatch) -> Result<(), String> {
        let conn = self.connect()?;
        let now = chrono::Utc::now().timestamp();

        let mut query = "UPDATE accounts SET updated_at = ?1".to_string();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now)];
        let mut idx = 2;
        let mut push = |query: &mut String, values: &mut Vec<Box<dyn rusqlite::ToSql>>,
                        column: &str,
                        value: Box<dyn rusqlite::ToSql>| {
            query.push_str(&format!(", {} = ?{}", column, idx));
            values.push(value);
            idx += 1;
        };

        if let Some(label) = &patch.label {
            push(&mut query, &mut values, "label", Box::new(label.clone()));
        }
        if let Some(enabled) = patch.enabled {
            push(&mut query, &mut values, "enabled", Box::new(enabled));
        }
        if let Some(weight) = patch.weight {
            push(&mut query, &mut values, "weight", Box::new(weight));
        }
        if let Some(limit) = patch.rate_limit_per_hour {
            push(
                &mut query,
                &mut values,
                "rate_limit_per_hour",
                Box::new(limit),
            );
        }
        if let Some(client_id) = &patch.client_id {
            push(&mut query, &mut values, "client_id", Box::new(client_id.clone()));
        }
        if let Some(secret) = &patch.client_secret {
            push(
                &mut query,
                &mut values,
                "client_secret",
                Box::new(secret.clone()),
            );
        }
        if let Some(token) = &patch.refresh_token {
            push(
                &mut query,
                &mut values,
                "refresh_token",
                Box::new(token.clone()),
            );
        }
        if let Some(extension) = &patch.extension {
            push(
                &mut query,
                &mut values,
                "extension",
                Box::new(serde_json::to_string(extension).unwrap_or_default()),
            );
        }
        if let Some(mappings) = &patch.model_mappings {
            push(
                &mut query,
                &mut values,
                "model_mappings",
                Box::new(serde_json::to_string(mappings).unwrap_or_default()),
            );
        }

        query.push_str(&format!(" WHERE id = ?{}", idx));
        values.push(Box::new(id.to_string()));
        let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let changed = conn
            .execute(&query, refs.as_slice())
            .map_err(|e| format!("Failed to update account: {}", e))?;
        if changed == 0 {
            return Err(format!("Account '{}' not found", id));
        }
        Ok(())
    }

    pub fn delete_account(&self, id: &str) -> Result<(), String> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM call_logs WHERE account_id = ?1", params![id])
            .map_err(|e| format!("Failed to delete call logs: {}", e))?;
        let changed = conn
            .execute("DELETE FROM accounts WHERE id = ?1", params![id])
            .map_err(|e| format!("Failed to delete account: {}", e))?;
        if changed == 0 {
            return Err(format!("Account '{}' not found", id));
        }
        Ok(())
    }

    pub fn mark_selected(&self, id: &str, now: i64) -> Result<(), String> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE accounts SET last_used_at = ?1, request_count = request_count + 1,
             updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )
        .map_err(|e| format!("Failed to mark account selected: {}", e))?;
        Ok(())
    }

    pub fn record_outcome(&self, id: &str, success: bool) -> Result<(), String> {
        let conn = self.connect()?;
        let now = chrono::Utc::now().timestamp();
        let sql = if success {
            "UPDATE accounts SET success_count = success_count + 1, updated_at = ?1 WHERE id = ?2"
        } else {
            "UPDATE accounts SET error_count = error_count + 1, updated_at = ?1 WHERE id = ?2"
        };
        conn.execute(sql, params![now, id])
            .map_err(|e| format!("Failed to record outcome: {}", e))?;
        Ok(())
    }

    pub fn set_cooldown(&self, id: &str, until: Option<i64>) -> Result<(), String> {
        let conn = self.connect()?;
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE accounts SET cooldown_until = ?1, updated_at = ?2 WHERE id = ?3",
            params![until, now, id],
        )
        .map_err(|e| format!("Failed to set cooldown: {}", e))?;
        Ok(())
    }

    pub fn update_refresh(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        status: &str,
    ) -> Result<(), String> {
        let conn = self.connect()?;
        let now = chrono::Utc::now().timestamp();
        match refresh_token {
            Some(rotated) => conn.execute(
                "UPDATE accounts SET access_token = ?1, refresh_token = ?2,
                 last_refresh_status = ?3, last_refresh_at = ?4, updated_at = ?4 WHERE id = ?5",
                params![access_token, rotated, status, now, id],
            ),
            None => conn.execute(
                "UPDATE accounts SET access_token = ?1,
                 last_refresh_status = ?2, last_refresh_at = ?3, updated_at = ?3 WHERE id = ?4",
                params![access_token, status, now, id],
            ),
        }
        .map_err(|e| format!("Failed to update refresh state: {}", e))?;
        Ok(())
    }

    pub fn mark_refresh_failed(&self, id: &str) -> Result<(), String> {
        let conn = self.connect()?;
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE accounts SET last_refresh_status = 'failed', last_refresh_at = ?1,
             updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )
        .map_err(|e| format!("Failed to mark refresh failure: {}", e))?;
        Ok(())
    }

    pub fn record_call(&self, account_id: &str, model: &str, timestamp: i64) -> Result<(), String> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO call_logs (id, account_id, model, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![uuid::Uuid::new_v4().to_string(), account_id, model, timestamp],
        )
        .map_err(|e| format!("Failed to record call: {}", e))?;
        Ok(())
    }

    pub fn count_calls_since(&self, account_id: &str, since: i64) -> Result<i64, String> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT COUNT(*) FROM call_logs WHERE account_id = ?1 AND timestamp >= ?2",
            params![account_id, since],
            |row| row.get(0),
        )
        .map_err(|e| format!("Failed to count calls: {}", e))
    }

    pub fn call_stats(&self, account_id: &str, now: i64) -> Result<CallStats, String> {
        Ok(CallStats {
            last_hour: self.count_calls_since(account_id, now - 3600)?,
            last_day: self.count_calls_since(account_id, now - 86_400)?,
            total: self.count_calls_since(account_id, 0)?,
        })
    }

    pub fn purge_calls_before(&self, cutoff: i64) -> Result<usize, String> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM call_logs WHERE timestamp < ?1", params![cutoff])
            .map_err(|e| format!("Failed to purge call logs: {}", e))
    }

    pub fn record_usage(&self, row: &UsageRow) -> Result<(), String> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO usage (id, account_id, model, channel, input_tokens, output_tokens,
             cache_creation_tokens, cache_read_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                uuid::Uuid::new_v4().to_string(),
                row.account_id,
                row.model,
                row.channel,
                row.input_tokens,
                row.output_tokens,
                row.cache_creation_tokens,
                row.cache_read_tokens,
                row.timestamp,
            ],
        )
        .map_err(|e| format!("Failed to record usage: {}", e))?;
        Ok(())
    }

    pub fn usage_summary(&self, since: Option<i64>) -> Result<UsageSummary, String> {
        let conn = self.connect()?;
        let since = since.unwrap_or(0);
        let (requests, input, output, cache_creation, cache_read) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                 COALESCE(SUM(cache_creation_tokens), 0), COALESCE(SUM(cache_read_tokens), 0)
                 FROM usage WHERE created_at >= ?1",
                params![since],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .map_err(|e| format!("Failed to aggregate usage: {}", e))?;

        let mut stmt = conn
            .prepare(
                "SELECT model, COUNT(*), COALESCE(SUM(input_tokens), 0),
                 COALESCE(SUM(output_tokens), 0)
                 FROM usage WHERE created_at >= ?1 GROUP BY model ORDER BY COUNT(*) DESC",
            )
            .map_err(|e| format!("Failed to prepare model aggregate: {}", e))?;
        let rows = stmt
            .query_map(params![since], |row| {
                Ok(ModelUsage {
                    model: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    requests: row.get(1)?,
                    input_tokens: row.get(2)?,
                    output_tokens: row.get(3)?,
                })
            })
            .map_err(|e| format!("Failed to aggregate by model: {}", e))?;
        let mut by_model = Vec::new();
        for row in rows {
            by_model.push(row.map_err(|e| format!("Failed to parse usage row: {}", e))?);
        }

        Ok(UsageSummary {
            requests,
            input_tokens: input,
            output_tokens: output,
            cache_creation_tokens: cache_creation,
            cache_read_tokens: cache_read,
            by_model,
        })
    }
}
