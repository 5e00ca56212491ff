//! Account pool: eligibility filtering, strategy selection, circuit
//! breaking. The store owns the rows; the pool owns the per-process scheduling
//! state (round-robin cursor, error streaks) and keeps its critical sections
//! short — selection never blocks on upstream I/O.

pub mod call_log;
pub mod selector;

pub use call_log::CallLogRecorder;
pub use selector::Selector;

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ProxyError, ProxyResult};
use crate::models::{Account, AccountType};
use crate::store::Store;

#[derive(Debug, Clone, Default)]
pub struct SelectionFilter {
    pub account_type: Option<AccountType>,
    /// For Gemini accounts the per-model quota map must show headroom.
    pub model: Option<String>,
    /// Accounts already attempted in this request's retry loop.
    pub exclude: std::collections::HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub enabled: bool,
    pub error_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl BreakerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.circuit_breaker_enabled,
            error_threshold: config.circuit_breaker_error_threshold,
            recovery_timeout_secs: config.circuit_breaker_recovery_timeout_secs,
        }
    }
}

pub struct AccountPool {
    store: Arc<Store>,
    call_log: Arc<CallLogRecorder>,
    selector: Selector,
    breaker: BreakerConfig,
    error_streaks: DashMap<String, u32>,
}

impl AccountPool {
    pub fn new(
        store: Arc<Store>,
        call_log: Arc<CallLogRecorder>,
        strategy: crate::config::LoadBalanceStrategy,
        breaker: BreakerConfig,
    ) -> Self {
        info!(
            "[Pool] initialized (strategy={}, breaker_enabled={})",
            strategy.as_str(),
            breaker.enabled
        );
        Self {
            store,
            call_log,
            selector: Selector::new(strategy),
            breaker,
            error_streaks: DashMap::new(),
        }
    }

    /// Eligibility: enabled, out of cooldown, under the hourly rate limit,
    /// plus any per-call type/model filters. Returned id-sorted.
    pub async fn eligible_accounts(&self, filter: &SelectionFilter) -> ProxyResult<Vec<Account>> {
        let now = chrono::Utc::now().timestamp();
        let mut eligible = Vec::new();
        for account in self.store.list_accounts().await? {
            if !account.enabled || account.in_cooldown(now) {
                continue;
            }
            if filter.exclude.contains(&account.id) {
                continue;
            }
            if let Some(wanted) = filter.account_type {
                if account.account_type != wanted {
                    continue;
                }
            }
            if let Some(model) = &filter.model {
                if account.account_type == AccountType::Gemini
                    && !account.gemini_extension().model_available(model, now)
                {
                    continue;
                }
            }
            let used = self.call_log.count_in_window(&account.id).await?;
            if used >= account.rate_limit_per_hour as i64 {
                debug!(
                    "[Pool] account {} over rate limit ({}/{})",
                    account.id, used, account.rate_limit_per_hour
                );
                continue;
            }
            eligible.push(account);
        }
        Ok(eligible)
    }

    /// Pick an account and atomically stamp `last_used_at`/`request_count`.
    pub async fn select(&self, filter: &SelectionFilter) -> ProxyResult<Account> {
        let eligible = self.eligible_accounts(filter).await?;
        if eligible.is_empty() {
            return Err(ProxyError::NoEligibleAccount);
        }
        let picked = self.selector.pick(&eligible).clone();
        let now = chrono::Utc::now().timestamp();
        self.store.mark_selected(&picked.id, now).await?;
        debug!(
            "[Pool] selected account {} via {}",
            picked.id,
            self.selector.strategy().as_str()
        );
        Ok(picked)
    }

    pub async fn mark_success(&self, account_id: &str) {
        self.error_streaks.remove(account_id);
        if let Err(e) = self.store.record_outcome(account_id, true).await {
            warn!("[Pool] failed to record success for {}: {}", account_id, e);
        }
    }

    /// Consecutive errors trip the breaker at the configured threshold.
    pub async fn mark_error(&self, account_id: &str) {
        if let Err(e) = self.store.record_outcome(account_id, false).await {
            warn!("[Pool] failed to record error for {}: {}", account_id, e);
        }
        let streak = {
            let mut entry = self.error_streaks.entry(account_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if self.breaker.enabled && streak >= self.breaker.error_threshold {
            self.open_breaker_inner(account_id, streak).await;
        }
    }

    /// 429: open immediately regardless of streak and bump error_count.
    pub async fn open_breaker(&self, account_id: &str) {
        if let Err(e) = self.store.record_outcome(account_id, false).await {
            warn!("[Pool] failed to record error for {}: {}", account_id, e);
        }
        let streak = {
            let mut entry = self.error_streaks.entry(account_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        if self.breaker.enabled {
            self.open_breaker_inner(account_id, streak).await;
        }
    }

    /// Rate-limit cooldown and breaker cooldown share one field; the longer
    /// of the two wins.
    async fn open_breaker_inner(&self, account_id: &str, streak: u32) {
        let until = chrono::Utc::now().timestamp() + self.breaker.recovery_timeout_secs as i64;
        let existing = match self.store.get_account(account_id).await {
            Ok(Some(account)) => account.cooldown_until.unwrap_or(0),
            _ => 0,
        };
        if existing >= until {
            return;
        }
        if let Err(e) = self.store.set_cooldown(account_id, Some(until)).await {
            warn!("[Pool] failed to set cooldown for {}: {}", account_id, e);
            return;
        }
        warn!(
            "[Pool] circuit breaker open for account {} (streak={}, until={})",
            account_id, streak, until
        );
    }

    /// Explicit cooldown (e.g. Gemini per-minute throttle) honoring the
    /// longer-cooldown-wins rule.
    pub async fn set_cooldown_secs(&self, account_id: &str, secs: u64) {
        let until = chrono::Utc::now().timestamp() + secs as i64;
        let existing = match self.store.get_account(account_id).await {
            Ok(Some(account)) => account.cooldown_until.unwrap_or(0),
            _ => 0,
        };
        if existing < until {
            if let Err(e) = self.store.set_cooldown(account_id, Some(until)).await {
                warn!("[Pool] failed to set cooldown for {}: {}", account_id, e);
            }
        }
    }

    pub fn error_streak(&self, account_id: &str) -> u32 {
        self.error_streaks
            .get(account_id)
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn call_log(&self) -> &CallLogRecorder {
        &self.call_log
    }
}
