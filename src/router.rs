//! Request routing: pick a channel, pick an account, apply the account's
//! model mapping. A pinned `X-Account-ID` bypasses selection (but still
//! requires the account to be enabled); otherwise the channel is drawn with
//! weight proportional to each type's enabled-account count, and the
//! configured strategy runs within the chosen type.

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::error::{ProxyError, ProxyResult};
use crate::models::{Account, AccountType};
use crate::pool::{AccountPool, SelectionFilter};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub account: Account,
    pub channel: AccountType,
    /// Requested model after the account's mapping table.
    pub target_model: String,
    pub pinned: bool,
}

pub struct RequestRouter {
    store: Arc<Store>,
    pool: Arc<AccountPool>,
}

impl RequestRouter {
    pub fn new(store: Arc<Store>, pool: Arc<AccountPool>) -> Self {
        Self { store, pool }
    }

    pub async fn route(
        &self,
        requested_model: &str,
        pinned_account_id: Option<&str>,
        same_type: Option<AccountType>,
        exclude: &HashSet<String>,
    ) -> ProxyResult<RouteTarget> {
        if let Some(account_id) = pinned_account_id {
            return self.route_pinned(requested_model, account_id).await;
        }

        let account_type = match same_type {
            Some(wanted) => wanted,
            None => {
                self.choose_channel(requested_model, exclude)
                    .await?
            }
        };

        let filter = SelectionFilter {
            account_type: Some(account_type),
            model: Some(requested_model.to_string()),
            exclude: exclude.clone(),
        };
        let account = self.pool.select(&filter).await?;
        let target_model = account.map_model(requested_model).to_string();
        debug!(
            "[Router] {} -> channel={} account={} model={}",
            requested_model,
            account_type.as_str(),
            account.id,
            target_model
        );
        Ok(RouteTarget {
            channel: account.account_type,
            target_model,
            account,
            pinned: false,
        })
    }

    /// Pinning skips weighted selection, rate limits, and cooldowns, but a
    /// disabled account stays unusable.
    async fn route_pinned(&self, requested_model: &str, account_id: &str) -> ProxyResult<RouteTarget> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| ProxyError::Account(format!("Account '{}' not found", account_id)))?;
        if !account.enabled {
            return Err(ProxyError::NoEligibleAccount);
        }
        let now = chrono::Utc::now().timestamp();
        self.store.mark_selected(&account.id, now).await?;
        let target_model = account.map_model(requested_model).to_string();
        Ok(RouteTarget {
            channel: account.account_type,
            target_model,
            account,
            pinned: true,
        })
    }

    /// Channel weights are the enabled-account counts per type, restricted
    /// to types that currently have at least one eligible account.
    async fn choose_channel(
        &self,
        requested_model: &str,
        exclude: &HashSet<String>,
    ) -> ProxyResult<AccountType> {
        let filter = SelectionFilter {
            account_type: None,
            model: Some(requested_model.to_string()),
            exclude: exclude.clone(),
        };
        let eligible = self.pool.eligible_accounts(&filter).await?;
        if eligible.is_empty() {
            return Err(ProxyError::NoEligibleAccount);
        }
        let eligible_types: HashSet<AccountType> =
            eligible.iter().map(|a| a.account_type).collect();

        let mut enabled_counts: HashMap<AccountType, u64> = HashMap::new();
        for account in self.store.list_accounts().await? {
            if account.enabled {
                *enabled_counts.entry(account.account_type).or_default() += 1;
            }
        }

        // Stable iteration order so equal draws resolve deterministically.
        let candidates: Vec<(AccountType, u64)> = AccountType::ALL
            .iter()
            .copied()
            .filter(|t| eligible_types.contains(t))
            .map(|t| (t, enabled_counts.get(&t).copied().unwrap_or(0).max(1)))
            .collect();

        let total: u64 = candidates.iter().map(|(_, w)| w).sum();
        let mut draw = rand::thread_rng().gen_range(0..total);
        for (account_type, weight) in &candidates {
            if draw < *weight {
                return Ok(*account_type);
            }
            draw -= weight;
        }
        Ok(candidates[candidates.len() - 1].0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, LoadBalanceStrategy};
    use crate::pool::{BreakerConfig, CallLogRecorder};

    async fn router() -> (tempfile::TempDir, RequestRouter, Arc<Store>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let store = Arc::new(Store::open(&config).await.expect("store"));
        let call_log = Arc::new(CallLogRecorder::new(Arc::clone(&store)));
        let pool = Arc::new(AccountPool::new(
            Arc::clone(&store),
            call_log,
            LoadBalanceStrategy::RoundRobin,
            BreakerConfig {
                enabled: true,
                error_threshold: 5,
                recovery_timeout_secs: 300,
            },
        ));
        (dir, RequestRouter::new(Arc::clone(&store), pool), store)
    }

    fn account(id: &str, account_type: AccountType) -> Account {
        Account::new(
            id.into(),
            account_type,
            id.into(),
            "c".into(),
            "s".into(),
            "r".into(),
        )
    }

    #[tokio::test]
    async fn pinned_account_dictates_channel_and_mapping() {
        let (_dir, router, store) = router().await;
        let mut acc = account("a1", AccountType::CustomApi);
        acc.model_mappings = vec![crate::models::ModelMapping {
            request_model: "claude-sonnet-4-5".into(),
            target_model: "gpt-4o".into(),
        }];
        store.create_account(&acc).await.unwrap();

        let target = router
            .route("claude-sonnet-4-5", Some("a1"), None, &HashSet::new())
            .await
            .unwrap();
        assert!(target.pinned);
        assert_eq!(target.channel, AccountType::CustomApi);
        assert_eq!(target.target_model, "gpt-4o");
    }

    #[tokio::test]
    async fn pinned_disabled_account_is_rejected() {
        let (_dir, router, store) = router().await;
        let mut acc = account("a1", AccountType::AmazonQ);
        acc.enabled = false;
        store.create_account(&acc).await.unwrap();

        let err = router
            .route("m", Some("a1"), None, &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NoEligibleAccount));
    }

    #[tokio::test]
    async fn pinned_bypasses_cooldown() {
        let (_dir, router, store) = router().await;
        let mut acc = account("a1", AccountType::AmazonQ);
        acc.cooldown_until = Some(chrono::Utc::now().timestamp() + 600);
        store.create_account(&acc).await.unwrap();

        let target = router
            .route("m", Some("a1"), None, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(target.account.id, "a1");
    }

    #[tokio::test]
    async fn unpinned_routing_picks_an_eligible_account() {
        let (_dir, router, store) = router().await;
        store
            .create_account(&account("q1", AccountType::AmazonQ))
            .await
            .unwrap();
        let target = router.route("m", None, None, &HashSet::new()).await.unwrap();
        assert_eq!(target.account.id, "q1");
        assert_eq!(target.channel, AccountType::AmazonQ);
    }

    #[tokio::test]
    async fn same_type_failover_excludes_attempted_account() {
        let (_dir, router, store) = router().await;
        store
            .create_account(&account("q1", AccountType::AmazonQ))
            .await
            .unwrap();
        store
            .create_account(&account("q2", AccountType::AmazonQ))
            .await
            .unwrap();

        let mut exclude = HashSet::new();
        exclude.insert("q1".to_string());
        let target = router
            .route("m", None, Some(AccountType::AmazonQ), &exclude)
            .await
            .unwrap();
        assert_eq!(target.account.id, "q2");
    }

    #[tokio::test]
    async fn no_accounts_at_all_is_503() {
        let (_dir, router, _store) = router().await;
        let err = router.route("m", None, None, &HashSet::new()).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoEligibleAccount));
    }
}
