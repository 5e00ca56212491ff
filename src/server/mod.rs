//! HTTP server assembly: application state, route table, startup/shutdown.

pub mod admin;
pub mod handlers;

use axum::{
    routing::{get, patch, post},
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::PromptCache;
use crate::config::Config;
use crate::error::ProxyResult;
use crate::pool::{AccountPool, BreakerConfig, CallLogRecorder};
use crate::router::RequestRouter;
use crate::store::Store;
use crate::token::{DeviceAuthRegistry, TokenManager};
use crate::tokenizer::{HeuristicEstimator, TokenEstimator};
use crate::usage::UsageTracker;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub pool: Arc<AccountPool>,
    pub router: Arc<RequestRouter>,
    pub tokens: Arc<TokenManager>,
    pub cache: Arc<PromptCache>,
    pub usage: Arc<UsageTracker>,
    pub estimator: Arc<dyn TokenEstimator>,
    pub sessions: Arc<DeviceAuthRegistry>,
    pub http: reqwest::Client,
}

impl AppState {
    pub async fn init(config: Config) -> ProxyResult<Self> {
        let config = Arc::new(config);
        let store = Arc::new(Store::open(&config).await?);
        let call_log = Arc::new(CallLogRecorder::new(Arc::clone(&store)));
        let pool = Arc::new(AccountPool::new(
            Arc::clone(&store),
            Arc::clone(&call_log),
            config.strategy,
            BreakerConfig::from_config(&config),
        ));
        let router = Arc::new(RequestRouter::new(Arc::clone(&store), Arc::clone(&pool)));
        let tokens = Arc::new(TokenManager::new(
            Arc::clone(&store),
            config.data_dir.join("token_cache"),
        )?);
        let cache = Arc::new(PromptCache::new(
            config.cache_ttl_secs,
            config.max_cache_entries,
        ));
        let usage = Arc::new(UsageTracker::new(
            Arc::clone(&store),
            config.zero_input_token_models.clone(),
        ));
        // No overall timeout here: response bodies stream for minutes.
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            config,
            store,
            pool,
            router,
            tokens,
            cache,
            usage,
            estimator: Arc::new(HeuristicEstimator),
            sessions: Arc::new(DeviceAuthRegistry::new()),
            http,
        })
    }

    /// Background tasks owned by the server process; all stop on `cancel`.
    pub fn spawn_background_tasks(&self, cancel: CancellationToken) {
        if self.config.auto_refresh_enabled {
            let _ = Arc::clone(&self.tokens)
                .spawn_background_refresh(self.config.token_refresh_interval_hours, cancel.clone());
            info!(
                "[Server] background token refresh every {}h",
                self.config.token_refresh_interval_hours
            );
        }
        // Periodic health sweep: expire stale device-auth sessions and log
        // pool availability.
        let sessions = Arc::clone(&self.sessions);
        let store = Arc::clone(&self.store);
        let interval = self.config.health_check_interval_secs.max(30);
        let health_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = health_cancel.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
                }
                sessions.purge_expired();
                if let Ok(accounts) = store.list_accounts().await {
                    let now = chrono::Utc::now().timestamp();
                    let available = accounts
                        .iter()
                        .filter(|a| a.enabled && !a.in_cooldown(now))
                        .count();
                    tracing::debug!(
                        "[Server] health sweep: {}/{} accounts available",
                        available,
                        accounts.len()
                    );
                }
            }
        });

        // Call-log retention sweep, once a day.
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(86_400)) => {}
                }
                match pool.call_log().purge_old().await {
                    Ok(purged) if purged > 0 => {
                        info!("[Server] purged {} expired call-log rows", purged)
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("[Server] call-log purge failed: {}", e),
                }
            }
        });
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::handle_health))
        .route("/v1/messages", post(handlers::handle_messages))
        .route("/v1/gemini/messages", post(handlers::handle_gemini_messages))
        .route(
            "/v1/messages/count_tokens",
            post(handlers::handle_count_tokens),
        )
        .route("/v1/usage", get(handlers::handle_usage))
        .route(
            "/v2/accounts",
            get(admin::handle_list_accounts).post(admin::handle_create_account),
        )
        .route(
            "/v2/accounts/:id",
            patch(admin::handle_update_account).delete(admin::handle_delete_account),
        )
        .route("/v2/accounts/:id/refresh", post(admin::handle_refresh_account))
        .route("/v2/accounts/:id/stats", get(admin::handle_account_stats))
        .route("/v2/auth/start", post(admin::handle_auth_start))
        .route("/v2/auth/claim/:auth_id", post(admin::handle_auth_claim))
        .route("/v2/auth/status/:auth_id", get(admin::handle_auth_status))
        .with_state(state)
}

pub async fn run(state: AppState, cancel: CancellationToken) -> ProxyResult<()> {
    let port = state.config.port;
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("[Server] listening on 0.0.0.0:{}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
