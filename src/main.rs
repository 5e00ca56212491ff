use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pontoon::server::{self, AppState};
use pontoon::Config;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let config = Config::from_env();
    let state = match AppState::init(config).await {
        Ok(state) => state,
        Err(e) => {
            error!("[Startup] failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    state.spawn_background_tasks(cancel.clone());

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("[Startup] shutdown signal received");
        shutdown.cancel();
    });

    if let Err(e) = server::run(state, cancel).await {
        error!("[Startup] server error: {}", e);
        std::process::exit(1);
    }
    info!("[Startup] bye");
}
