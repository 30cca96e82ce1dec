use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use book_exchange::api::{self, AppState};
use book_exchange::{Config, Marketplace};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_path =
        std::env::var("BOOK_EXCHANGE_CONFIG").unwrap_or_else(|_| "book-exchange.toml".to_string());
    let config = Config::load(&config_path)?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let market = Marketplace::open(&config)
        .with_context(|| format!("opening store at {}", config.storage.path.display()))?;
    let state = AppState::new(market);

    spawn_lock_sweep(state.clone(), Duration::from_secs(config.sweep.interval_secs.max(1)));

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    tracing::info!(addr = %config.server.bind, "book exchange listening");

    axum::serve(listener, api::router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.market.flush()?;
    tracing::info!("server stopped");
    Ok(())
}

/// Reclaim locks abandoned without a trade resolution.
fn spawn_lock_sweep(state: AppState, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let market = state.market.clone();
            match tokio::task::spawn_blocking(move || market.sweep_expired_locks()).await {
                Ok(Ok(removed)) => tracing::debug!(removed, "lock sweep finished"),
                Ok(Err(err)) => tracing::warn!(error = %err, "lock sweep failed"),
                Err(err) => tracing::warn!(error = %err, "lock sweep task panicked"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
    }
}
