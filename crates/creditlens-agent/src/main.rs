//! CreditLens agent entry point.
//! Builds the model pool, preloads the configured models and keeps it
//! running until Ctrl-C.

mod config;

use std::time::Duration;

use creditlens_llm::BackendFactory;
use creditlens_pool::{ModelPool, PoolEvent};
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Keys may live in a local .env during development.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("creditlens=debug,info")),
        )
        .init();

    info!("💳 CreditLens starting up...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match config::Config::load() {
        Ok(c) => {
            info!(
                "Configuration loaded. Pool capacity: {}, preload models: {}",
                c.pool.max_connections,
                c.models.len()
            );
            c
        }
        Err(e) => {
            warn!("Could not load creditlens.toml: {e}");
            warn!("Copy creditlens.example.toml to creditlens.toml and edit it.");
            return Ok(());
        }
    };

    let credentials = config.backends.credentials();
    if credentials.gemini_api_key.is_none() {
        warn!("No Gemini API key configured (GEMINI_API_KEY); text generation will fail to connect");
    }
    let registry = BackendFactory::new(credentials).registry();
    let pool = ModelPool::new(config.pool.to_pool_config(), registry)?;
    info!("✅ Model pool ready.");

    let event_logger = tokio::spawn(log_events(pool.subscribe()));

    for model in &config.models {
        match pool.preload(&model.model_type, &model.config, model.timeout()).await {
            Ok(()) => info!(model_type = %model.model_type, model = %model.config.model, "Preloaded model"),
            Err(e) => warn!(model_type = %model.model_type, model = %model.config.model, error = %e, "Preload failed"),
        }
    }

    let mut ticker = interval_at(Instant::now() + config.stats_interval(), config.stats_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => log_stats(&pool),
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!("Failed to listen for Ctrl-C: {e}");
                }
                break;
            }
        }
    }

    info!("Shutting down model pool...");
    pool.shutdown();
    log_stats(&pool);

    // The logger ends once the pool's event channel closes.
    if tokio::time::timeout(Duration::from_secs(2), event_logger).await.is_err() {
        debug!("Event logger still running at exit");
    }
    info!("👋 CreditLens stopped.");
    Ok(())
}

fn log_stats<H: Clone + Send + Sync + 'static>(pool: &ModelPool<H>) {
    let stats = pool.stats();
    match serde_json::to_string(&stats) {
        Ok(json) => info!(
            active = stats.active,
            available = stats.available,
            queued = stats.queued,
            "Pool stats: {json}"
        ),
        Err(e) => warn!("Could not serialise pool stats: {e}"),
    }
}

async fn log_events(rx: broadcast::Receiver<PoolEvent>) {
    let mut events = BroadcastStream::new(rx);
    while let Some(event) = events.next().await {
        match event {
            Ok(PoolEvent::Shutdown { dropped_entries, failed_requests }) => {
                info!(dropped_entries, failed_requests, "Pool shut down");
                break;
            }
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => debug!("Pool event: {json}"),
                Err(e) => warn!("Could not serialise pool event: {e}"),
            },
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Event logger fell behind");
            }
        }
    }
}
