mod aggregation;
mod config;
mod errors;
mod llm_client;
mod quota;
mod routes;
mod scheduler;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::aggregation::feed::{parse_feed_spec, FeedSource};
use crate::aggregation::{JobSource, SourceAggregator};
use crate::config::Config;
use crate::llm_client::gemini::GeminiTransport;
use crate::llm_client::LlmClient;
use crate::quota::QuotaTracker;
use crate::routes::build_router;
use crate::scheduler::PeriodicScheduler;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails fast on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ApplyBot v{}", env!("CARGO_PKG_VERSION"));

    // Quota tracker (ledger rollover happens here, once)
    let quota = Arc::new(QuotaTracker::load(&config.usage_file, config.quota_limits()));
    info!(
        "Usage ledger: {} (limits: {} req/day, {} tokens/month, {:?} spacing)",
        quota.path().display(),
        quota.limits().daily_requests,
        quota.limits().monthly_tokens,
        quota.limits().min_interval
    );

    // LLM client
    let transport = GeminiTransport::new(config.gemini_api_key.clone(), config.llm_model.clone())
        .context("Failed to build Gemini HTTP client")?;
    info!("LLM client initialized (model: {})", transport.model());
    let llm = LlmClient::new(quota.clone(), Arc::new(transport));

    // Job sources + scheduler
    let mut sources: Vec<Arc<dyn JobSource>> = Vec::new();
    for (name, url) in parse_feed_spec(&config.job_feed_urls) {
        let feed = FeedSource::new(name, url)?;
        info!("Job feed '{}' -> {}", feed.name(), feed.url());
        sources.push(Arc::new(feed));
    }
    if sources.is_empty() {
        warn!("No job feeds configured (JOB_FEED_URLS); scheduled runs will find nothing");
    }

    let aggregator = SourceAggregator::new(sources, config.scrape_limit_per_source);
    info!("Aggregating sources: {:?}", aggregator.source_names());

    let scheduler = Arc::new(PeriodicScheduler::new(
        Arc::new(aggregator),
        config.scheduler_config(),
    ));
    if config.scrape_autostart {
        scheduler.start().await;
    } else {
        info!(
            "Scheduler autostart disabled (interval would be {:?})",
            scheduler.config().interval
        );
    }

    // Build app state
    let state = AppState {
        quota,
        llm,
        scheduler: scheduler.clone(),
        config: config.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
