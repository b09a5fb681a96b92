//! CoursePulse - Event Attribution & A/B Tracking Backend
//! Mission: Capture every signal, never break the calling page
//!
//! Pipeline: browser emits an event -> ingestion resolves identity ->
//! assignment lookup for experiment events -> append-only persistence ->
//! best-effort forwarding to ad attribution and product analytics.
//! Rollups (MRR, cohort LTV, variant summaries) are pull-based queries.

use anyhow::{Context, Result};
use chrono::Utc;
use coursepulse_backend::{
    api::{api_router, AppState},
    config::{load_env, Config},
    forward::{CapiForwarder, PosthogForwarder},
    middleware::{request_logging, RateLimitConfig, RateLimiter},
    session::SessionVerifier,
    storage::EventStore,
};
use std::{env, sync::Arc, time::Duration};
use tokio::{net::TcpListener, time::interval};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("🚀 CoursePulse tracking backend starting");

    let config = Config::from_env();

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .user_agent("CoursePulse/0.1 (tracking backend)")
        .build()
        .context("Failed to build HTTP client")?;

    let store = Arc::new(EventStore::new(&config.database_path)?);
    info!(
        "💾 Existing tracking events in database: {}",
        store.count_tracking_events()
    );

    let capi = Arc::new(CapiForwarder::new(
        http_client.clone(),
        config.capi_pixel_id.clone(),
        config.capi_access_token.clone(),
        config.capi_api_version.clone(),
        config.site_url.clone(),
    ));
    let posthog = Arc::new(PosthogForwarder::new(
        http_client,
        config.posthog_api_key.clone(),
        config.posthog_host.clone(),
    ));

    let state = AppState {
        store: store.clone(),
        capi,
        posthog,
        sessions: SessionVerifier::new(config.session_secret.clone()),
    };

    // Retention pruning keeps the append-only ledger bounded.
    tokio::spawn(tracking_prune_polling(
        store,
        config.tracking_retention_days,
    ));

    let limiter = RateLimiter::new(RateLimitConfig::from_env());
    let app = api_router(state, Some(limiter))
        .layer(axum::middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

/// Initialize tracing with env-filter overrides
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coursepulse_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Daily sweep deleting tracking events past the retention window.
async fn tracking_prune_polling(store: Arc<EventStore>, retention_days: i64) {
    let poll_secs = env::var("PRUNE_POLL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&v| v > 0)
        .unwrap_or(86_400);

    let mut ticker = interval(Duration::from_secs(poll_secs));
    loop {
        ticker.tick().await;
        let cutoff = Utc::now().timestamp() - retention_days * 86_400;

        match store.prune_tracking_events_before(cutoff) {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(
                        "🧹 Pruned {} tracking events (retention={}d)",
                        deleted, retention_days
                    );
                    let _ = store.optimize();
                }
            }
            Err(e) => warn!("tracking prune failed: {}", e),
        }
    }
}
