//! HTTP API
//! Mission: Thin, validated handlers over the store and forwarders

pub mod ab;
pub mod analytics;
pub mod tracking;

use crate::{
    forward::{CapiForwarder, PosthogForwarder},
    middleware::RateLimiter,
    session::SessionVerifier,
    storage::EventStore,
};
use axum::{
    extract::Request,
    middleware::{from_fn, Next},
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<EventStore>,
    pub capi: Arc<CapiForwarder>,
    pub posthog: Arc<PosthogForwarder>,
    pub sessions: SessionVerifier,
}

/// Build the API router. The rate limiter guards only the high-volume
/// track routes; CORS and logging layers are applied by the caller.
pub fn api_router(state: AppState, limiter: Option<RateLimiter>) -> Router {
    let mut track_routes = Router::new()
        .route("/api/track", post(tracking::track_event))
        .route("/api/ab/track", post(ab::track_ab_event));

    if let Some(limiter) = limiter {
        track_routes = track_routes.route_layer(from_fn(move |req: Request, next: Next| {
            let limiter = limiter.clone();
            async move { limiter.middleware(req, next).await }
        }));
    }

    let other_routes = Router::new()
        .route("/api/ab/assign", post(ab::assign))
        .route("/api/ab/tests", post(ab::create_test))
        .route("/api/ab/tests/:test_id/summary", get(ab::test_summary))
        .route("/api/analytics/mrr", get(analytics::get_mrr))
        .route("/api/analytics/ltv", get(analytics::get_ltv))
        .route(
            "/api/billing/subscriptions",
            post(analytics::upsert_subscription),
        )
        .route("/health", get(health_check));

    track_routes.merge(other_routes).with_state(state)
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "coursepulse operational"
}
