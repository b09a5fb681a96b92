//! Analytics & Billing-mirror Endpoints
//! Mission: Pull-based rollups for the revenue dashboards
//!
//! Rollups are computed on demand from persisted rows; there is no
//! in-process aggregation state.

use crate::{
    analytics::{ltv_cohorts, mrr_summary, LtvCohort, MrrSummary},
    api::AppState,
    models::{BillingInterval, Subscription, SubscriptionStatus},
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

/// GET /api/analytics/mrr
pub async fn get_mrr(State(state): State<AppState>) -> Result<Json<MrrSummary>, StatusCode> {
    let subs = state
        .store
        .active_subscriptions()
        .map_err(|e| {
            warn!("Failed to load subscriptions: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(mrr_summary(&subs)))
}

/// GET /api/analytics/ltv
pub async fn get_ltv(State(state): State<AppState>) -> Result<Json<Vec<LtvCohort>>, StatusCode> {
    let subs = state
        .store
        .all_subscriptions()
        .map_err(|e| {
            warn!("Failed to load subscriptions: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(ltv_cohorts(&subs)))
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionUpsertRequest {
    pub id: String,
    pub user_id: String,
    pub price_cents: i64,
    pub interval: String,
    pub status: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// POST /api/billing/subscriptions
///
/// Mirror one billing-provider subscription row. The provider remains the
/// source of truth; this endpoint only keeps the local copy current.
pub async fn upsert_subscription(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let bad_request = |msg: String| (StatusCode::BAD_REQUEST, Json(json!({"error": msg})));

    let Ok(Json(raw)) = body else {
        return Err(bad_request("Invalid JSON body".to_string()));
    };
    let request: SubscriptionUpsertRequest = serde_json::from_value(raw)
        .map_err(|e| bad_request(format!("Invalid payload: {}", e)))?;

    if request.id.trim().is_empty() || request.user_id.trim().is_empty() {
        return Err(bad_request("id and user_id are required".to_string()));
    }
    if request.price_cents < 0 {
        return Err(bad_request("price_cents must be non-negative".to_string()));
    }

    let interval = BillingInterval::from_str(&request.interval)
        .ok_or_else(|| bad_request("interval must be month or year".to_string()))?;
    let status = SubscriptionStatus::from_str(&request.status)
        .ok_or_else(|| bad_request("status must be active, past_due, or canceled".to_string()))?;

    let created_at = request
        .created_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let sub = Subscription {
        id: request.id.trim().to_string(),
        user_id: request.user_id.trim().to_string(),
        price_cents: request.price_cents,
        interval,
        status,
        created_at,
    };

    state.store.upsert_subscription(&sub).map_err(|e| {
        warn!("Failed to upsert subscription {}: {:#}", sub.id, e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Internal server error"})),
        )
    })?;

    Ok((StatusCode::OK, Json(json!({"subscription": sub}))))
}
