//! Event Ingestion Endpoint
//! Mission: Never lose a page over telemetry
//!
//! Ingestion always reports success to the caller, even when persistence
//! fails. Failures are logged and accepted; there are no retries.
//! Forwarding to external analytics runs on a spawned task so a slow
//! third party never delays the response.

use crate::{
    api::AppState,
    forward::{best_effort, PurchaseEvent},
    models::TrackingEvent,
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

/// Event names treated as purchase-equivalent for ad attribution.
const PURCHASE_EVENTS: &[&str] = &["purchase", "checkout_completed", "course_purchased"];

#[derive(Debug, Deserialize)]
pub struct TrackRequest {
    pub event: String,
    #[serde(default)]
    pub properties: Option<Value>,
    #[serde(rename = "userId", default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// POST /api/track
///
/// Returns 400 only for malformed JSON or a missing/empty `event` name.
/// Every other failure is internal and still answers `{success: true}`.
pub async fn track_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let Ok(Json(raw)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid JSON body"})),
        );
    };

    let request: TrackRequest = match serde_json::from_value(raw) {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("Invalid tracking payload: {}", e)})),
            );
        }
    };

    if request.event.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Event name is required"})),
        );
    }

    // Effective identity: explicit userId, else the session token subject.
    let user_id = request
        .user_id
        .clone()
        .or_else(|| session_user(&state, &headers));

    let event = TrackingEvent {
        id: Uuid::new_v4(),
        event_name: request.event.trim().to_string(),
        user_id,
        session_id: header_value(&headers, "x-session-id"),
        properties: request.properties.clone().unwrap_or_else(|| json!({})),
        user_agent: header_value(&headers, "user-agent"),
        client_ip: client_ip(&headers),
        referer: header_value(&headers, "referer"),
        created_at: parse_timestamp(request.timestamp.as_deref()),
    };

    // Persist, but never surface a storage failure to the caller.
    if let Err(e) = state.store.insert_tracking_event(&event) {
        warn!("Failed to store tracking event '{}': {:#}", event.event_name, e);
    }

    spawn_forwarding(&state, &event);

    (StatusCode::OK, Json(json!({"success": true})))
}

/// Fan out to external analytics off the request path.
fn spawn_forwarding(state: &AppState, event: &TrackingEvent) {
    let distinct_id = event
        .user_id
        .clone()
        .or_else(|| event.session_id.clone())
        .unwrap_or_else(|| event.id.to_string());

    if state.posthog.is_enabled() {
        let posthog = state.posthog.clone();
        let event_name = event.event_name.clone();
        let properties = event.properties.clone();
        let timestamp = event.created_at;
        let distinct = distinct_id.clone();
        tokio::spawn(async move {
            best_effort("product-analytics capture", async move {
                posthog
                    .capture(&event_name, &distinct, &properties, timestamp)
                    .await
            })
            .await;
        });
    }

    if state.capi.is_enabled() && PURCHASE_EVENTS.contains(&event.event_name.as_str()) {
        let capi = state.capi.clone();
        let purchase = purchase_from_event(event);
        tokio::spawn(async move {
            best_effort("conversions relay", async move {
                capi.forward_purchase(&purchase).await
            })
            .await;
        });
    }
}

/// Map a stored tracking event onto the conversions payload. The dedup
/// event_id prefers the client-supplied property so browser pixel events
/// dedupe against this server event.
fn purchase_from_event(event: &TrackingEvent) -> PurchaseEvent {
    let props = &event.properties;

    let event_id = props
        .get("event_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| event.id.to_string());

    let content_ids = props
        .get("content_ids")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    PurchaseEvent {
        event_id,
        event_name: "Purchase".to_string(),
        event_time: event.created_at.timestamp(),
        value: props.get("value").and_then(|v| v.as_f64()).unwrap_or(0.0),
        currency: props
            .get("currency")
            .and_then(|v| v.as_str())
            .unwrap_or("USD")
            .to_string(),
        email: props
            .get("email")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        content_ids,
    }
}

pub(crate) fn session_user(state: &AppState, headers: &HeaderMap) -> Option<String> {
    let auth = headers.get("authorization")?.to_str().ok()?;
    state.sessions.verify_bearer(auth)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// First hop of x-forwarded-for, set by the edge proxy.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_value(headers, "x-forwarded-for")
        .map(|raw| raw.split(',').next().unwrap_or("").trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        forward::{CapiForwarder, PosthogForwarder},
        session::SessionVerifier,
        storage::EventStore,
    };
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn test_state() -> (AppState, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        let store = Arc::new(EventStore::new(db_path).unwrap());
        let client = reqwest::Client::new();

        let state = AppState {
            store,
            capi: Arc::new(CapiForwarder::new(
                client.clone(),
                None,
                None,
                "v18.0".to_string(),
                None,
            )),
            posthog: Arc::new(PosthogForwarder::new(
                client,
                None,
                "https://app.posthog.com".to_string(),
            )),
            sessions: SessionVerifier::new("test-secret".to_string()),
        };
        (state, temp_file)
    }

    #[tokio::test]
    async fn test_valid_event_returns_success() {
        let (state, _temp) = test_state();

        let (status, Json(body)) = track_event(
            State(state.clone()),
            HeaderMap::new(),
            Ok(Json(json!({"event": "page_view", "properties": {"page": "/"}}))),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(state.store.count_tracking_events(), 1);
    }

    #[tokio::test]
    async fn test_missing_event_name_is_rejected() {
        let (state, _temp) = test_state();

        let (status, Json(body)) = track_event(
            State(state.clone()),
            HeaderMap::new(),
            Ok(Json(json!({"properties": {"page": "/"}}))),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
        assert_eq!(state.store.count_tracking_events(), 0);
    }

    #[tokio::test]
    async fn test_empty_event_name_is_rejected() {
        let (state, _temp) = test_state();

        let (status, _) = track_event(
            State(state),
            HeaderMap::new(),
            Ok(Json(json!({"event": "   "}))),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ingestion_survives_store_failure() {
        let (state, temp) = test_state();

        // Break the store out from under the handler.
        let saboteur = rusqlite::Connection::open(temp.path()).unwrap();
        saboteur
            .execute("DROP TABLE tracking_events", [])
            .unwrap();

        let (status, Json(body)) = track_event(
            State(state),
            HeaderMap::new(),
            Ok(Json(json!({"event": "page_view"}))),
        )
        .await;

        // Still success: telemetry must never break the calling page.
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
    }

    #[tokio::test]
    async fn test_identity_falls_back_to_session_token() {
        let (state, _temp) = test_state();
        let token = state.sessions.issue("user-77").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {}", token).parse().unwrap(),
        );
        headers.insert("x-session-id", "sess-abc".parse().unwrap());

        let (status, _) = track_event(
            State(state),
            headers,
            Ok(Json(json!({"event": "lesson_started"}))),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_malformed_timestamp_falls_back_to_now() {
        let (state, _temp) = test_state();

        let (status, _) = track_event(
            State(state.clone()),
            HeaderMap::new(),
            Ok(Json(json!({"event": "page_view", "timestamp": "not-a-date"}))),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.store.count_tracking_events(), 1);
    }

    #[test]
    fn test_purchase_mapping_prefers_client_event_id() {
        let event = TrackingEvent {
            id: Uuid::new_v4(),
            event_name: "purchase".to_string(),
            user_id: Some("user-1".to_string()),
            session_id: None,
            properties: json!({
                "event_id": "evt-from-browser",
                "value": 49.5,
                "currency": "EUR",
                "email": "buyer@example.com",
                "content_ids": ["course-rust-101"]
            }),
            user_agent: None,
            client_ip: None,
            referer: None,
            created_at: Utc::now(),
        };

        let purchase = purchase_from_event(&event);
        assert_eq!(purchase.event_id, "evt-from-browser");
        assert_eq!(purchase.value, 49.5);
        assert_eq!(purchase.currency, "EUR");
        assert_eq!(purchase.content_ids, vec!["course-rust-101".to_string()]);
    }

    #[test]
    fn test_purchase_mapping_defaults() {
        let event = TrackingEvent {
            id: Uuid::new_v4(),
            event_name: "purchase".to_string(),
            user_id: None,
            session_id: None,
            properties: json!({}),
            user_agent: None,
            client_ip: None,
            referer: None,
            created_at: Utc::now(),
        };

        let purchase = purchase_from_event(&event);
        assert_eq!(purchase.event_id, event.id.to_string());
        assert_eq!(purchase.value, 0.0);
        assert_eq!(purchase.currency, "USD");
        assert!(purchase.email.is_none());
    }
}
