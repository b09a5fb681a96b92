//! A/B Experiment Endpoints
//! Mission: Record outcomes against prior assignments, never orphan events
//!
//! An event can never exist without an assignment: the recorder resolves
//! the (test, variant, identity) triple to an existing assignment row
//! before any insert, and rejects the event with 404 when none matches.

use crate::{
    api::{tracking::session_user, AppState},
    models::{AbEvent, AbEventType, Identity},
};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

/// A/B API errors
#[derive(Debug)]
pub enum AbApiError {
    InvalidPayload(String),
    MissingIdentity,
    UnknownEventType,
    ValueNotAllowed,
    NegativeValue,
    AssignmentNotFound,
    TestNotFound,
    Storage,
}

impl IntoResponse for AbApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AbApiError::InvalidPayload(msg) => (StatusCode::BAD_REQUEST, msg),
            AbApiError::MissingIdentity => (
                StatusCode::BAD_REQUEST,
                "Either a session or an anon_id is required".to_string(),
            ),
            AbApiError::UnknownEventType => (
                StatusCode::BAD_REQUEST,
                "event_type must be view, click, conversion, or purchase".to_string(),
            ),
            AbApiError::ValueNotAllowed => (
                StatusCode::BAD_REQUEST,
                "event_value is only valid for conversion and purchase events".to_string(),
            ),
            AbApiError::NegativeValue => (
                StatusCode::BAD_REQUEST,
                "event_value must be non-negative".to_string(),
            ),
            AbApiError::AssignmentNotFound => (
                StatusCode::NOT_FOUND,
                "No assignment found for this test, variant, and identity".to_string(),
            ),
            AbApiError::TestNotFound => (StatusCode::NOT_FOUND, "Test not found".to_string()),
            AbApiError::Storage => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        (status, Json(json!({"error": message}))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct AbTrackRequest {
    pub test_id: Uuid,
    pub variant_id: Uuid,
    pub event_type: String,
    #[serde(default)]
    pub event_value: Option<f64>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub anon_id: Option<String>,
}

/// POST /api/ab/track
pub async fn track_ab_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AbApiError> {
    let request = parse_body::<AbTrackRequest>(body)?;

    let event_type = AbEventType::from_str(&request.event_type)
        .ok_or(AbApiError::UnknownEventType)?;

    if let Some(value) = request.event_value {
        if !event_type.is_revenue() {
            return Err(AbApiError::ValueNotAllowed);
        }
        if value < 0.0 || !value.is_finite() {
            return Err(AbApiError::NegativeValue);
        }
    }

    let identity = resolve_identity(&state, &headers, request.anon_id.as_deref())?;

    let assignment = state
        .store
        .find_assignment(&request.test_id, &request.variant_id, &identity)
        .map_err(|e| {
            warn!("Assignment lookup failed: {:#}", e);
            AbApiError::Storage
        })?
        .ok_or(AbApiError::AssignmentNotFound)?;

    let event = AbEvent {
        id: Uuid::new_v4(),
        assignment_id: assignment.id,
        event_type,
        event_value: request.event_value,
        metadata: request.metadata,
        created_at: Utc::now(),
    };

    state.store.insert_ab_event(&event).map_err(|e| {
        warn!("Failed to store ab event: {:#}", e);
        AbApiError::Storage
    })?;

    Ok((StatusCode::CREATED, Json(json!({"event": event}))))
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub test_id: Uuid,
    #[serde(default)]
    pub anon_id: Option<String>,
}

/// POST /api/ab/assign
///
/// Experiment entry point: returns the caller's assignment for the test,
/// creating one on first touch. Concurrent first touches converge on the
/// same variant (deterministic pick + uniqueness constraint).
pub async fn assign(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, AbApiError> {
    let request = parse_body::<AssignRequest>(body)?;
    let identity = resolve_identity(&state, &headers, request.anon_id.as_deref())?;

    let assignment = state
        .store
        .get_or_assign(&request.test_id, &identity)
        .map_err(|e| {
            warn!("Assignment creation failed: {:#}", e);
            AbApiError::Storage
        })?
        .ok_or(AbApiError::TestNotFound)?;

    Ok(Json(json!({"assignment": assignment})))
}

#[derive(Debug, Deserialize)]
pub struct CreateTestRequest {
    pub name: String,
    pub variants: Vec<String>,
}

/// POST /api/ab/tests
pub async fn create_test(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AbApiError> {
    let request = parse_body::<CreateTestRequest>(body)?;

    if request.name.trim().is_empty() {
        return Err(AbApiError::InvalidPayload("Test name is required".to_string()));
    }
    if request.variants.is_empty() {
        return Err(AbApiError::InvalidPayload(
            "A test needs at least one variant".to_string(),
        ));
    }

    let (test, variants) = state
        .store
        .create_test(request.name.trim(), &request.variants)
        .map_err(|e| {
            warn!("Failed to create test: {:#}", e);
            AbApiError::Storage
        })?;

    Ok((
        StatusCode::CREATED,
        Json(json!({"test": test, "variants": variants})),
    ))
}

/// GET /api/ab/tests/:test_id/summary
pub async fn test_summary(
    State(state): State<AppState>,
    Path(test_id): Path<Uuid>,
) -> Result<Json<Value>, AbApiError> {
    let test = state
        .store
        .get_test(&test_id)
        .map_err(|_| AbApiError::Storage)?
        .ok_or(AbApiError::TestNotFound)?;

    let variants = state
        .store
        .variant_summary(&test_id)
        .map_err(|_| AbApiError::Storage)?;

    Ok(Json(json!({
        "test_id": test.id,
        "name": test.name,
        "status": test.status,
        "variants": variants,
    })))
}

fn parse_body<T: serde::de::DeserializeOwned>(
    body: Result<Json<Value>, JsonRejection>,
) -> Result<T, AbApiError> {
    let Ok(Json(raw)) = body else {
        return Err(AbApiError::InvalidPayload("Invalid JSON body".to_string()));
    };
    serde_json::from_value(raw)
        .map_err(|e| AbApiError::InvalidPayload(format!("Invalid payload: {}", e)))
}

/// Session subject XOR anon_id; neither is a validation error.
fn resolve_identity(
    state: &AppState,
    headers: &HeaderMap,
    anon_id: Option<&str>,
) -> Result<Identity, AbApiError> {
    if let Some(user_id) = session_user(state, headers) {
        return Ok(Identity::User(user_id));
    }
    match anon_id {
        Some(id) if !id.trim().is_empty() => Ok(Identity::Anon(id.trim().to_string())),
        _ => Err(AbApiError::MissingIdentity),
    }
}
