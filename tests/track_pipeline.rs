//! Integration tests for the tracking pipeline
//!
//! Drives the full flow through the public library surface: experiment
//! seeding -> assignment -> outcome recording -> rollups, plus the
//! never-fail ingestion contract, against a throwaway SQLite database.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use tempfile::NamedTempFile;
use uuid::Uuid;

use coursepulse_backend::{
    api::{ab, analytics as analytics_api, tracking, AppState},
    forward::{CapiForwarder, PosthogForwarder},
    session::SessionVerifier,
    storage::EventStore,
};

fn pipeline_state() -> (AppState, NamedTempFile) {
    let temp_file = NamedTempFile::new().expect("temp db");
    let db_path = temp_file.path().to_str().expect("utf8 path");
    let store = Arc::new(EventStore::new(db_path).expect("open store"));
    let client = reqwest::Client::new();

    let state = AppState {
        store,
        // Both relays unconfigured: forwarding paths are silent no-ops.
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
        sessions: SessionVerifier::new("integration-secret".to_string()),
    };
    (state, temp_file)
}

#[tokio::test]
async fn full_experiment_flow_produces_consistent_rollup() {
    let (state, _temp) = pipeline_state();

    // Seed an experiment through the admin endpoint.
    let (status, Json(created)) = ab::create_test(
        State(state.clone()),
        Ok(Json(json!({
            "name": "checkout-redesign",
            "variants": ["control", "treatment"]
        }))),
    )
    .await
    .expect("create test");
    assert_eq!(status, StatusCode::CREATED);

    let test_id: Uuid = serde_json::from_value(created["test"]["id"].clone()).expect("test id");

    // Ten visitors enter the experiment and each views once.
    let mut purchases = 0;
    for i in 0..10 {
        let anon = format!("visitor-{}", i);

        let Json(assigned) = ab::assign(
            State(state.clone()),
            HeaderMap::new(),
            Ok(Json(json!({"test_id": test_id, "anon_id": anon}))),
        )
        .await
        .expect("assign");

        let variant_id = assigned["assignment"]["variant_id"]
            .as_str()
            .expect("variant id")
            .to_string();

        let (status, _) = ab::track_ab_event(
            State(state.clone()),
            HeaderMap::new(),
            Ok(Json(json!({
                "test_id": test_id,
                "variant_id": variant_id,
                "event_type": "view",
                "anon_id": anon
            }))),
        )
        .await
        .expect("view tracked");
        assert_eq!(status, StatusCode::CREATED);

        // Every third visitor buys.
        if i % 3 == 0 {
            purchases += 1;
            let (status, _) = ab::track_ab_event(
                State(state.clone()),
                HeaderMap::new(),
                Ok(Json(json!({
                    "test_id": test_id,
                    "variant_id": variant_id,
                    "event_type": "purchase",
                    "event_value": 49.0,
                    "anon_id": anon
                }))),
            )
            .await
            .expect("purchase tracked");
            assert_eq!(status, StatusCode::CREATED);
        }
    }

    let Json(summary) = ab::test_summary(State(state.clone()), Path(test_id))
        .await
        .expect("summary");

    let variants = summary["variants"].as_array().expect("variants array");
    assert_eq!(variants.len(), 2);

    let total_views: i64 = variants.iter().map(|v| v["views"].as_i64().unwrap()).sum();
    let total_purchases: i64 = variants
        .iter()
        .map(|v| v["purchases"].as_i64().unwrap())
        .sum();
    let total_revenue: f64 = variants
        .iter()
        .map(|v| v["revenue"].as_f64().unwrap())
        .sum();

    assert_eq!(total_views, 10);
    assert_eq!(total_purchases, purchases);
    assert!((total_revenue - purchases as f64 * 49.0).abs() < 1e-9);
}

#[tokio::test]
async fn ingestion_never_fails_the_caller() {
    let (state, temp) = pipeline_state();

    // Healthy path first.
    let (status, Json(body)) = tracking::track_event(
        State(state.clone()),
        HeaderMap::new(),
        Ok(Json(json!({"event": "page_view", "properties": {"page": "/pricing"}}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(state.store.count_tracking_events(), 1);

    // Now break persistence out from under the handler.
    let saboteur = rusqlite::Connection::open(temp.path()).expect("second connection");
    saboteur
        .execute("DROP TABLE tracking_events", [])
        .expect("drop table");

    let (status, Json(body)) = tracking::track_event(
        State(state),
        HeaderMap::new(),
        Ok(Json(json!({"event": "page_view"}))),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
}

#[tokio::test]
async fn rejected_ab_events_leave_no_rows_behind() {
    let (state, _temp) = pipeline_state();

    let (test, variants) = state
        .store
        .create_test("hero-copy", &["a".to_string(), "b".to_string()])
        .expect("seed test");

    // No identity at all -> 400.
    let err = ab::track_ab_event(
        State(state.clone()),
        HeaderMap::new(),
        Ok(Json(json!({
            "test_id": test.id,
            "variant_id": variants[0].id,
            "event_type": "view"
        }))),
    )
    .await
    .unwrap_err();
    assert_eq!(
        axum::response::IntoResponse::into_response(err).status(),
        StatusCode::BAD_REQUEST
    );

    // Identity without an assignment -> 404.
    let err = ab::track_ab_event(
        State(state.clone()),
        HeaderMap::new(),
        Ok(Json(json!({
            "test_id": test.id,
            "variant_id": variants[0].id,
            "event_type": "view",
            "anon_id": "stranger"
        }))),
    )
    .await
    .unwrap_err();
    assert_eq!(
        axum::response::IntoResponse::into_response(err).status(),
        StatusCode::NOT_FOUND
    );

    assert_eq!(state.store.count_ab_events(), 0);
}

#[tokio::test]
async fn billing_mirror_feeds_revenue_rollups() {
    let (state, _temp) = pipeline_state();

    for (id, price_cents, interval, status) in [
        ("sub_a", 2900, "month", "active"),
        ("sub_b", 29900, "year", "active"),
        ("sub_c", 9900, "month", "canceled"),
    ] {
        let (code, _) = analytics_api::upsert_subscription(
            State(state.clone()),
            Ok(Json(json!({
                "id": id,
                "user_id": format!("user-{}", id),
                "price_cents": price_cents,
                "interval": interval,
                "status": status,
                "created_at": "2025-05-01T00:00:00Z"
            }))),
        )
        .await
        .expect("upsert");
        assert_eq!(code, StatusCode::OK);
    }

    let Json(summary) = analytics_api::get_mrr(State(state.clone()))
        .await
        .expect("mrr");
    assert_eq!(summary.active_subscriptions, 2);
    assert_eq!(summary.mrr, 53.92);

    let Json(cohorts) = analytics_api::get_ltv(State(state)).await.expect("ltv");
    assert_eq!(cohorts.len(), 1);
    assert_eq!(cohorts[0].cohort, "2025-05");
    assert_eq!(cohorts[0].subscribers, 3);
    // Canceled sub_c counts toward cohort size but not revenue.
    assert_eq!(cohorts[0].mrr, 53.92);
}

#[tokio::test]
async fn concurrent_assignments_converge_on_one_row() {
    let (state, _temp) = pipeline_state();

    let (test, _) = state
        .store
        .create_test("paywall", &["a".to_string(), "b".to_string()])
        .expect("seed test");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let state = state.clone();
        let test_id = test.id;
        handles.push(tokio::spawn(async move {
            let Json(body) = ab::assign(
                State(state),
                HeaderMap::new(),
                Ok(Json(json!({"test_id": test_id, "anon_id": "same-visitor"}))),
            )
            .await
            .expect("assign");
            body["assignment"]["id"].as_str().unwrap().to_string()
        }));
    }

    let mut ids = Vec::new();
    for h in handles {
        ids.push(h.await.expect("join"));
    }
    ids.dedup();
    assert_eq!(ids.len(), 1, "all concurrent assigns must return the same row");
}
