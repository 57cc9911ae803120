//! REST control surface for endpoint management.
//!
//! ```text
//! GET  /api/endpoints/status               all endpoints
//! GET  /api/endpoints/status/{model_type}  one endpoint (404 unknown tag)
//! POST /api/endpoints/wake                 wake both, per-endpoint outcomes
//! POST /api/endpoints/wake/{model_type}    wake one
//! POST /api/endpoints/sleep                sleep both, per-endpoint outcomes
//! POST /api/endpoints/sleep/{model_type}   sleep one
//! ```
//!
//! Batch operations always answer 200; partial failure lives in the body.
//! Single-endpoint operations surface failures as HTTP errors with a JSON
//! envelope.

mod error;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::endpoints::{
    EndpointError, EndpointSnapshot, EndpointStatus, EndpointTracker, LifecycleManager,
    ModelVariant,
};

pub use error::ErrorEnvelope;
use error::{endpoint_error_response, unknown_variant_response};

/// Handles shared by every handler.
#[derive(Clone)]
pub struct ApiState {
    pub tracker: Arc<EndpointTracker>,
    pub manager: Arc<LifecycleManager>,
}

/// Build the `/api` router.
pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/endpoints/status", get(all_status))
        .route("/endpoints/status/{model_type}", get(one_status))
        .route("/endpoints/wake", post(wake_all))
        .route("/endpoints/wake/{model_type}", post(wake_one))
        .route("/endpoints/sleep", post(sleep_all))
        .route("/endpoints/sleep/{model_type}", post(sleep_one));
    Router::new().nest("/api", api).with_state(state)
}

// ---------------------------------------------------------------------------
// Wire views
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct EndpointView {
    status: EndpointStatus,
    url: String,
    last_activity: Option<DateTime<Utc>>,
    wake_time: Option<DateTime<Utc>>,
    sleep_time: Option<DateTime<Utc>>,
    /// Seconds until the auto-sleep sweeper may evict this endpoint.
    auto_sleep_in_seconds: Option<i64>,
    in_flight: u32,
}

impl From<EndpointSnapshot> for EndpointView {
    fn from(snapshot: EndpointSnapshot) -> Self {
        let auto_sleep_in_seconds = snapshot
            .auto_sleep_deadline
            .map(|deadline| (deadline - Utc::now()).num_seconds().max(0));
        Self {
            status: snapshot.status,
            url: snapshot.url,
            last_activity: snapshot.last_activity,
            wake_time: snapshot.wake_time,
            sleep_time: snapshot.sleep_time,
            auto_sleep_in_seconds,
            in_flight: snapshot.in_flight,
        }
    }
}

#[derive(Debug, Serialize)]
struct ActionOutcome {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    /// Post-operation status.
    status: EndpointStatus,
}

type ApiError = (StatusCode, Json<ErrorEnvelope>);

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn all_status(State(state): State<ApiState>) -> Json<BTreeMap<String, EndpointView>> {
    let views = state
        .tracker
        .snapshot_all()
        .into_iter()
        .map(|snapshot| (snapshot.id.as_str().to_string(), EndpointView::from(snapshot)))
        .collect();
    Json(views)
}

async fn one_status(
    State(state): State<ApiState>,
    Path(model_type): Path<String>,
) -> Result<Json<EndpointView>, ApiError> {
    let variant = parse_variant(&model_type)?;
    let snapshot = state
        .tracker
        .get_status(variant)
        .map_err(|e| endpoint_error_response(&e))?;
    Ok(Json(snapshot.into()))
}

async fn wake_all(State(state): State<ApiState>) -> Json<BTreeMap<String, ActionOutcome>> {
    let results = state.manager.wake_all().await;
    Json(outcome_map(&state, results))
}

async fn sleep_all(State(state): State<ApiState>) -> Json<BTreeMap<String, ActionOutcome>> {
    let results = state.manager.sleep_all().await;
    Json(outcome_map(&state, results))
}

async fn wake_one(
    State(state): State<ApiState>,
    Path(model_type): Path<String>,
) -> Result<Json<ActionOutcome>, ApiError> {
    let variant = parse_variant(&model_type)?;
    state
        .manager
        .wake(variant)
        .await
        .map_err(|e| endpoint_error_response(&e))?;
    Ok(Json(outcome(&state, variant, Ok(()))))
}

async fn sleep_one(
    State(state): State<ApiState>,
    Path(model_type): Path<String>,
) -> Result<Json<ActionOutcome>, ApiError> {
    let variant = parse_variant(&model_type)?;
    state
        .manager
        .sleep(variant)
        .await
        .map_err(|e| endpoint_error_response(&e))?;
    Ok(Json(outcome(&state, variant, Ok(()))))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_variant(tag: &str) -> Result<ModelVariant, ApiError> {
    ModelVariant::from_tag(tag).ok_or_else(|| unknown_variant_response(tag))
}

fn outcome(
    state: &ApiState,
    id: ModelVariant,
    result: Result<(), EndpointError>,
) -> ActionOutcome {
    let status = state
        .tracker
        .get_status(id)
        .map(|snapshot| snapshot.status)
        .unwrap_or(EndpointStatus::Unknown);
    match result {
        Ok(()) => ActionOutcome {
            ok: true,
            error: None,
            status,
        },
        Err(e) => ActionOutcome {
            ok: false,
            error: Some(e.to_string()),
            status,
        },
    }
}

fn outcome_map(
    state: &ApiState,
    results: Vec<(ModelVariant, Result<(), EndpointError>)>,
) -> BTreeMap<String, ActionOutcome> {
    results
        .into_iter()
        .map(|(id, result)| (id.as_str().to_string(), outcome(state, id, result)))
        .collect()
}
