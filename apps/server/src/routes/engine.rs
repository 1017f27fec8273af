//! Engine state, health, and plan preview endpoints

use std::collections::BTreeMap;

use axum::{extract::State, routing::get, routing::post, Json, Router};
use serde::Deserialize;

use strand_domain::ExecutionPlan;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/engine", get(engine_state))
        .route("/api/engine/health", get(engine_health))
        .route("/api/plan", post(plan_preview))
}

/// Catalog projection plus the sequence clients should subscribe from
async fn engine_state(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let (engine_state, next_sequence) = state
        .engine
        .engine_state()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "steps": engine_state.steps,
        "health": engine_state.health,
        "sequence": next_sequence,
    })))
}

/// Per-step health only
async fn engine_health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let (engine_state, _) = state
        .engine
        .engine_state()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({ "health": engine_state.health })))
}

/// Request to preview a plan without starting a flow
#[derive(Debug, Deserialize)]
struct PlanPreviewRequest {
    goals: Vec<String>,

    #[serde(default)]
    init: BTreeMap<String, serde_json::Value>,
}

/// Derive and return the execution plan for a set of goals
async fn plan_preview(
    State(state): State<AppState>,
    Json(request): Json<PlanPreviewRequest>,
) -> Result<Json<ExecutionPlan>, ApiError> {
    let plan = state
        .engine
        .plan_preview(&request.goals, &request.init)
        .await?;
    Ok(Json(plan))
}
