//! Step catalog endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use strand_domain::Step;

use crate::error::ApiError;
use crate::state::AppState;

/// Routes nested under `/api/steps`
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_steps).post(register_step))
        .route(
            "/{step_id}",
            get(get_step).put(update_step).delete(unregister_step),
        )
}

#[derive(Debug, Serialize)]
struct StepList {
    steps: Vec<Step>,
}

/// List all registered steps
async fn list_steps(State(state): State<AppState>) -> Result<Json<StepList>, ApiError> {
    let (engine_state, _) = state
        .engine
        .engine_state()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(StepList {
        steps: engine_state.steps.into_values().collect(),
    }))
}

/// Get one step definition
async fn get_step(
    State(state): State<AppState>,
    Path(step_id): Path<String>,
) -> Result<Json<Step>, ApiError> {
    Ok(Json(state.engine.get_step(&step_id).await?))
}

/// Register a new step
async fn register_step(
    State(state): State<AppState>,
    Json(step): Json<Step>,
) -> Result<(StatusCode, Json<Step>), ApiError> {
    state.engine.register_step(step.clone()).await?;
    Ok((StatusCode::CREATED, Json(step)))
}

/// Replace an existing step definition
async fn update_step(
    State(state): State<AppState>,
    Path(step_id): Path<String>,
    Json(step): Json<Step>,
) -> Result<Json<Step>, ApiError> {
    if step.id != step_id {
        return Err(ApiError::BadRequest(format!(
            "body step id '{}' does not match path '{step_id}'",
            step.id
        )));
    }
    state.engine.update_step(step.clone()).await?;
    Ok(Json(step))
}

/// Remove a step definition
async fn unregister_step(
    State(state): State<AppState>,
    Path(step_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.unregister_step(&step_id).await?;
    Ok(Json(serde_json::json!({ "unregistered": step_id })))
}
