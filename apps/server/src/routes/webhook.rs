//! Async step webhook callback
//!
//! Steps dispatched asynchronously complete by POSTing back to
//! `/webhook/{flow_id}/{step_id}/{token}`. The token is the work item's
//! authenticator; every resolution failure is a 400 so tokens cannot be
//! probed for existence.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde::Deserialize;

use strand_engine::FlowError;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/webhook/{flow_id}/{step_id}/{token}", post(webhook))
}

/// Webhook payload from the step service
#[derive(Debug, Deserialize)]
struct WebhookBody {
    success: bool,

    #[serde(default)]
    outputs: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    error: Option<String>,
}

fn webhook_error(error: FlowError) -> ApiError {
    match error {
        FlowError::Store(_) | FlowError::Contention(_) => ApiError::Internal(error.to_string()),
        // Unknown flows, steps, tokens, and terminal work items all look
        // the same from outside.
        other => ApiError::BadRequest(other.to_string()),
    }
}

/// Resolve the (flow, step, token) triple and record the outcome
async fn webhook(
    State(state): State<AppState>,
    Path((flow_id, step_id, token)): Path<(String, String, String)>,
    Json(body): Json<WebhookBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.success {
        state
            .engine
            .complete_work(&flow_id, &step_id, &token, body.outputs)
            .await
            .map_err(webhook_error)?;
    } else {
        let error = body.error.unwrap_or_else(|| "step reported failure".to_string());
        state
            .engine
            .fail_work(&flow_id, &step_id, &token, error)
            .await
            .map_err(webhook_error)?;
    }

    Ok(Json(serde_json::json!({ "status": "ok" })))
}
