//! Flow endpoints

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use strand_domain::{Flow, FlowStatus};
use strand_engine::{FlowQuery, FlowSort, StartFlow};

use crate::error::ApiError;
use crate::state::AppState;

/// Routes nested under `/api/flows`
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_flows).post(start_flow))
        .route("/{flow_id}", get(get_flow))
}

/// Start a new flow
async fn start_flow(
    State(state): State<AppState>,
    Json(request): Json<StartFlow>,
) -> Result<(StatusCode, Json<Flow>), ApiError> {
    let flow = state.engine.start_flow(request).await?;
    Ok((StatusCode::CREATED, Json(flow)))
}

/// Fetch one flow's current state
async fn get_flow(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
) -> Result<Json<Flow>, ApiError> {
    Ok(Json(state.engine.get_flow(&flow_id).await?))
}

/// Query parameters for listing flows.
///
/// `statuses` is comma-separated; `labels` is comma-separated `key=value`
/// pairs, all of which must match.
#[derive(Debug, Default, Deserialize)]
struct ListFlowsParams {
    statuses: Option<String>,
    labels: Option<String>,
    id_prefix: Option<String>,
    sort: Option<FlowSort>,
    limit: Option<usize>,
}

fn parse_status(raw: &str) -> Result<FlowStatus, ApiError> {
    match raw {
        "active" => Ok(FlowStatus::Active),
        "completed" => Ok(FlowStatus::Completed),
        "failed" => Ok(FlowStatus::Failed),
        other => Err(ApiError::BadRequest(format!("unknown status '{other}'"))),
    }
}

fn parse_labels(raw: &str) -> Result<BTreeMap<String, String>, ApiError> {
    raw.split(',')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| {
                    ApiError::BadRequest(format!("label filter '{pair}' is not key=value"))
                })
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct FlowList {
    flows: Vec<Flow>,
}

/// List flows matching the query
async fn list_flows(
    State(state): State<AppState>,
    Query(params): Query<ListFlowsParams>,
) -> Result<Json<FlowList>, ApiError> {
    let statuses = params
        .statuses
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(parse_status)
        .collect::<Result<Vec<_>, _>>()?;
    let labels = params
        .labels
        .as_deref()
        .map(parse_labels)
        .transpose()?
        .unwrap_or_default();

    let query = FlowQuery {
        labels,
        statuses,
        id_prefix: params.id_prefix,
        sort: params.sort.unwrap_or_default(),
        limit: params.limit,
    };
    let flows = state.engine.query_flows(&query).await?;
    Ok(Json(FlowList { flows }))
}
