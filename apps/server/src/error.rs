//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use strand_engine::{CatalogError, FlowError, PlanError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<CatalogError> for ApiError {
    fn from(error: CatalogError) -> Self {
        match &error {
            CatalogError::Exists(_) | CatalogError::StepInUse(_) => {
                Self::Conflict(error.to_string())
            }
            CatalogError::NotFound(_) => Self::NotFound(error.to_string()),
            CatalogError::Invalid(_) | CatalogError::ScriptCompile { .. } => {
                Self::BadRequest(error.to_string())
            }
            CatalogError::Store(_) | CatalogError::Contention(_) => {
                Self::Internal(error.to_string())
            }
        }
    }
}

impl From<FlowError> for ApiError {
    fn from(error: FlowError) -> Self {
        match &error {
            // An unknown goal step surfaces as 404 on plan and start.
            FlowError::Plan(PlanError::StepNotFound { .. }) | FlowError::NotFound(_) => {
                Self::NotFound(error.to_string())
            }
            FlowError::Plan(PlanError::CyclicPlan { .. })
            | FlowError::InvalidId(_)
            | FlowError::MissingRequired { .. }
            | FlowError::StepNotFound(_)
            | FlowError::ExecutionNotActive(_)
            | FlowError::InvalidToken
            | FlowError::WorkItemTerminal(_)
            | FlowError::FlowTerminal(_) => Self::BadRequest(error.to_string()),
            FlowError::Exists(_) => Self::Conflict(error.to_string()),
            FlowError::Store(_) | FlowError::Contention(_) => Self::Internal(error.to_string()),
        }
    }
}
