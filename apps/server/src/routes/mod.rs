//! API route definitions

pub mod engine;
pub mod flows;
pub mod steps;
pub mod webhook;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the full application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/steps", steps::routes())
        .nest("/api/flows", flows::routes())
        .merge(engine::routes())
        .merge(webhook::routes())
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}
