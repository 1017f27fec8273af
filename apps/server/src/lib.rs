//! Strand Server - HTTP and WebSocket surface
//!
//! Thin axum layer over the engine: REST endpoints for the catalog, plans,
//! and flows, the async webhook callback, and the WebSocket subscription
//! layer.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

pub use config::ServerConfig;
pub use error::ApiError;
pub use state::AppState;
