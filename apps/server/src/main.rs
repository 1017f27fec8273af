//! Strand Server - main entry point

use anyhow::Result;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use strand_common::init_tracing;
use strand_engine::Engine;
use strand_server::{routes, AppState, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    dotenvy::dotenv().ok();

    let config = ServerConfig::from_env()?;
    let engine = Engine::in_memory(config.engine_config());
    let health_task = engine.spawn_health();

    let state = AppState::new(engine);
    let app = routes::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting Strand server on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    health_task.await.ok();
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolve on ctrl-c, tearing down background work so in-flight WebSocket
/// loops observe cancellation and the serve future can drain.
async fn shutdown_signal(state: AppState) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down");
    state.clients.shutdown();
    state.engine.shutdown();
}
