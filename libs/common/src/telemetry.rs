//! Telemetry and logging initialization

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize tracing/logging for the process.
///
/// Uses `RUST_LOG` for filtering (default `info,strand_engine=debug`).
/// Outputs JSON when `RUST_LOG_FORMAT=json`, pretty format otherwise.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,strand_engine=debug"));

    let fmt_layer = if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        fmt::layer()
            .json()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        fmt::layer().pretty().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
