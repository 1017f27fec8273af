//! Common utilities for Strand
//!
//! Shared telemetry initialization for the server and test binaries.

pub mod telemetry;

pub use telemetry::init_tracing;
