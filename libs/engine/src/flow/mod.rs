//! Flow execution
//!
//! Projection fold for the `flow:<id>` aggregate and the engine that drives
//! plans to completion.

pub mod engine;
pub mod projection;

pub use engine::*;
