//! Strand Engine - event-sourced workflow orchestration core
//!
//! Provides the event store and hub, the aggregator seam, the step catalog,
//! the execution planner, the flow engine, the step invoker, and the health
//! supervisor. The [`Engine`] handle wires them together for the server.

pub mod aggregate;
pub mod catalog;
pub mod engine;
pub mod event;
pub mod flow;
pub mod health;
pub mod invoke;
pub mod planner;

pub use aggregate::*;
pub use catalog::*;
pub use engine::*;
pub use event::*;
pub use flow::*;
pub use health::*;
pub use invoke::*;
pub use planner::*;
