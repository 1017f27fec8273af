//! Strand Domain - Core data model for the orchestration engine
//!
//! Pure serde types shared by the engine and the server: step definitions,
//! execution plans, flows, executions, and work items. No I/O lives here.

pub mod flow;
pub mod ids;
pub mod plan;
pub mod step;

pub use flow::*;
pub use ids::*;
pub use plan::*;
pub use step::*;
