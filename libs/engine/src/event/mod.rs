//! Event sourcing primitives
//!
//! Stored event envelope and payload enums, the append-only store, and the
//! in-process fan-out hub.

pub mod hub;
pub mod store;
pub mod types;

pub use hub::*;
pub use store::*;
pub use types::*;
