//! WebSocket subscription layer
//!
//! Per-client state machine: connect with a placeholder consumer, swap it on
//! `subscribe` frames, and stream events gated by the snapshot sequence.

pub mod client;
pub mod frames;

pub use client::ws_handler;
