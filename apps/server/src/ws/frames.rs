//! WebSocket frame types

use serde::Deserialize;
use serde_json::json;

use strand_engine::Event;

/// Client-to-server frames; `subscribe` is the only type
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        #[serde(default)]
        data: SubscribeData,
    },
}

/// Subscription selector
#[derive(Debug, Default, Deserialize)]
pub struct SubscribeData {
    /// Aggregate path, e.g. `["flow", "wf-42"]`; empty for type-only
    #[serde(default)]
    pub aggregate_id: Vec<String>,

    /// Event type filter; empty means all types
    #[serde(default)]
    pub event_types: Vec<String>,
}

/// `subscribed` acknowledgement carrying the snapshot and its sequence
#[must_use]
pub fn subscribed_frame(aggregate_id: &[String], data: serde_json::Value, sequence: i64) -> String {
    json!({
        "type": "subscribed",
        "aggregate_id": aggregate_id,
        "data": data,
        "sequence": sequence,
    })
    .to_string()
}

/// One committed event as a wire frame
#[must_use]
pub fn event_frame(event: &Event) -> String {
    json!({
        "type": event.event_type,
        "data": event.data,
        "timestamp": event.timestamp.timestamp_millis(),
        "aggregate_id": event.aggregate_id.segments(),
        "sequence": event.sequence,
    })
    .to_string()
}
