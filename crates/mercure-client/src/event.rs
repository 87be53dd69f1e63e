//! Typed events delivered by a stream connection

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type used when a frame carries no `event:` field
pub const MESSAGE: &str = "message";
/// Resource created
pub const CREATE: &str = "create";
/// Resource updated
pub const UPDATE: &str = "update";
/// Resource deleted
pub const DELETE: &str = "delete";
/// Subscription patch consumed by the GraphQL bridge
pub const GQL_SUBSCRIPTION: &str = "gqlsubs";

/// Well-known payload field carrying a resource identifier
pub const RESOURCE_ID_FIELD: &str = "@id";

/// One dispatched frame from an event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type (`message` when the frame was untagged)
    #[serde(rename = "type")]
    pub event_type: String,

    /// Frame id, empty when the frame did not carry one
    #[serde(default)]
    pub id: String,

    /// Raw `data:` lines, one entry per line
    #[serde(rename = "dataLines")]
    pub data_lines: Vec<String>,

    /// Data lines that parsed as JSON, in order
    #[serde(rename = "parsedData", default)]
    pub parsed_data: Vec<Value>,
}

impl Event {
    /// Build an event, parsing each data line as JSON.
    ///
    /// Lines that are not JSON are kept in `data_lines` but left out of
    /// `parsed_data`.
    pub fn new(event_type: impl Into<String>, id: impl Into<String>, data_lines: Vec<String>) -> Self {
        let event_type = event_type.into();
        let parsed_data = data_lines
            .iter()
            .filter_map(|line| match serde_json::from_str::<Value>(line) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(event_type = %event_type, error = %e, "Dropping non-JSON data line");
                    None
                }
            })
            .collect();

        Self {
            event_type,
            id: id.into(),
            data_lines,
            parsed_data,
        }
    }

    /// Untyped event with the given data lines
    pub fn message(data_lines: Vec<String>) -> Self {
        Self::new(MESSAGE, "", data_lines)
    }

    /// Check the event type
    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    /// First JSON value of the frame
    pub fn first_data(&self) -> Option<&Value> {
        self.parsed_data.first()
    }

    /// Resource identifier from the first JSON value, read from `field`
    pub fn resource_id(&self, field: &str) -> Option<&str> {
        self.first_data()
            .and_then(|v| v.get(field))
            .and_then(|v| v.as_str())
    }

    /// Whether the frame carried an id
    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }
}
