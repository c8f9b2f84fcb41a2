//! Incoming events routed through flows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An event collected from a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    /// Event type (e.g., "page-view", "purchase").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Profile the event belongs to, if identified.
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub properties: Value,
    pub time: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            event_type: event_type.into(),
            profile_id: None,
            session_id: None,
            properties: Value::Null,
            time: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_profile(mut self, profile_id: impl Into<String>) -> Self {
        self.profile_id = Some(profile_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = properties;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_format() {
        let event = Event::new("page-view")
            .with_id("e-1")
            .with_profile("p-1")
            .with_properties(json!({"url": "/"}));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "page-view");
        assert_eq!(value["profile_id"], "p-1");
        assert!(value["session_id"].is_null());

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
