use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JsonObject;

/// One unit of outbound response data.
///
/// Envelopes are produced by a handler (through [`FunctionContext::emit`]) or
/// synthesized from the handler's direct return value, and are consumed as
/// soon as they are serialized and published.
///
/// [`FunctionContext::emit`]: crate::FunctionContext::emit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The response body.
    pub data: JsonObject,
    /// Broker event time, if the producer wants one attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Creates an envelope without an event time.
    #[must_use]
    pub fn new(data: JsonObject) -> Self {
        Self {
            data,
            event_time: None,
        }
    }

    /// Creates an envelope stamped with the current time.
    #[must_use]
    pub fn stamped_now(data: JsonObject) -> Self {
        Self {
            data,
            event_time: Some(Utc::now()),
        }
    }

    /// Sets the event time.
    #[must_use]
    pub fn with_event_time(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = Some(event_time);
        self
    }

    /// Builds the `{"error": message}` envelope sent back when a request fails.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        let mut data = JsonObject::new();
        data.insert("error".to_string(), serde_json::Value::String(message.into()));
        Self::stamped_now(data)
    }

    /// Serializes the body to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error only if a value inside the map fails to serialize,
    /// which cannot happen for a well-formed `serde_json::Value` tree.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.data)
    }

    /// Event time as milliseconds since the Unix epoch, if set.
    #[must_use]
    pub fn event_timestamp_millis(&self) -> Option<i64> {
        self.event_time.map(|t| t.timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn object(value: serde_json::Value) -> JsonObject {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn new_has_no_event_time() {
        let env = Envelope::new(object(json!({"result": "Hello!"})));
        assert!(env.event_time.is_none());
        assert!(env.event_timestamp_millis().is_none());
    }

    #[test]
    fn payload_is_plain_json_object() {
        let env = Envelope::new(object(json!({"result": "Hello!"})));
        let bytes = env.to_payload().unwrap();
        let back: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, json!({"result": "Hello!"}));
    }

    #[test]
    fn event_timestamp_keeps_millisecond_precision() {
        let t = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let env = Envelope::new(JsonObject::new()).with_event_time(t);
        assert_eq!(env.event_timestamp_millis(), Some(1_700_000_000_123));
    }

    #[test]
    fn datetimes_inside_data_render_as_iso8601() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let mut data = JsonObject::new();
        data.insert("at".to_string(), serde_json::to_value(t).unwrap());
        let bytes = Envelope::new(data).to_payload().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, r#"{"at":"2024-05-01T12:30:00Z"}"#);
    }

    #[test]
    fn error_envelope_shape() {
        let env = Envelope::error("boom");
        assert_eq!(serde_json::Value::Object(env.data), json!({"error": "boom"}));
        assert!(env.event_time.is_some());
    }

    #[test]
    fn debug_dump_carries_iso_event_time() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let env = Envelope::new(object(json!({"n": 1}))).with_event_time(t);
        let dumped = serde_json::to_value(&env).unwrap();
        assert_eq!(dumped["event_time"], json!("2024-05-01T12:30:00Z"));
        assert_eq!(dumped["data"], json!({"n": 1}));

        let bare = serde_json::to_value(Envelope::new(JsonObject::new())).unwrap();
        assert!(bare.get("event_time").is_none());
    }
}
