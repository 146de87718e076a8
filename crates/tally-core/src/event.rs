//! Event data type and payload codec.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;

/// Event payload: a JSON object, opaque to the store.
pub type Payload = serde_json::Map<String, Value>;

/// An immutable record of one state change within a stream.
///
/// Events are built by the caller with the version they claim within their
/// stream, then handed to [`EventStore::push`](crate::store::EventStore::push),
/// which stamps `stream_id` and `recorded_at` exactly once. A recorded event
/// cannot be pushed again.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    id: Uuid,
    stream_id: Option<Uuid>,
    #[serde(rename = "type")]
    event_type: String,
    payload: Payload,
    version: i64,
    occurred_at: DateTime<Utc>,
    recorded_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Creates an unrecorded event with a fresh id, occurring now.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Payload, version: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream_id: None,
            event_type: event_type.into(),
            payload,
            version,
            occurred_at: Utc::now(),
            recorded_at: None,
        }
    }

    /// Creates an unrecorded event from an arbitrary JSON value.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Serialization` if `payload` is not a JSON object.
    pub fn from_json(
        event_type: impl Into<String>,
        payload: Value,
        version: i64,
    ) -> Result<Self, StoreError> {
        Ok(Self::new(event_type, payload_from_value(payload)?, version))
    }

    /// Overrides the generated id.
    #[must_use]
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Overrides the business time the event occurred at.
    #[must_use]
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Globally unique event identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The owning stream, once appended.
    #[must_use]
    pub fn stream_id(&self) -> Option<Uuid> {
        self.stream_id
    }

    /// Type tag used to select projection handlers.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The event payload.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Looks up a single payload field.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// The 1-based version this event claims within its stream.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Business time.
    #[must_use]
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// System time of the successful append.
    #[must_use]
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        self.recorded_at
    }

    /// Returns `true` once the event has been durably appended.
    #[must_use]
    pub fn is_recorded(&self) -> bool {
        self.recorded_at.is_some()
    }

    /// Binds the event to its stream and stamps the append time. Never moves
    /// `recorded_at` before `occurred_at`.
    pub(crate) fn record(&mut self, stream_id: Uuid, now: DateTime<Utc>) {
        self.stream_id = Some(stream_id);
        self.recorded_at = Some(now.max(self.occurred_at));
    }
}

/// Row shape of a stored event, used by repositories to rebuild events.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Unique event identifier.
    pub id: Uuid,
    /// Owning stream.
    pub stream_id: Uuid,
    /// Event type tag.
    pub event_type: String,
    /// Decoded payload.
    pub payload: Payload,
    /// Version within the stream.
    pub version: i64,
    /// Business time.
    pub occurred_at: DateTime<Utc>,
    /// Append time.
    pub recorded_at: DateTime<Utc>,
}

impl From<EventRecord> for Event {
    fn from(record: EventRecord) -> Self {
        Self {
            id: record.id,
            stream_id: Some(record.stream_id),
            event_type: record.event_type,
            payload: record.payload,
            version: record.version,
            occurred_at: record.occurred_at,
            recorded_at: Some(record.recorded_at),
        }
    }
}

/// Encodes a payload as a JSON object string.
///
/// # Errors
///
/// Returns `StoreError::Serialization` if encoding fails.
pub fn encode_payload(payload: &Payload) -> Result<String, StoreError> {
    Ok(serde_json::to_string(payload)?)
}

/// Decodes a JSON object string back into a payload.
///
/// # Errors
///
/// Returns `StoreError::Serialization` for malformed JSON, invalid Unicode
/// escapes (such as lone surrogates), or a document that is not an object.
pub fn decode_payload(json: &str) -> Result<Payload, StoreError> {
    payload_from_value(serde_json::from_str(json)?)
}

/// Narrows a JSON value to an object payload.
///
/// # Errors
///
/// Returns `StoreError::Serialization` if `value` is not an object.
pub fn payload_from_value(value: Value) -> Result<Payload, StoreError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Serialization(format!(
            "event payload must be a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;

    #[test]
    fn test_new_event_is_unrecorded_with_fresh_id() {
        let a = Event::from_json("OrderPlaced", json!({"amount": 100}), 1).unwrap();
        let b = Event::from_json("OrderPlaced", json!({"amount": 100}), 1).unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.stream_id(), None);
        assert_eq!(a.recorded_at(), None);
        assert!(!a.is_recorded());
        assert_eq!(a.field("amount"), Some(&json!(100)));
    }

    #[test]
    fn test_from_json_rejects_non_object_payload() {
        let result = Event::from_json("OrderPlaced", json!([1, 2, 3]), 1);

        match result {
            Err(StoreError::Serialization(message)) => assert!(message.contains("an array")),
            other => panic!("expected Serialization, got {other:?}"),
        }
    }

    #[test]
    fn test_record_never_precedes_occurred_at() {
        let occurred = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let mut event = Event::new("Tick", Payload::new(), 1).with_occurred_at(occurred);
        let stream_id = Uuid::new_v4();

        event.record(stream_id, occurred - Duration::seconds(5));

        assert_eq!(event.stream_id(), Some(stream_id));
        assert_eq!(event.recorded_at(), Some(occurred));
    }

    #[test]
    fn test_decode_payload_round_trips_object() {
        let payload = payload_from_value(json!({"name": "Zoë", "tags": ["a", "b"]})).unwrap();

        let decoded = decode_payload(&encode_payload(&payload).unwrap()).unwrap();

        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_payload_rejects_lone_surrogate() {
        let result = decode_payload(r#"{"name": "\ud800"}"#);

        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }

    #[test]
    fn test_decode_payload_rejects_scalar_document() {
        assert!(matches!(
            decode_payload("42"),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_serializes_type_field_name() {
        let event = Event::from_json("OrderPlaced", json!({}), 1).unwrap();

        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], json!("OrderPlaced"));
        assert_eq!(value["version"], json!(1));
    }
}
