//! # Wire Envelope
//!
//! The canonical JSON document carried on every bridge subject.
//!
//! ## Design Principles
//!
//! 1. **Single Source of Truth**: one envelope shape for every event crossing
//!    the bridge, regardless of resource type.
//! 2. **Idempotency**: `event_id` is the deduplication key on both the
//!    broker (via the `nats-msg-id` header) and the inbox/outbox tables.
//! 3. **Versioning**: `schema_version` is a plain integer — no schema
//!    evolution machinery beyond that (see spec Non-goals).
//!
//! ## Envelope Fields
//!
//! - `event_id`: globally unique identifier, ASCII (idempotency key)
//! - `schema_version`: integer, currently 1
//! - `event_type`: dotted string, e.g. `user.created`
//! - `producer`: logical app name that emitted the event
//! - `resource_type` / `resource_id`: the replicated resource this event is about
//! - `occurred_at`: UTC instant, RFC3339 with fractional seconds
//! - `trace_id`: opaque tracing correlation value
//! - `payload`: structured key/value tree

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current schema version emitted by this crate.
pub const SCHEMA_VERSION: u32 = 1;

/// Wire representation of every event carried across the bridge.
///
/// Two envelopes with equal `event_id` represent the same logical event —
/// this invariant is what makes publish-side and consume-side deduplication
/// correct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Globally unique identifier; the idempotency key.
    pub event_id: String,

    /// Schema version of this envelope shape (currently always 1).
    pub schema_version: u32,

    /// Dotted event type, e.g. `"user.created"`.
    pub event_type: String,

    /// Logical name of the application that produced this event.
    pub producer: String,

    /// Type of the resource this event describes, e.g. `"user"`.
    pub resource_type: String,

    /// Identifier of the resource this event describes.
    pub resource_id: String,

    /// UTC instant the event occurred, RFC3339 with fractional seconds.
    pub occurred_at: DateTime<Utc>,

    /// Opaque tracing correlation value, propagated end to end.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// Event-specific structured payload.
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build a new envelope, auto-generating `event_id` as a UUIDv4 if not
    /// supplied and stamping `occurred_at` with the current time.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        producer: impl Into<String>,
        event_type: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        payload: serde_json::Value,
        event_id: Option<String>,
        trace_id: Option<String>,
    ) -> Self {
        Self {
            event_id: event_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            schema_version: SCHEMA_VERSION,
            event_type: event_type.into(),
            producer: producer.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            occurred_at: Utc::now(),
            trace_id,
            payload,
        }
    }

    /// Encode as canonical JSON bytes for publication.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from raw JSON bytes (strict: any parse failure is an error,
    /// the caller decides whether to fall back to an empty envelope).
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Validate the basic shape of a wire envelope.
///
/// Returns a descriptive error string if a required field is missing or
/// empty. Used by the consumer to decide whether a message is even worth
/// attempting as an `Envelope` before invoking the host handler.
pub fn validate_envelope_fields(value: &serde_json::Value) -> Result<(), String> {
    let event_id = value
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_id")?;
    if event_id.is_empty() {
        return Err("event_id cannot be empty".to_string());
    }

    value
        .get("occurred_at")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid occurred_at")?;

    let producer = value
        .get("producer")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid producer")?;
    if producer.is_empty() {
        return Err("producer cannot be empty".to_string());
    }

    let event_type = value
        .get("event_type")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_type")?;
    if event_type.is_empty() {
        return Err("event_type cannot be empty".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_auto_generates_event_id() {
        let env = Envelope::new(
            "system_a",
            "user.created",
            "user",
            "42",
            json!({"name": "Ada"}),
            None,
            None,
        );
        assert!(!env.event_id.is_empty());
        assert_eq!(env.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn round_trip_is_lossless() {
        let env = Envelope::new(
            "system_a",
            "user.created",
            "user",
            "42",
            json!({"name": "Ada"}),
            Some("fixed-id".to_string()),
            Some("trace-1".to_string()),
        );

        let bytes = env.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();

        assert_eq!(decoded.event_id, "fixed-id");
        assert_eq!(decoded.event_type, "user.created");
        assert_eq!(decoded.producer, "system_a");
        assert_eq!(decoded.resource_type, "user");
        assert_eq!(decoded.resource_id, "42");
        assert_eq!(decoded.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(decoded.payload, json!({"name": "Ada"}));
    }

    #[test]
    fn decode_rejects_malformed_json() {
        assert!(Envelope::decode(b"not json").is_err());
    }

    #[test]
    fn validate_envelope_fields_valid() {
        let v = json!({
            "event_id": "abc",
            "schema_version": 1,
            "event_type": "user.created",
            "producer": "system_a",
            "resource_type": "user",
            "resource_id": "42",
            "occurred_at": "2025-01-29T10:00:00.000Z",
            "payload": {}
        });
        assert!(validate_envelope_fields(&v).is_ok());
    }

    #[test]
    fn validate_envelope_fields_missing_event_id() {
        let v = json!({
            "occurred_at": "2025-01-29T10:00:00.000Z",
            "producer": "system_a",
            "event_type": "user.created"
        });
        assert!(validate_envelope_fields(&v).is_err());
    }

    #[test]
    fn validate_envelope_fields_empty_producer() {
        let v = json!({
            "event_id": "abc",
            "occurred_at": "2025-01-29T10:00:00.000Z",
            "producer": "",
            "event_type": "user.created"
        });
        assert!(validate_envelope_fields(&v).is_err());
    }
}
