//! Message shapes handed from the subscription loop to the host handler.
//!
//! Grounded in `modules/ar/src/events/envelope.rs`'s `IncomingEvent` (raw
//! bytes + lazily-parsed envelope + delivery metadata) generalized to the
//! fixed [`crate::envelope::Envelope`] shape.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::broker::DeliveryMeta;
use crate::envelope::Envelope;

/// One message as pulled off the broker, before inbox processing.
///
/// `event_id` is derived from the `nats-msg-id` header if present, else the
/// envelope's own `event_id`, else `seq:<stream_sequence>` — spec §4.2 step 2.
pub struct InboxMessage {
    pub raw: Vec<u8>,
    pub envelope: Envelope,
    pub headers: HashMap<String, String>,
    pub event_id: String,
    pub meta: DeliveryMeta,
}

impl InboxMessage {
    pub fn from_delivered(raw: Vec<u8>, headers: HashMap<String, String>, meta: DeliveryMeta) -> Self {
        let envelope = Envelope::decode(&raw).unwrap_or_else(|_| empty_envelope());

        let event_id = headers
            .get(crate::broker::MSG_ID_HEADER)
            .cloned()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                if envelope.event_id.is_empty() {
                    format!("seq:{}", meta.stream_sequence)
                } else {
                    envelope.event_id.clone()
                }
            });

        Self { raw, envelope, headers, event_id, meta }
    }
}

fn empty_envelope() -> Envelope {
    Envelope {
        event_id: String::new(),
        schema_version: 0,
        event_type: String::new(),
        producer: String::new(),
        resource_type: String::new(),
        resource_id: String::new(),
        occurred_at: Utc::now(),
        trace_id: None,
        payload: serde_json::Value::Null,
    }
}

/// Stable view passed to the host-supplied handler (spec §4.3 step 3c).
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: String,
    pub event_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub trace_id: Option<String>,
    pub deliveries: u64,
}

impl Event {
    pub fn from_message(msg: &InboxMessage) -> Self {
        Self {
            event_type: msg.envelope.event_type.clone(),
            event_id: msg.event_id.clone(),
            resource_type: msg.envelope.resource_type.clone(),
            resource_id: msg.envelope.resource_id.clone(),
            payload: msg.envelope.payload.clone(),
            occurred_at: msg.envelope.occurred_at,
            trace_id: msg.envelope.trace_id.clone(),
            deliveries: msg.meta.delivery_count,
        }
    }
}
