//! # JetStream Broker Seam
//!
//! The minimal surface the producer dispatcher and consumer subscription
//! loop need from a JetStream-like broker: publish with msg-id dedup, pull a
//! batch of messages bound to a durable consumer, and acknowledge
//! (ack/nak/term) each one.
//!
//! Neither `nats_bus::NatsBus` nor `inmemory_bus::InMemoryBus` model this —
//! both only do core pub/sub, with no notion of durable consumers,
//! redelivery counts, or acknowledgement. This seam is built fresh, grounded
//! in the `async_nats::jetstream` shapes used by
//! `sgttomas-solver-ralph/crates/sr-adapters/src/nats.rs` (`get_or_create_consumer`,
//! `fetch().max_messages(n).messages()`, `msg.ack()`/`ack_with(AckKind::Nak(..))`)
//! and `other_examples/.../cim-infrastructure__src-jetstream.rs` (building a
//! `stream::Config`, publishing with a `nats-msg-id` header).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BridgeResult;

/// Header key the broker uses for publish-side deduplication.
pub const MSG_ID_HEADER: &str = "nats-msg-id";

/// Result of a single publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted and appended to the stream.
    Published,
    /// Rejected by the broker's msg-id dedup window — not an error.
    Duplicate,
}

/// Per-message broker metadata exposed to the consumer (spec's `DeliveryMeta`).
#[derive(Debug, Clone)]
pub struct DeliveryMeta {
    pub stream: String,
    pub stream_sequence: u64,
    pub delivery_count: u64,
    pub consumer: String,
}

/// Opaque handle bound to one delivered message, required to ack/nak/term it.
///
/// Carries a backend-specific payload rather than exposing one; the real
/// `async_nats::jetstream::Message` has no public way to be reconstructed
/// from parts, so it is stored whole in the `Nats` variant and driven
/// directly via its own `ack`/`ack_with` methods. The in-memory backend
/// carries just enough to find its way back into the test double's state.
pub enum AckToken {
    Nats(Box<async_nats::jetstream::Message>),
    InMemory { consumer: String, index: usize },
}

/// One message pulled from a durable consumer, not yet acknowledged.
pub struct DeliveredMessage {
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub meta: DeliveryMeta,
    pub ack: AckToken,
}

/// Minimal JetStream-like broker surface used by the producer dispatcher and
/// consumer subscription loop.
#[async_trait]
pub trait JetStreamBroker: Send + Sync {
    /// Publish `payload` to `subject` with `event_id` as the dedup key.
    async fn publish(
        &self,
        subject: &str,
        event_id: &str,
        payload: Vec<u8>,
    ) -> BridgeResult<PublishOutcome>;

    /// Pull up to `batch_size` messages bound to `consumer_name`, filtered to
    /// `filter_subject`, waiting at most `timeout` for at least one message.
    async fn fetch(
        &self,
        consumer_name: &str,
        filter_subject: &str,
        batch_size: usize,
        timeout: Duration,
    ) -> BridgeResult<Vec<DeliveredMessage>>;

    /// Acknowledge successful processing.
    async fn ack(&self, token: AckToken) -> BridgeResult<()>;

    /// Negative-acknowledge, requesting redelivery after `delay`.
    async fn nak(&self, token: AckToken, delay: Duration) -> BridgeResult<()>;

    /// Permanently acknowledge without success — no further redelivery.
    async fn term(&self, token: AckToken) -> BridgeResult<()>;
}
