//! Deduplicating inbox: the consumer's durable unit of idempotency (spec §3).
//!
//! Grounded in `modules/gl/src/repos/processed_repo.rs` /
//! `modules/ar/src/events/consumer.rs` (both hand-roll a `processed_events`
//! table keyed by `event_id`, checked before applying a handler), widened to
//! the fuller state machine spec.md describes (`pending`/`processing`/
//! `processed`/`failed` instead of a bare "exists" check).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an [`InboxRow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboxStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

/// Persistent unit of deduplication and durability for the consumer.
///
/// `event_id` is the unique deduplication key; `processed` is terminal,
/// `processing` a transient reservation held while the handler runs
/// (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxRow {
    pub id: i64,
    pub event_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub event_type: String,
    pub source_app: String,
    pub payload: serde_json::Value,
    pub status: InboxStatus,
    pub attempts: i32,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Always stamped on every write (see the open question on
    /// dynamic-column detection in the design notes — this implementation
    /// always timestamps rather than making it conditional).
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to reserve (or find) an inbox row for one delivery.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub event_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub event_type: String,
    pub source_app: String,
    pub payload: serde_json::Value,
}

/// What the reservation step told the subscription loop to do next.
pub enum Reservation {
    /// A fresh or previously-failed row is now `processing`; run the handler.
    Proceed(InboxRow),
    /// The event was already `processed` — ack immediately, skip the handler.
    AlreadyProcessed,
}

/// Storage abstraction for the inbox table.
#[async_trait::async_trait]
pub trait InboxStore: Send + Sync {
    /// Look up or create the row for `event.event_id`, transitioning it to
    /// `processing` unless it is already `processed`.
    async fn reserve(&self, event: IncomingEvent, deliveries: u64) -> crate::error::BridgeResult<Reservation>;

    /// Mark a row `processed`.
    async fn mark_processed(&self, id: i64) -> crate::error::BridgeResult<()>;

    /// Mark a row `failed` with the given error, recording the attempt.
    async fn mark_failed(&self, id: i64, error_message: String) -> crate::error::BridgeResult<()>;
}
