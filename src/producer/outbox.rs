//! Transactional outbox: the producer's durable unit of work (spec §3).
//!
//! Grounded in `modules/ar/src/events/outbox.rs` and
//! `modules/gl/src/repos/outbox_repo.rs` (both hand-roll an `events_outbox`
//! table behind a `sqlx::PgPool`, with an `INSERT ... RETURNING` on publish
//! and an `UPDATE` on dispatch outcome). This module lifts that into one
//! reusable `OutboxRow`/`OutboxStore` pair instead of one copy per consuming
//! module, and widens the row to the fuller state machine spec.md asks for:
//! a `status` enum rather than a nullable `published_at`, plus
//! `resource_type`/`resource_id` columns the simpler sources above omit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an [`OutboxRow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

/// Durable unit of work for the producer.
///
/// `event_id` is unique; a row is never deleted by the dispatcher, only
/// transitioned `pending -> sent` or oscillating `pending <-> failed` until
/// a terminal attempt cap (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: i64,
    pub event_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub event_type: String,
    pub destination_app: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub error_message: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Earliest instant this row may be picked up again after a failed
    /// attempt; `None` means it is eligible now.
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields required to stage a new outbox row, supplied inside the caller's
/// own transaction.
#[derive(Debug, Clone)]
pub struct NewOutboxRow {
    pub event_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub event_type: String,
    pub destination_app: String,
    pub payload: serde_json::Value,
}

/// Outcome of one dispatch attempt, applied to a reserved row.
pub enum DispatchOutcome {
    Sent,
    Retry { error_message: String, not_before: DateTime<Utc> },
    Exhausted { error_message: String },
}

/// Storage abstraction for the outbox table.
///
/// Implemented by the Postgres-backed store (`postgres` feature) and by
/// [`crate::testing::InMemoryOutboxStore`] for tests. The dispatcher only
/// ever depends on this trait, never on a concrete database.
#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a new pending row. Returns `Ok(None)` instead of erroring when
    /// `event_id` already exists (the caller already staged this event).
    async fn insert(&self, row: NewOutboxRow) -> crate::error::BridgeResult<Option<OutboxRow>>;

    /// Fetch up to `batch_size` rows eligible for dispatch (`status=pending`
    /// and `not_before` unset or in the past), ordered by `created_at`
    /// ascending.
    async fn fetch_pending(&self, batch_size: usize) -> crate::error::BridgeResult<Vec<OutboxRow>>;

    /// Atomically reserve a row for dispatch: `attempts` is compare-and-swap
    /// incremented keyed on `(id, attempts)` while `status` stays `pending`,
    /// so concurrent dispatchers never double-send but a crash between
    /// `reserve` and `apply_outcome` leaves the row `pending` and eligible
    /// for `fetch_pending` again rather than stuck `sent` without ever having
    /// reached the broker. Returns `true` if this caller won the reservation.
    async fn reserve(&self, id: i64, attempts: i32) -> crate::error::BridgeResult<bool>;

    /// Apply the outcome of a dispatch attempt to a previously reserved row.
    /// `attempts` has already been bumped by `reserve`; this only sets the
    /// terminal/retry state around it.
    async fn apply_outcome(&self, id: i64, outcome: DispatchOutcome) -> crate::error::BridgeResult<()>;
}
