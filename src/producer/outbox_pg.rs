//! Postgres-backed [`OutboxStore`], gated behind the `postgres` feature.
//!
//! Grounded in `modules/ar/src/events/outbox.rs` (`enqueue_event`,
//! `fetch_unpublished_events`, `mark_as_published` against a plain
//! `sqlx::PgPool`, with a `#[derive(FromRow)]` DTO for the read path) and
//! `modules/gl/src/repos/outbox_repo.rs` (insert inside a caller-supplied
//! `Transaction`). The `status` column is a `TEXT` rather than a
//! nullable `published_at`, since spec.md's fuller state machine
//! (`pending`/`sent`/`failed`) needs more than "is it null" to represent.

use sqlx::{FromRow, PgPool};

use crate::error::{BridgeError, BridgeResult};
use crate::producer::outbox::{DispatchOutcome, NewOutboxRow, OutboxRow, OutboxStatus, OutboxStore};

impl OutboxStatus {
    fn from_db_str(s: &str) -> Self {
        match s {
            "sent" => OutboxStatus::Sent,
            "failed" => OutboxStatus::Failed,
            _ => OutboxStatus::Pending,
        }
    }
}

/// Row shape as read back from `events_outbox`, converted into the public
/// [`OutboxRow`] rather than deriving `FromRow` on the domain type directly
/// — the same DTO/domain-type split `modules/ar/src/events/outbox.rs` uses.
#[derive(Debug, FromRow)]
struct OutboxRowDto {
    id: i64,
    event_id: String,
    resource_type: String,
    resource_id: String,
    event_type: String,
    destination_app: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    error_message: Option<String>,
    published_at: Option<chrono::DateTime<chrono::Utc>>,
    failed_at: Option<chrono::DateTime<chrono::Utc>>,
    not_before: Option<chrono::DateTime<chrono::Utc>>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<OutboxRowDto> for OutboxRow {
    fn from(dto: OutboxRowDto) -> Self {
        OutboxRow {
            id: dto.id,
            event_id: dto.event_id,
            resource_type: dto.resource_type,
            resource_id: dto.resource_id,
            event_type: dto.event_type,
            destination_app: dto.destination_app,
            payload: dto.payload,
            status: OutboxStatus::from_db_str(&dto.status),
            attempts: dto.attempts,
            error_message: dto.error_message,
            published_at: dto.published_at,
            failed_at: dto.failed_at,
            not_before: dto.not_before,
            created_at: dto.created_at,
            updated_at: dto.updated_at,
        }
    }
}

/// `OutboxStore` backed by the `events_outbox` table (see
/// `migrations/0001_jetstream_bridge_tables.sql`).
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new pending row inside the caller's own transaction, so the
    /// outbox write commits atomically with the domain change that caused
    /// it (spec §3's OutboxRow invariant).
    pub async fn insert_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        row: NewOutboxRow,
    ) -> BridgeResult<Option<OutboxRow>> {
        let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM events_outbox WHERE event_id = $1")
            .bind(&row.event_id)
            .fetch_optional(&mut **tx)
            .await?;
        if existing.is_some() {
            return Ok(None);
        }

        let dto: OutboxRowDto = sqlx::query_as(
            r#"
            INSERT INTO events_outbox
                (event_id, resource_type, resource_id, event_type, destination_app, payload, status, attempts)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0)
            RETURNING id, event_id, resource_type, resource_id, event_type, destination_app,
                      payload, status, attempts, error_message, published_at, failed_at,
                      not_before, created_at, updated_at
            "#,
        )
        .bind(&row.event_id)
        .bind(&row.resource_type)
        .bind(&row.resource_id)
        .bind(&row.event_type)
        .bind(&row.destination_app)
        .bind(&row.payload)
        .fetch_one(&mut **tx)
        .await?;

        tracing::debug!(event_id = %dto.event_id, "outbox row staged");
        Ok(Some(dto.into()))
    }
}

#[async_trait::async_trait]
impl OutboxStore for PgOutboxStore {
    async fn insert(&self, row: NewOutboxRow) -> BridgeResult<Option<OutboxRow>> {
        let mut tx = self.pool.begin().await?;
        let result = self.insert_in_tx(&mut tx, row).await?;
        tx.commit().await?;
        Ok(result)
    }

    async fn fetch_pending(&self, batch_size: usize) -> BridgeResult<Vec<OutboxRow>> {
        let rows: Vec<OutboxRowDto> = sqlx::query_as(
            r#"
            SELECT id, event_id, resource_type, resource_id, event_type, destination_app,
                   payload, status, attempts, error_message, published_at, failed_at,
                   not_before, created_at, updated_at
            FROM events_outbox
            WHERE status = 'pending' AND (not_before IS NULL OR not_before <= NOW())
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn reserve(&self, id: i64, attempts: i32) -> BridgeResult<bool> {
        // Compare-and-swap on (id, attempts): only the dispatcher that still
        // sees the row at its last-known attempt count wins the reservation
        // (spec §4.2's "reserves a row by an atomic UPDATE ... keyed on id
        // and attempts"). `status` stays `pending` — only `attempts` moves —
        // so a crash between this call and `apply_outcome` leaves the row
        // `pending` (and thus picked up by `fetch_pending` again) rather than
        // stuck `sent` without ever having reached the broker.
        let result = sqlx::query(
            r#"
            UPDATE events_outbox
            SET attempts = attempts + 1, updated_at = NOW()
            WHERE id = $1 AND status = 'pending' AND attempts = $2
            "#,
        )
        .bind(id)
        .bind(attempts)
        .execute(&self.pool)
        .await
        .map_err(BridgeError::from)?;

        Ok(result.rows_affected() == 1)
    }

    async fn apply_outcome(&self, id: i64, outcome: DispatchOutcome) -> BridgeResult<()> {
        // `attempts` was already bumped by `reserve`; these only set the
        // resulting terminal/retry state.
        match outcome {
            DispatchOutcome::Sent => {
                sqlx::query(
                    "UPDATE events_outbox SET status = 'sent', published_at = NOW(), updated_at = NOW() WHERE id = $1",
                )
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            DispatchOutcome::Retry { error_message, not_before } => {
                sqlx::query(
                    r#"
                    UPDATE events_outbox
                    SET status = 'pending', error_message = $2,
                        not_before = $3, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(error_message)
                .bind(not_before)
                .execute(&self.pool)
                .await?;
            }
            DispatchOutcome::Exhausted { error_message } => {
                sqlx::query(
                    r#"
                    UPDATE events_outbox
                    SET status = 'failed', error_message = $2,
                        failed_at = NOW(), updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(error_message)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }
}
