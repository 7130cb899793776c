//! Postgres-backed [`InboxStore`], gated behind the `postgres` feature.
//!
//! Grounded in `modules/gl/src/repos/processed_repo.rs` (`exists`/`insert`
//! against a `processed_events` table) and `modules/ar/src/events/consumer.rs`'s
//! idempotent-apply helpers, widened to the fuller
//! `pending`/`processing`/`processed`/`failed` state machine spec.md §3
//! describes instead of a bare existence check.

use sqlx::{FromRow, PgPool};

use crate::consumer::inbox::{IncomingEvent, InboxRow, InboxStatus, InboxStore, Reservation};
use crate::error::BridgeResult;

impl InboxStatus {
    fn from_db_str(s: &str) -> Self {
        match s {
            "processing" => InboxStatus::Processing,
            "processed" => InboxStatus::Processed,
            "failed" => InboxStatus::Failed,
            _ => InboxStatus::Pending,
        }
    }
}

#[derive(Debug, FromRow)]
struct InboxRowDto {
    id: i64,
    event_id: String,
    resource_type: String,
    resource_id: String,
    event_type: String,
    source_app: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    error_message: Option<String>,
    processed_at: Option<chrono::DateTime<chrono::Utc>>,
    failed_at: Option<chrono::DateTime<chrono::Utc>>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<InboxRowDto> for InboxRow {
    fn from(dto: InboxRowDto) -> Self {
        InboxRow {
            id: dto.id,
            event_id: dto.event_id,
            resource_type: dto.resource_type,
            resource_id: dto.resource_id,
            event_type: dto.event_type,
            source_app: dto.source_app,
            payload: dto.payload,
            status: InboxStatus::from_db_str(&dto.status),
            attempts: dto.attempts,
            error_message: dto.error_message,
            processed_at: dto.processed_at,
            failed_at: dto.failed_at,
            created_at: dto.created_at,
            updated_at: dto.updated_at,
        }
    }
}

/// `InboxStore` backed by the `events_inbox` table (see
/// `migrations/0001_jetstream_bridge_tables.sql`).
pub struct PgInboxStore {
    pool: PgPool,
}

impl PgInboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// One attempt at `reserve`. Returns `Ok(None)` when this call lost a
    /// concurrent first-insert race (unique violation on `event_id`), so the
    /// caller can retry against the row the winner just created.
    async fn try_reserve_once(&self, event: &IncomingEvent, deliveries: u64) -> BridgeResult<Option<Reservation>> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<InboxRowDto> = sqlx::query_as(
            r#"
            SELECT id, event_id, resource_type, resource_id, event_type, source_app,
                   payload, status, attempts, error_message, processed_at, failed_at,
                   created_at, updated_at
            FROM events_inbox
            WHERE event_id = $1
            FOR UPDATE
            "#,
        )
        .bind(&event.event_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(dto) = existing {
            if dto.status == "processed" {
                tx.commit().await?;
                return Ok(Some(Reservation::AlreadyProcessed));
            }

            let updated: InboxRowDto = sqlx::query_as(
                r#"
                UPDATE events_inbox
                SET status = 'processing', attempts = $2, updated_at = NOW()
                WHERE id = $1
                RETURNING id, event_id, resource_type, resource_id, event_type, source_app,
                          payload, status, attempts, error_message, processed_at, failed_at,
                          created_at, updated_at
                "#,
            )
            .bind(dto.id)
            .bind(deliveries as i32)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            return Ok(Some(Reservation::Proceed(updated.into())));
        }

        let inserted: Result<InboxRowDto, sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO events_inbox
                (event_id, resource_type, resource_id, event_type, source_app, payload, status, attempts)
            VALUES ($1, $2, $3, $4, $5, $6, 'processing', $7)
            RETURNING id, event_id, resource_type, resource_id, event_type, source_app,
                      payload, status, attempts, error_message, processed_at, failed_at,
                      created_at, updated_at
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(&event.event_type)
        .bind(&event.source_app)
        .bind(&event.payload)
        .bind(deliveries as i32)
        .fetch_one(&mut *tx)
        .await;

        match inserted {
            Ok(dto) => {
                tx.commit().await?;
                Ok(Some(Reservation::Proceed(dto.into())))
            }
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await.ok();
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Postgres unique-violation (`23505`), the signal that a concurrent first
/// insert for the same `event_id` won the race.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err.as_database_error().and_then(|d| d.code()), Some(code) if code == "23505")
}

#[async_trait::async_trait]
impl InboxStore for PgInboxStore {
    /// Two concurrent first deliveries of the same `event_id` can both pass
    /// the `SELECT ... FOR UPDATE` lookup (there is no row yet to lock) and
    /// both attempt the INSERT; the unique index on `event_id` is the real
    /// arbiter, so the loser's insert is treated as "someone else already
    /// claimed this event" and retried once against the now-existing row,
    /// rather than surfaced as a store error.
    async fn reserve(&self, event: IncomingEvent, deliveries: u64) -> BridgeResult<Reservation> {
        match self.try_reserve_once(&event, deliveries).await? {
            Some(reservation) => Ok(reservation),
            None => match self.try_reserve_once(&event, deliveries).await? {
                Some(reservation) => Ok(reservation),
                None => Err(crate::error::BridgeError::Store(format!(
                    "inbox reservation for event_id {} lost the insert race twice",
                    event.event_id
                ))),
            },
        }
    }

    async fn mark_processed(&self, id: i64) -> BridgeResult<()> {
        sqlx::query("UPDATE events_inbox SET status = 'processed', processed_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error_message: String) -> BridgeResult<()> {
        sqlx::query(
            r#"
            UPDATE events_inbox
            SET status = 'failed', error_message = $2, failed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
