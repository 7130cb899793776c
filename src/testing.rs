//! In-memory test doubles: a `JetStreamBroker` and `BrokerAdmin` over a
//! shared in-process log, plus in-memory `OutboxStore`/`InboxStore`
//! implementations (spec §2's "Test doubles (in-memory broker)" budget
//! line).
//!
//! Grounded in `inmemory_bus::InMemoryBus` (broadcast-channel pub/sub, the
//! same `*`/`>` wildcard matcher) but widened to model the durable-consumer
//! concepts `InMemoryBus` has no notion of: per-consumer delivery count,
//! nak-with-delay redelivery, and terminal ack — none of which a flat
//! broadcast channel can express. This lets the full
//! producer -> dispatcher -> consumer -> inbox -> DLQ path (spec §8's S1-S6)
//! run without a NATS server or Postgres.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::broker::{AckToken, DeliveredMessage, DeliveryMeta, JetStreamBroker, PublishOutcome, MSG_ID_HEADER};
use crate::consumer::inbox::{IncomingEvent, InboxRow, InboxStatus, InboxStore, Reservation};
use crate::error::{BridgeError, BridgeResult};
use crate::producer::outbox::{DispatchOutcome, NewOutboxRow, OutboxRow, OutboxStatus, OutboxStore};
use crate::topology::BrokerAdmin;

#[derive(Debug, Clone)]
struct StoredMessage {
    subject: String,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
struct DeliveryState {
    delivery_count: u64,
    /// `true` while delivered and awaiting ack/nak/term; `false` once naked
    /// back into the pool (available again at `available_at`).
    in_flight: bool,
    available_at: Instant,
}

#[derive(Default)]
struct ConsumerCursor {
    /// Index into `messages` this consumer has not yet considered for first
    /// delivery.
    next_index: usize,
    /// Per-message-index delivery bookkeeping, keyed by index into `messages`.
    delivered: HashMap<usize, DeliveryState>,
}

struct BrokerState {
    messages: Vec<StoredMessage>,
    dedup_ids: std::collections::HashSet<String>,
    consumers: HashMap<String, ConsumerCursor>,
}

/// In-memory stand-in for a JetStream-backed broker: publish-side msg-id
/// dedup, pull-based fetch bound to a named durable consumer, and
/// ack/nak(delay)/term.
///
/// A message is delivered to a given consumer at most once concurrently;
/// `nak` makes it eligible again after `delay`, `ack`/`term` retire it for
/// that consumer permanently. Delivery count is tracked per consumer, not
/// globally, matching JetStream's per-consumer redelivery semantics.
pub struct InMemoryJetStreamBroker {
    state: Mutex<BrokerState>,
}

impl InMemoryJetStreamBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState {
                messages: Vec::new(),
                dedup_ids: std::collections::HashSet::new(),
                consumers: HashMap::new(),
            }),
        }
    }

    /// All messages ever published to `subject`, in publish order. Test
    /// inspection helper — not part of [`JetStreamBroker`].
    pub fn messages_on(&self, subject: &str) -> Vec<(HashMap<String, String>, Vec<u8>)> {
        let state = self.state.lock().unwrap();
        state
            .messages
            .iter()
            .filter(|m| m.subject == subject)
            .map(|m| (m.headers.clone(), m.payload.clone()))
            .collect()
    }
}

impl Default for InMemoryJetStreamBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JetStreamBroker for InMemoryJetStreamBroker {
    async fn publish(&self, subject: &str, event_id: &str, payload: Vec<u8>) -> BridgeResult<PublishOutcome> {
        let mut state = self.state.lock().unwrap();
        if !state.dedup_ids.insert(event_id.to_string()) {
            return Ok(PublishOutcome::Duplicate);
        }

        let mut headers = HashMap::new();
        headers.insert(MSG_ID_HEADER.to_string(), event_id.to_string());

        state.messages.push(StoredMessage {
            subject: subject.to_string(),
            payload,
            headers,
        });
        Ok(PublishOutcome::Published)
    }

    async fn fetch(
        &self,
        consumer_name: &str,
        filter_subject: &str,
        batch_size: usize,
        _timeout: Duration,
    ) -> BridgeResult<Vec<DeliveredMessage>> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let message_count = state.messages.len();
        let cursor = state.consumers.entry(consumer_name.to_string()).or_default();

        let mut out_indices: Vec<usize> = Vec::new();

        // Redelivery candidates first, in ascending index order.
        let mut redeliverable: Vec<usize> = cursor
            .delivered
            .iter()
            .filter(|(_, ds)| !ds.in_flight && ds.available_at <= now)
            .map(|(idx, _)| *idx)
            .collect();
        redeliverable.sort_unstable();
        for idx in redeliverable {
            if out_indices.len() >= batch_size {
                break;
            }
            out_indices.push(idx);
        }

        // Then new messages matching the filter subject.
        if out_indices.len() < batch_size {
            while cursor.next_index < message_count && out_indices.len() < batch_size {
                let idx = cursor.next_index;
                cursor.next_index += 1;
                if state.messages[idx].subject == filter_subject {
                    out_indices.push(idx);
                }
            }
        }

        let mut out = Vec::with_capacity(out_indices.len());
        for idx in out_indices {
            let ds = cursor.delivered.entry(idx).or_insert(DeliveryState {
                delivery_count: 0,
                in_flight: false,
                available_at: now,
            });
            ds.delivery_count += 1;
            ds.in_flight = true;
            let delivery_count = ds.delivery_count;

            let msg = &state.messages[idx];
            out.push(DeliveredMessage {
                payload: msg.payload.clone(),
                headers: msg.headers.clone(),
                meta: DeliveryMeta {
                    stream: "in-memory".to_string(),
                    stream_sequence: idx as u64,
                    delivery_count,
                    consumer: consumer_name.to_string(),
                },
                ack: AckToken::InMemory { consumer: consumer_name.to_string(), index: idx },
            });
        }

        Ok(out)
    }

    async fn ack(&self, token: AckToken) -> BridgeResult<()> {
        let AckToken::InMemory { consumer, index } = token else {
            return Err(BridgeError::Configuration("nats ack token used against the in-memory broker".to_string()));
        };
        let mut state = self.state.lock().unwrap();
        if let Some(cursor) = state.consumers.get_mut(&consumer) {
            cursor.delivered.remove(&index);
        }
        Ok(())
    }

    async fn nak(&self, token: AckToken, delay: Duration) -> BridgeResult<()> {
        let AckToken::InMemory { consumer, index } = token else {
            return Err(BridgeError::Configuration("nats ack token used against the in-memory broker".to_string()));
        };
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        if let Some(cursor) = state.consumers.get_mut(&consumer) {
            if let Some(ds) = cursor.delivered.get_mut(&index) {
                ds.in_flight = false;
                ds.available_at = now + delay;
            }
        }
        Ok(())
    }

    async fn term(&self, token: AckToken) -> BridgeResult<()> {
        let AckToken::InMemory { consumer, index } = token else {
            return Err(BridgeError::Configuration("nats ack token used against the in-memory broker".to_string()));
        };
        let mut state = self.state.lock().unwrap();
        if let Some(cursor) = state.consumers.get_mut(&consumer) {
            cursor.delivered.remove(&index);
        }
        Ok(())
    }
}

/// In-memory stand-in for the account-wide stream administration surface
/// the topology reconciler needs (spec §4.1).
#[derive(Default)]
pub struct InMemoryBrokerAdmin {
    streams: Mutex<HashMap<String, Vec<String>>>,
}

impl InMemoryBrokerAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a pre-existing stream (simulating one provisioned by another
    /// process) owning `subjects`.
    pub async fn seed_stream(&self, name: &str, subjects: Vec<String>) {
        self.streams.lock().unwrap().insert(name.to_string(), subjects);
    }
}

#[async_trait]
impl BrokerAdmin for InMemoryBrokerAdmin {
    async fn stream_subjects(&self, stream_name: &str) -> BridgeResult<Option<Vec<String>>> {
        Ok(self.streams.lock().unwrap().get(stream_name).cloned())
    }

    async fn foreign_stream_subjects(&self, exclude_stream: &str) -> BridgeResult<Vec<(String, Vec<String>)>> {
        Ok(self
            .streams
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name.as_str() != exclude_stream)
            .map(|(name, subjects)| (name.clone(), subjects.clone()))
            .collect())
    }

    async fn create_stream(&self, stream_name: &str, subjects: Vec<String>) -> BridgeResult<()> {
        self.streams.lock().unwrap().insert(stream_name.to_string(), subjects);
        Ok(())
    }

    async fn update_stream(&self, stream_name: &str, subjects: Vec<String>) -> BridgeResult<()> {
        self.streams.lock().unwrap().insert(stream_name.to_string(), subjects);
        Ok(())
    }
}

struct OutboxState {
    rows: Vec<OutboxRow>,
    next_id: i64,
}

/// In-memory [`OutboxStore`], keyed by `event_id` the same way the real
/// Postgres-backed store's unique index would reject a duplicate insert.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    state: Mutex<OutboxState>,
}

impl Default for OutboxState {
    fn default() -> Self {
        Self { rows: Vec::new(), next_id: 1 }
    }
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row, for test assertions.
    pub fn rows(&self) -> Vec<OutboxRow> {
        self.state.lock().unwrap().rows.clone()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, row: NewOutboxRow) -> BridgeResult<Option<OutboxRow>> {
        let mut state = self.state.lock().unwrap();
        if state.rows.iter().any(|r| r.event_id == row.event_id) {
            return Ok(None);
        }

        let now = chrono::Utc::now();
        let id = state.next_id;
        state.next_id += 1;

        let stored = OutboxRow {
            id,
            event_id: row.event_id,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            event_type: row.event_type,
            destination_app: row.destination_app,
            payload: row.payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            error_message: None,
            published_at: None,
            failed_at: None,
            not_before: None,
            created_at: now,
            updated_at: now,
        };
        state.rows.push(stored.clone());
        Ok(Some(stored))
    }

    async fn fetch_pending(&self, batch_size: usize) -> BridgeResult<Vec<OutboxRow>> {
        let state = self.state.lock().unwrap();
        let now = chrono::Utc::now();
        let mut pending: Vec<OutboxRow> = state
            .rows
            .iter()
            .filter(|r| r.status == OutboxStatus::Pending && r.not_before.map(|nb| nb <= now).unwrap_or(true))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(batch_size);
        Ok(pending)
    }

    async fn reserve(&self, id: i64, attempts: i32) -> BridgeResult<bool> {
        // `status` stays `pending` through the reservation — only `attempts`
        // moves — so a crash between this call and `apply_outcome` leaves the
        // row `pending` and eligible for `fetch_pending` again rather than
        // stuck `sent` without ever having reached the broker.
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.rows.iter_mut().find(|r| r.id == id) {
            if row.status == OutboxStatus::Pending && row.attempts == attempts {
                row.attempts += 1;
                row.updated_at = chrono::Utc::now();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn apply_outcome(&self, id: i64, outcome: DispatchOutcome) -> BridgeResult<()> {
        // `attempts` was already bumped by `reserve`; these only set the
        // resulting terminal/retry state.
        let mut state = self.state.lock().unwrap();
        let Some(row) = state.rows.iter_mut().find(|r| r.id == id) else {
            return Ok(());
        };
        let now = chrono::Utc::now();
        match outcome {
            DispatchOutcome::Sent => {
                row.status = OutboxStatus::Sent;
                row.published_at = Some(now);
                row.updated_at = now;
            }
            DispatchOutcome::Retry { error_message, not_before } => {
                row.status = OutboxStatus::Pending;
                row.error_message = Some(error_message);
                row.not_before = Some(not_before);
                row.updated_at = now;
            }
            DispatchOutcome::Exhausted { error_message } => {
                row.status = OutboxStatus::Failed;
                row.error_message = Some(error_message);
                row.failed_at = Some(now);
                row.updated_at = now;
            }
        }
        Ok(())
    }
}

struct InboxState {
    rows: Vec<InboxRow>,
    next_id: i64,
}

impl Default for InboxState {
    fn default() -> Self {
        Self { rows: Vec::new(), next_id: 1 }
    }
}

/// In-memory [`InboxStore`], keyed by `event_id` exactly like the real
/// Postgres-backed store's unique index.
#[derive(Default)]
pub struct InMemoryInboxStore {
    state: Mutex<InboxState>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row, for test assertions.
    pub fn rows(&self) -> Vec<InboxRow> {
        self.state.lock().unwrap().rows.clone()
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn reserve(&self, event: IncomingEvent, deliveries: u64) -> BridgeResult<Reservation> {
        let mut state = self.state.lock().unwrap();
        let now = chrono::Utc::now();

        if let Some(row) = state.rows.iter_mut().find(|r| r.event_id == event.event_id) {
            if row.status == InboxStatus::Processed {
                return Ok(Reservation::AlreadyProcessed);
            }
            row.status = InboxStatus::Processing;
            row.attempts = deliveries as i32;
            row.updated_at = now;
            return Ok(Reservation::Proceed(row.clone()));
        }

        let id = state.next_id;
        state.next_id += 1;
        let row = InboxRow {
            id,
            event_id: event.event_id,
            resource_type: event.resource_type,
            resource_id: event.resource_id,
            event_type: event.event_type,
            source_app: event.source_app,
            payload: event.payload,
            status: InboxStatus::Processing,
            attempts: deliveries as i32,
            error_message: None,
            processed_at: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
        };
        state.rows.push(row.clone());
        Ok(Reservation::Proceed(row))
    }

    async fn mark_processed(&self, id: i64) -> BridgeResult<()> {
        let mut state = self.state.lock().unwrap();
        let now = chrono::Utc::now();
        if let Some(row) = state.rows.iter_mut().find(|r| r.id == id) {
            row.status = InboxStatus::Processed;
            row.processed_at = Some(now);
            row.updated_at = now;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error_message: String) -> BridgeResult<()> {
        let mut state = self.state.lock().unwrap();
        let now = chrono::Utc::now();
        if let Some(row) = state.rows.iter_mut().find(|r| r.id == id) {
            row.status = InboxStatus::Failed;
            row.error_message = Some(error_message);
            row.failed_at = Some(now);
            row.updated_at = now;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_dedups_by_event_id() {
        let broker = InMemoryJetStreamBroker::new();
        let first = broker.publish("api.sync.worker", "evt-1", b"a".to_vec()).await.unwrap();
        let second = broker.publish("api.sync.worker", "evt-1", b"b".to_vec()).await.unwrap();
        assert_eq!(first, PublishOutcome::Published);
        assert_eq!(second, PublishOutcome::Duplicate);
        assert_eq!(broker.messages_on("api.sync.worker").len(), 1);
    }

    #[tokio::test]
    async fn fetch_delivers_each_message_once_until_acked() {
        let broker = InMemoryJetStreamBroker::new();
        broker.publish("api.sync.worker", "evt-1", b"a".to_vec()).await.unwrap();

        let batch = broker.fetch("c1", "api.sync.worker", 10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].meta.delivery_count, 1);

        let empty = broker.fetch("c1", "api.sync.worker", 10, Duration::from_secs(1)).await.unwrap();
        assert!(empty.is_empty(), "message still in flight, must not redeliver");
    }

    #[tokio::test]
    async fn nak_makes_message_available_again_after_delay() {
        tokio::time::pause();
        let broker = InMemoryJetStreamBroker::new();
        broker.publish("api.sync.worker", "evt-1", b"a".to_vec()).await.unwrap();

        let mut batch = broker.fetch("c1", "api.sync.worker", 10, Duration::from_secs(1)).await.unwrap();
        let delivered = batch.remove(0);
        broker.nak(delivered.ack, Duration::from_millis(50)).await.unwrap();

        let immediate = broker.fetch("c1", "api.sync.worker", 10, Duration::from_secs(1)).await.unwrap();
        assert!(immediate.is_empty());

        tokio::time::advance(Duration::from_millis(60)).await;

        let redelivered = broker.fetch("c1", "api.sync.worker", 10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].meta.delivery_count, 2);
    }

    #[tokio::test]
    async fn outbox_insert_rejects_duplicate_event_id() {
        let store = InMemoryOutboxStore::new();
        let row = NewOutboxRow {
            event_id: "evt-1".to_string(),
            resource_type: "user".to_string(),
            resource_id: "1".to_string(),
            event_type: "user.created".to_string(),
            destination_app: "worker".to_string(),
            payload: serde_json::json!({}),
        };
        assert!(store.insert(row.clone()).await.unwrap().is_some());
        assert!(store.insert(row).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inbox_reserve_is_idempotent_once_processed() {
        let store = InMemoryInboxStore::new();
        let event = IncomingEvent {
            event_id: "evt-1".to_string(),
            resource_type: "user".to_string(),
            resource_id: "1".to_string(),
            event_type: "user.created".to_string(),
            source_app: "api".to_string(),
            payload: serde_json::json!({}),
        };

        let Reservation::Proceed(row) = store.reserve(event.clone(), 1).await.unwrap() else {
            panic!("expected Proceed on first reservation");
        };
        store.mark_processed(row.id).await.unwrap();

        let second = store.reserve(event, 2).await.unwrap();
        assert!(matches!(second, Reservation::AlreadyProcessed));
    }
}
