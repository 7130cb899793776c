//! Background dispatcher draining outbox rows to the broker (spec §4.2).
//!
//! Grounded in `modules/ar/src/events/publisher.rs` (a polling loop scanning
//! `events_outbox` for `status = 'pending'`, publishing, then updating the
//! row) and `consumer_retry.rs`'s backoff schedule, reused here instead of a
//! second copy of exponential-backoff math.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::broker::{JetStreamBroker, PublishOutcome};
use crate::error::BridgeResult;
use crate::producer::outbox::{DispatchOutcome, OutboxStore};

/// Dispatcher tuning, built from [`crate::config::BridgeConfig`].
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub app_name: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_deliver: u32,
    pub backoff: Vec<Duration>,
}

impl DispatcherSettings {
    fn not_before_delay(&self, attempts: i32) -> Duration {
        crate::consumer_retry::backoff_delay(&self.backoff, attempts.max(1) as u64)
    }
}

/// A single background worker that scans, reserves, and publishes pending
/// outbox rows. Spec §4.2 calls for one worker per process by default; this
/// type is `Clone`-free and meant to be driven by one `tokio::spawn`.
pub struct Dispatcher<S: OutboxStore> {
    store: Arc<S>,
    broker: Arc<dyn JetStreamBroker>,
    settings: DispatcherSettings,
}

impl<S: OutboxStore> Dispatcher<S> {
    pub fn new(store: Arc<S>, broker: Arc<dyn JetStreamBroker>, settings: DispatcherSettings) -> Self {
        Self { store, broker, settings }
    }

    /// Run forever, polling every `poll_interval`. Intended to be spawned as
    /// its own task; the host cancels it by aborting the handle (spec §5's
    /// cooperative-shutdown model applies at the subscription level, not
    /// here, since a dispatch cycle is already bounded).
    pub async fn run(&self) -> BridgeResult<()> {
        loop {
            self.run_once().await?;
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Drain one batch of pending rows. Returns the number processed.
    pub async fn run_once(&self) -> BridgeResult<usize> {
        let rows = self.store.fetch_pending(self.settings.batch_size).await?;
        let n = rows.len();
        for row in rows {
            self.dispatch_one(row).await;
        }
        Ok(n)
    }

    async fn dispatch_one(&self, row: crate::producer::outbox::OutboxRow) {
        let reserved = match self.store.reserve(row.id, row.attempts).await {
            Ok(won) => won,
            Err(e) => {
                error!(event_id = %row.event_id, error = %e, "outbox reservation failed");
                return;
            }
        };
        if !reserved {
            // Lost the CAS race to another dispatcher worker; skip silently.
            return;
        }

        let subject = crate::subject::sync_subject(&self.settings.app_name, &row.destination_app);
        let envelope = crate::envelope::Envelope::new(
            self.settings.app_name.clone(),
            row.event_type.clone(),
            row.resource_type.clone(),
            row.resource_id.clone(),
            row.payload.clone(),
            Some(row.event_id.clone()),
            None,
        );
        let bytes = match envelope.encode() {
            Ok(b) => b,
            Err(e) => {
                error!(event_id = %row.event_id, error = %e, "failed to encode outbox row as envelope");
                return;
            }
        };
        let publish = self.broker.publish(&subject, &row.event_id, bytes).await;

        match publish {
            Ok(PublishOutcome::Published) | Ok(PublishOutcome::Duplicate) => {
                if let Err(e) = self.store.apply_outcome(row.id, DispatchOutcome::Sent).await {
                    error!(event_id = %row.event_id, error = %e, "failed to mark outbox row sent");
                } else {
                    info!(event_id = %row.event_id, subject = %subject, "dispatched outbox row");
                }
            }
            Err(e) => {
                let attempts = row.attempts + 1;
                let outcome = if attempts >= self.settings.max_deliver as i32 {
                    warn!(event_id = %row.event_id, attempts, "outbox row exhausted retries, marking failed");
                    DispatchOutcome::Exhausted { error_message: e.to_string() }
                } else {
                    let not_before = Utc::now() + chrono::Duration::from_std(self.settings.not_before_delay(attempts)).unwrap_or_default();
                    warn!(event_id = %row.event_id, attempts, error = %e, "dispatch failed, will retry");
                    DispatchOutcome::Retry { error_message: e.to_string(), not_before }
                };
                if let Err(e) = self.store.apply_outcome(row.id, outcome).await {
                    error!(event_id = %row.event_id, error = %e, "failed to record dispatch failure");
                }
            }
        }
    }
}
