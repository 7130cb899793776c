//! Pull-based subscription loop (spec §4.3).
//!
//! Grounds the fetch/process/ack cycle in `modules/ar/src/consumer_tasks.rs`
//! (per-message `tracing::info_span!`, retry-then-DLQ branching) and the
//! `async_nats::jetstream` fetch shape used by
//! `sgttomas-solver-ralph/crates/sr-adapters/src/nats.rs`
//! (`fetch().max_messages(n).messages()`, `ack()`/`ack_with(AckKind::Nak(..))`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, info_span, warn, Instrument};

use crate::broker::{AckToken, JetStreamBroker};
use crate::consumer::inbox::{IncomingEvent, InboxStore, Reservation};
use crate::consumer::message::{Event, InboxMessage};
use crate::error::BridgeResult;

/// User-supplied processing logic. One handler per subscription.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<(), String>;
}

/// Backoff, batching, and DLQ configuration a subscription runs with. Built
/// from [`crate::config::BridgeConfig`] at `subscribe` time.
#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    pub consumer_name: String,
    pub filter_subject: String,
    pub dlq_subject: String,
    pub batch_size: usize,
    pub fetch_timeout: Duration,
    pub max_deliver: u32,
    pub backoff: Vec<Duration>,
    pub use_inbox: bool,
    pub use_dlq: bool,
}

impl SubscriptionSettings {
    /// `backoff[min(deliveries - 1, backoff.len() - 1)]` — spec §4.3 step 3e.
    fn delay_for(&self, deliveries: u64) -> Duration {
        crate::consumer_retry::backoff_delay(&self.backoff, deliveries)
    }
}

/// A running (or not-yet-started) pull subscription.
pub struct Subscription {
    broker: Arc<dyn JetStreamBroker>,
    inbox: Option<Arc<dyn InboxStore>>,
    handler: Arc<dyn Handler>,
    settings: SubscriptionSettings,
    shutdown: Arc<tokio::sync::Notify>,
}

impl Subscription {
    pub fn new(
        broker: Arc<dyn JetStreamBroker>,
        inbox: Option<Arc<dyn InboxStore>>,
        handler: Arc<dyn Handler>,
        settings: SubscriptionSettings,
    ) -> Self {
        Self {
            broker,
            inbox,
            handler,
            settings,
            shutdown: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Signal the loop to stop after it finishes its current batch.
    pub fn shutdown_handle(&self) -> Arc<tokio::sync::Notify> {
        self.shutdown.clone()
    }

    /// Run until `shutdown_handle().notify_one()` is called. Each fetched
    /// batch is drained to completion (every message ACKed, NAKed, or
    /// TERMed) before the shutdown flag is checked again.
    pub async fn run(&self) -> BridgeResult<()> {
        loop {
            let shutdown = self.shutdown.notified();
            tokio::pin!(shutdown);

            tokio::select! {
                _ = &mut shutdown => {
                    info!(consumer = %self.settings.consumer_name, "subscription shutting down");
                    return Ok(());
                }
                batch = self.broker.fetch(
                    &self.settings.consumer_name,
                    &self.settings.filter_subject,
                    self.settings.batch_size,
                    self.settings.fetch_timeout,
                ) => {
                    for delivered in batch? {
                        self.process_one(delivered).await;
                    }
                }
            }
        }
    }

    /// Run exactly one fetch-and-process cycle, returning the number of
    /// messages handled. Used by tests that don't want a long-lived loop.
    pub async fn run_once(&self) -> BridgeResult<usize> {
        let batch = self
            .broker
            .fetch(
                &self.settings.consumer_name,
                &self.settings.filter_subject,
                self.settings.batch_size,
                self.settings.fetch_timeout,
            )
            .await?;
        let n = batch.len();
        for delivered in batch {
            self.process_one(delivered).await;
        }
        Ok(n)
    }

    async fn process_one(&self, delivered: crate::broker::DeliveredMessage) {
        let crate::broker::DeliveredMessage { payload, headers, meta, ack } = delivered;
        let inbox_msg = InboxMessage::from_delivered(payload.clone(), headers, meta.clone());

        let span = info_span!(
            "process_event",
            event_id = %inbox_msg.event_id,
            subject = %self.settings.filter_subject,
            consumer = %self.settings.consumer_name,
            deliveries = meta.delivery_count,
        );

        self.process_one_inner(inbox_msg, payload, ack).instrument(span).await
    }

    async fn process_one_inner(
        &self,
        inbox_msg: InboxMessage,
        raw: Vec<u8>,
        ack: AckToken,
    ) {
        let deliveries = inbox_msg.meta.delivery_count;
        let event_id = inbox_msg.event_id.clone();

        let reservation = if let Some(store) = &self.inbox {
            let incoming = IncomingEvent {
                event_id: event_id.clone(),
                resource_type: inbox_msg.envelope.resource_type.clone(),
                resource_id: inbox_msg.envelope.resource_id.clone(),
                event_type: inbox_msg.envelope.event_type.clone(),
                source_app: inbox_msg.envelope.producer.clone(),
                payload: inbox_msg.envelope.payload.clone(),
            };
            match store.reserve(incoming, deliveries).await {
                Ok(r) => Some(r),
                Err(e) => {
                    error!(event_id = %event_id, error = %e, "inbox reservation failed, message left for redelivery");
                    let _ = self.broker.nak(ack, self.settings.delay_for(deliveries)).await;
                    return;
                }
            }
        } else {
            None
        };

        if let Some(Reservation::AlreadyProcessed) = reservation {
            info!(event_id = %event_id, "duplicate delivery of already-processed event, acking");
            let _ = self.broker.ack(ack).await;
            return;
        }

        let row_id = match &reservation {
            Some(Reservation::Proceed(row)) => Some(row.id),
            _ => None,
        };

        let event = Event::from_message(&inbox_msg);
        let result = self.handler.handle(event).await;

        match result {
            Ok(()) => {
                if let (Some(store), Some(id)) = (&self.inbox, row_id) {
                    if let Err(e) = store.mark_processed(id).await {
                        error!(event_id = %event_id, error = %e, "failed to mark inbox row processed");
                    }
                }
                let _ = self.broker.ack(ack).await;
            }
            Err(message) => {
                warn!(event_id = %event_id, deliveries, error = %message, "handler failed");

                if let (Some(store), Some(id)) = (&self.inbox, row_id) {
                    if let Err(e) = store.mark_failed(id, message.clone()).await {
                        error!(event_id = %event_id, error = %e, "failed to mark inbox row failed");
                    }
                }

                if deliveries >= self.settings.max_deliver as u64 {
                    if self.settings.use_dlq {
                        crate::consumer::dlq::route(&*self.broker, &self.settings.dlq_subject, &event_id, raw)
                            .await
                            .ok();
                    }
                    let _ = self.broker.term(ack).await;
                } else {
                    let delay = self.settings.delay_for(deliveries);
                    let _ = self.broker.nak(ack, delay).await;
                }
            }
        }
    }
}
