//! Producer path: envelope construction, direct publish, and the
//! transactional outbox (spec §4.2).

pub mod dispatcher;
pub mod outbox;

#[cfg(feature = "postgres")]
pub mod outbox_pg;

pub use dispatcher::{Dispatcher, DispatcherSettings};
pub use outbox::{DispatchOutcome, NewOutboxRow, OutboxRow, OutboxStatus, OutboxStore};

#[cfg(feature = "postgres")]
pub use outbox_pg::PgOutboxStore;

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::broker::{JetStreamBroker, PublishOutcome};
use crate::config::BridgeConfig;
use crate::envelope::Envelope;

/// Outcome of one `publish` call (spec §4.2 contract).
#[derive(Debug, Clone)]
pub struct PublishResult {
    pub event_id: String,
    pub subject: String,
    pub success: bool,
    pub duplicate: bool,
    pub error: Option<String>,
}

/// Converts a `publish(...)` call into a durably delivered envelope,
/// exactly once per `event_id`, either directly or via the outbox.
pub struct Producer {
    broker: Arc<dyn JetStreamBroker>,
    outbox: Option<Arc<dyn OutboxStore>>,
    config: BridgeConfig,
}

impl Producer {
    pub fn new(broker: Arc<dyn JetStreamBroker>, outbox: Option<Arc<dyn OutboxStore>>, config: BridgeConfig) -> Self {
        Self { broker, outbox, config }
    }

    /// Build and deliver an envelope for `event_type`/`resource_type`/
    /// `resource_id`. `event_id` is auto-generated (UUIDv4) if omitted.
    #[allow(clippy::too_many_arguments)]
    pub async fn publish(
        &self,
        event_type: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        payload: serde_json::Value,
        event_id: Option<String>,
        trace_id: Option<String>,
    ) -> PublishResult {
        let event_type = event_type.into();
        let resource_type = resource_type.into();
        let resource_id = resource_id.into();
        let subject = crate::subject::sync_subject(&self.config.app_name, &self.config.destination_app);

        if self.config.use_outbox {
            return self
                .publish_via_outbox(event_type, resource_type, resource_id, payload, event_id, subject)
                .await;
        }

        let envelope = Envelope::new(
            self.config.app_name.clone(),
            event_type,
            resource_type,
            resource_id,
            payload,
            event_id,
            trace_id,
        );

        self.publish_direct(envelope, subject).await
    }

    async fn publish_direct(&self, envelope: Envelope, subject: String) -> PublishResult {
        let event_id = envelope.event_id.clone();
        let bytes = match envelope.encode() {
            Ok(b) => b,
            Err(e) => {
                return PublishResult {
                    event_id,
                    subject,
                    success: false,
                    duplicate: false,
                    error: Some(e.to_string()),
                }
            }
        };

        let mut attempt: u32 = 0;
        let mut last_error = None;

        loop {
            attempt += 1;
            match self.broker.publish(&subject, &event_id, bytes.clone()).await {
                Ok(PublishOutcome::Published) => {
                    return PublishResult { event_id, subject, success: true, duplicate: false, error: None }
                }
                Ok(PublishOutcome::Duplicate) => {
                    return PublishResult { event_id, subject, success: true, duplicate: true, error: None }
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                    if attempt >= self.config.max_deliver {
                        break;
                    }
                    let delay = self.delay_for(attempt);
                    warn!(event_id = %event_id, attempt, error = %last_error.as_deref().unwrap_or(""), "direct publish failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        PublishResult { event_id, subject, success: false, duplicate: false, error: last_error }
    }

    async fn publish_via_outbox(
        &self,
        event_type: String,
        resource_type: String,
        resource_id: String,
        payload: serde_json::Value,
        event_id: Option<String>,
        subject: String,
    ) -> PublishResult {
        let event_id = event_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let Some(outbox) = &self.outbox else {
            return PublishResult {
                event_id,
                subject,
                success: false,
                duplicate: false,
                error: Some("use_outbox is enabled but no OutboxStore was configured".to_string()),
            };
        };

        let row = NewOutboxRow {
            event_id: event_id.clone(),
            resource_type,
            resource_id,
            event_type,
            destination_app: self.config.destination_app.clone(),
            payload,
        };

        match outbox.insert(row).await {
            Ok(Some(_)) => PublishResult { event_id, subject, success: true, duplicate: false, error: None },
            Ok(None) => PublishResult { event_id, subject, success: true, duplicate: true, error: None },
            Err(e) => PublishResult { event_id, subject, success: false, duplicate: false, error: Some(e.to_string()) },
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        crate::consumer_retry::backoff_delay(&self.config.backoff, attempt as u64)
    }
}
