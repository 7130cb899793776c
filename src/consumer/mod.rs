//! Consumer path: pull subscription, inbox, DLQ (spec §4.3).

pub mod dlq;
pub mod inbox;
pub mod message;
pub mod subscription;

#[cfg(feature = "postgres")]
pub mod inbox_pg;

pub use inbox::{IncomingEvent, InboxRow, InboxStatus, InboxStore, Reservation};
pub use message::Event;
pub use subscription::{Handler, Subscription, SubscriptionSettings};

#[cfg(feature = "postgres")]
pub use inbox_pg::PgInboxStore;

use std::sync::Arc;

use crate::broker::JetStreamBroker;
use crate::config::{BridgeConfig, ConsumerMode};
use crate::error::{BridgeError, BridgeResult};

/// Builds [`Subscription`]s bound to one app/destination pair.
pub struct Consumer {
    broker: Arc<dyn JetStreamBroker>,
    inbox: Option<Arc<dyn InboxStore>>,
    config: BridgeConfig,
}

impl Consumer {
    pub fn new(broker: Arc<dyn JetStreamBroker>, inbox: Option<Arc<dyn InboxStore>>, config: BridgeConfig) -> Self {
        Self { broker, inbox, config }
    }

    /// Bind `handler` to a pull consumer reading the counterpart's publish
    /// subject. Does not start the loop — call `subscription.run()`.
    ///
    /// Fails with [`BridgeError::Configuration`] if `consumer_mode` is
    /// [`ConsumerMode::Push`] — only pull consumers are implemented (spec §6).
    pub fn subscribe(&self, handler: Arc<dyn Handler>) -> BridgeResult<Subscription> {
        if self.config.consumer_mode == ConsumerMode::Push {
            return Err(BridgeError::Configuration(
                "consumer_mode = Push is not implemented; only Pull consumers are supported".to_string(),
            ));
        }

        let settings = SubscriptionSettings {
            consumer_name: crate::subject::consumer_name(&self.config.app_name, &self.config.destination_app),
            filter_subject: crate::subject::sync_subject(&self.config.destination_app, &self.config.app_name),
            dlq_subject: crate::subject::dlq_subject(&self.config.app_name, &self.config.destination_app),
            batch_size: self.config.batch_size,
            fetch_timeout: self.config.fetch_timeout,
            max_deliver: self.config.max_deliver,
            backoff: self.config.backoff.clone(),
            use_inbox: self.config.use_inbox,
            use_dlq: self.config.use_dlq,
        };

        let inbox = if self.config.use_inbox { self.inbox.clone() } else { None };

        Ok(Subscription::new(self.broker.clone(), inbox, handler, settings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryJetStreamBroker;
    use async_trait::async_trait;

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        async fn handle(&self, _event: Event) -> Result<(), String> {
            Ok(())
        }
    }

    #[test]
    fn subscribe_rejects_push_consumer_mode() {
        let broker = Arc::new(InMemoryJetStreamBroker::new());
        let config = BridgeConfig::new("api", "worker").with_consumer_mode(ConsumerMode::Push);
        let consumer = Consumer::new(broker, None, config);

        let err = consumer.subscribe(Arc::new(NoopHandler)).unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(_)));
    }
}
