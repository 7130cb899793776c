//! Connection lifecycle: lazy connect, health, and the real JetStream broker
//! implementation (spec §4.4).
//!
//! State machine and lazy-connect shape grounded in `nats_bus::NatsBus`
//! (wraps one `async_nats::Client`, constructed once and shared), widened
//! with the `idle -> connecting -> connected -> reconnecting -> closed`
//! states spec.md §4.4 names — `NatsBus` itself has no state machine at
//! all, since it assumes an already-connected client handed in. The
//! JetStream-specific parts (`jetstream::Context`, pull consumers, publish
//! acks) are grounded in `sgttomas-solver-ralph/crates/sr-adapters/src/nats.rs`
//! and `other_examples/.../cim-infrastructure__src-jetstream.rs`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::{pull, AckPolicy};
use async_nats::jetstream::{self, AckKind};
use async_nats::HeaderMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::broker::{AckToken, DeliveredMessage, DeliveryMeta, JetStreamBroker, PublishOutcome, MSG_ID_HEADER};
use crate::config::BridgeConfig;
use crate::consumer_retry::{retry_with_backoff, RetryConfig};
use crate::error::{BridgeError, BridgeResult};

/// Lifecycle state of the connection manager (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Stream-side facts reported by `health_check()`.
#[derive(Debug, Clone)]
pub struct StreamHealth {
    pub exists: bool,
    pub name: String,
    pub subjects: Vec<String>,
    pub messages: u64,
}

/// Config facts echoed by `health_check()` — never the full config, only
/// the fields spec §4.4 names.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub env: String,
    pub app_name: String,
    pub destination_app: String,
    pub use_outbox: bool,
    pub use_inbox: bool,
    pub use_dlq: bool,
}

/// The full object returned by `health_check()` (spec §4.4).
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub connected: bool,
    pub state: ConnectionState,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub stream: StreamHealth,
    pub config: HealthConfig,
    pub version: &'static str,
}

struct ConnectionInner {
    state: ConnectionState,
    client: Option<async_nats::Client>,
    jetstream: Option<jetstream::Context>,
    connected_at: Option<DateTime<Utc>>,
    last_error: Option<(String, DateTime<Utc>)>,
}

/// Owns one broker connection per process.
pub struct ConnectionManager {
    config: BridgeConfig,
    inner: Mutex<ConnectionInner>,
    consumers: Mutex<HashMap<String, jetstream::consumer::PullConsumer>>,
}

impl ConnectionManager {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Idle,
                client: None,
                jetstream: None,
                connected_at: None,
                last_error: None,
            }),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotent: returns immediately if already connected, otherwise
    /// connects (with bounded retry) and reconciles topology unless
    /// `disable_js_api` is set.
    pub async fn connect(&self) -> BridgeResult<()> {
        {
            let guard = self.inner.lock().await;
            if guard.state == ConnectionState::Connected {
                return Ok(());
            }
        }

        {
            let mut guard = self.inner.lock().await;
            guard.state = ConnectionState::Connecting;
        }

        let urls = self.config.nats_urls.join(",");
        let retry_cfg = RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        };

        let client = retry_with_backoff(
            || {
                let urls = urls.clone();
                async move { async_nats::connect(urls).await.map_err(|e| e.to_string()) }
            },
            &retry_cfg,
            "broker connect",
        )
        .await;

        let client = match client {
            Ok(c) => c,
            Err(e) => {
                let mut guard = self.inner.lock().await;
                guard.state = ConnectionState::Reconnecting;
                guard.last_error = Some((e.clone(), Utc::now()));
                return Err(BridgeError::Connection(e));
            }
        };

        let js = jetstream::new(client.clone());

        {
            let mut guard = self.inner.lock().await;
            guard.client = Some(client);
            guard.jetstream = Some(js.clone());
            guard.state = ConnectionState::Connected;
            guard.connected_at = Some(Utc::now());
        }

        if !self.config.disable_js_api {
            if let Err(e) = self.reconcile_topology(&js).await {
                warn!(error = %e, "topology reconciliation failed during connect");
            }
        }

        info!(app = %self.config.app_name, "connected to broker");
        Ok(())
    }

    async fn reconcile_topology(&self, js: &jetstream::Context) -> BridgeResult<()> {
        let admin = JetStreamAdmin { context: js.clone() };
        let stream_name = self.config.stream_name();
        let subjects = [
            self.config.publish_subject(),
            self.config.consume_subject(),
            crate::subject::dlq_subject(&self.config.app_name, &self.config.destination_app),
        ];
        crate::topology::ensure(&admin, &stream_name, subjects).await
    }

    pub async fn jetstream_context(&self) -> BridgeResult<jetstream::Context> {
        let guard = self.inner.lock().await;
        guard
            .jetstream
            .clone()
            .ok_or_else(|| BridgeError::Connection("not connected".to_string()))
    }

    pub async fn nats_client(&self) -> BridgeResult<async_nats::Client> {
        let guard = self.inner.lock().await;
        guard
            .client
            .clone()
            .ok_or_else(|| BridgeError::Connection("not connected".to_string()))
    }

    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        guard.client = None;
        guard.jetstream = None;
        guard.state = ConnectionState::Closed;
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.state == ConnectionState::Connected
    }

    pub async fn health_check(&self) -> HealthCheck {
        let guard = self.inner.lock().await;
        let stream_name = self.config.stream_name();

        let stream = match &guard.jetstream {
            Some(js) => match js.get_stream(&stream_name).await {
                Ok(mut stream) => match stream.info().await {
                    Ok(info) => StreamHealth {
                        exists: true,
                        name: stream_name.clone(),
                        subjects: info.config.subjects.clone(),
                        messages: info.state.messages,
                    },
                    Err(_) => StreamHealth { exists: false, name: stream_name.clone(), subjects: vec![], messages: 0 },
                },
                Err(_) => StreamHealth { exists: false, name: stream_name.clone(), subjects: vec![], messages: 0 },
            },
            None => StreamHealth { exists: false, name: stream_name.clone(), subjects: vec![], messages: 0 },
        };

        HealthCheck {
            connected: guard.state == ConnectionState::Connected,
            state: guard.state,
            connected_at: guard.connected_at,
            last_error: guard.last_error.as_ref().map(|(m, _)| m.clone()),
            last_error_at: guard.last_error.as_ref().map(|(_, t)| *t),
            stream,
            config: HealthConfig {
                env: self.config.env.clone(),
                app_name: self.config.app_name.clone(),
                destination_app: self.config.destination_app.clone(),
                use_outbox: self.config.use_outbox,
                use_inbox: self.config.use_inbox,
                use_dlq: self.config.use_dlq,
            },
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    async fn consumer_for(&self, consumer_name: &str, filter_subject: &str) -> BridgeResult<jetstream::consumer::PullConsumer> {
        {
            let cache = self.consumers.lock().await;
            if let Some(c) = cache.get(consumer_name) {
                return Ok(c.clone());
            }
        }

        let js = self.jetstream_context().await?;
        let stream_name = self.config.stream_name();
        let mut stream = js
            .get_stream(&stream_name)
            .await
            .map_err(|e| BridgeError::Connection(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                consumer_name,
                pull::Config {
                    durable_name: Some(consumer_name.to_string()),
                    filter_subject: filter_subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    max_deliver: self.config.max_deliver as i64,
                    ack_wait: self.config.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BridgeError::Connection(e.to_string()))?;

        let mut cache = self.consumers.lock().await;
        cache.insert(consumer_name.to_string(), consumer.clone());
        Ok(consumer)
    }
}

/// [`JetStreamBroker`] implementation backed by a real `async_nats::Client`.
pub struct NatsJetStreamBroker {
    manager: Arc<ConnectionManager>,
}

impl NatsJetStreamBroker {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl JetStreamBroker for NatsJetStreamBroker {
    async fn publish(&self, subject: &str, event_id: &str, payload: Vec<u8>) -> BridgeResult<PublishOutcome> {
        let js = self.manager.jetstream_context().await?;
        let mut headers = HeaderMap::new();
        headers.insert(MSG_ID_HEADER, event_id);

        let ack = js
            .publish_with_headers(subject.to_string(), headers, payload.into())
            .await
            .map_err(|e| BridgeError::Publish(e.to_string()))?
            .await
            .map_err(|e| BridgeError::Publish(e.to_string()))?;

        if ack.duplicate {
            Ok(PublishOutcome::Duplicate)
        } else {
            Ok(PublishOutcome::Published)
        }
    }

    async fn fetch(
        &self,
        consumer_name: &str,
        filter_subject: &str,
        batch_size: usize,
        timeout: Duration,
    ) -> BridgeResult<Vec<DeliveredMessage>> {
        let consumer = self.manager.consumer_for(consumer_name, filter_subject).await?;

        let mut messages = consumer
            .fetch()
            .max_messages(batch_size)
            .expires(timeout)
            .messages()
            .await
            .map_err(|e| BridgeError::Connection(e.to_string()))?;

        let mut out = Vec::with_capacity(batch_size);
        while let Ok(Some(Ok(msg))) = tokio::time::timeout(timeout, messages.next()).await {
            let info = match msg.info() {
                Ok(i) => i,
                Err(e) => {
                    error!(error = %e, "failed to read jetstream message info");
                    continue;
                }
            };

            let mut headers = HashMap::new();
            if let Some(h) = &msg.headers {
                for (key, values) in h.iter() {
                    if let Some(v) = values.iter().next() {
                        headers.insert(key.to_string().to_lowercase(), v.to_string());
                    }
                }
            }

            let meta = DeliveryMeta {
                stream: info.stream.to_string(),
                stream_sequence: info.stream_sequence,
                delivery_count: info.delivered,
                consumer: consumer_name.to_string(),
            };

            out.push(DeliveredMessage {
                payload: msg.payload.to_vec(),
                headers,
                meta,
                ack: AckToken::Nats(Box::new(msg)),
            });

            if out.len() >= batch_size {
                break;
            }
        }

        Ok(out)
    }

    async fn ack(&self, token: AckToken) -> BridgeResult<()> {
        match token {
            AckToken::Nats(msg) => msg.ack().await.map_err(|e| BridgeError::Connection(e.to_string())),
            AckToken::InMemory { .. } => Err(BridgeError::Configuration(
                "in-memory ack token used against the real broker".to_string(),
            )),
        }
    }

    async fn nak(&self, token: AckToken, delay: Duration) -> BridgeResult<()> {
        match token {
            AckToken::Nats(msg) => msg
                .ack_with(AckKind::Nak(Some(delay)))
                .await
                .map_err(|e| BridgeError::Connection(e.to_string())),
            AckToken::InMemory { .. } => Err(BridgeError::Configuration(
                "in-memory ack token used against the real broker".to_string(),
            )),
        }
    }

    async fn term(&self, token: AckToken) -> BridgeResult<()> {
        match token {
            AckToken::Nats(msg) => msg
                .ack_with(AckKind::Term)
                .await
                .map_err(|e| BridgeError::Connection(e.to_string())),
            AckToken::InMemory { .. } => Err(BridgeError::Configuration(
                "in-memory ack token used against the real broker".to_string(),
            )),
        }
    }
}

/// [`crate::topology::BrokerAdmin`] implementation over a real JetStream
/// context, used by `ConnectionManager::reconcile_topology`.
struct JetStreamAdmin {
    context: jetstream::Context,
}

#[async_trait]
impl crate::topology::BrokerAdmin for JetStreamAdmin {
    async fn stream_subjects(&self, stream_name: &str) -> BridgeResult<Option<Vec<String>>> {
        match self.context.get_stream(stream_name).await {
            Ok(mut stream) => {
                let info = stream.info().await.map_err(|e| BridgeError::Connection(e.to_string()))?;
                Ok(Some(info.config.subjects.clone()))
            }
            Err(e) => {
                let text = e.to_string().to_lowercase();
                if text.contains("not found") || text.contains("404") {
                    Ok(None)
                } else {
                    Err(BridgeError::Connection(e.to_string()))
                }
            }
        }
    }

    async fn foreign_stream_subjects(&self, exclude_stream: &str) -> BridgeResult<Vec<(String, Vec<String>)>> {
        let mut names = self.context.stream_names();
        let mut out = Vec::new();
        let mut iterations = 0usize;

        while let Some(name) = names.next().await {
            iterations += 1;
            if iterations > super::topology::MAX_FOREIGN_STREAM_PAGES {
                break;
            }
            let name = name.map_err(|e| BridgeError::Connection(e.to_string()))?;
            if name == exclude_stream {
                continue;
            }
            if let Ok(mut stream) = self.context.get_stream(&name).await {
                if let Ok(info) = stream.info().await {
                    out.push((name, info.config.subjects.clone()));
                }
            }
        }

        Ok(out)
    }

    async fn create_stream(&self, stream_name: &str, subjects: Vec<String>) -> BridgeResult<()> {
        self.context
            .create_stream(jetstream::stream::Config {
                name: stream_name.to_string(),
                subjects,
                retention: jetstream::stream::RetentionPolicy::Interest,
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| BridgeError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn update_stream(&self, stream_name: &str, subjects: Vec<String>) -> BridgeResult<()> {
        self.context
            .update_stream(jetstream::stream::Config {
                name: stream_name.to_string(),
                subjects,
                retention: jetstream::stream::RetentionPolicy::Interest,
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| BridgeError::Connection(e.to_string()))?;
        Ok(())
    }
}
