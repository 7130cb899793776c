//! # jetstream-bridge
//!
//! A reliable bidirectional event bridge between two application instances
//! over a JetStream-style persistent messaging substrate. Each side
//! publishes domain events about its own resources and consumes events
//! about its counterpart's, keeping replicated read models eventually
//! consistent — at-least-once delivery from the broker, exactly-once
//! application via consumer-side deduplication.
//!
//! Four subsystems, each its own module:
//!
//! - [`topology`] — idempotent stream/subject reconciliation, safe under
//!   concurrent provisioners.
//! - [`producer`] — envelope construction, direct publish or transactional
//!   outbox, and the background dispatcher.
//! - [`consumer`] — pull subscription, the deduplicating inbox, retry with
//!   backoff, and dead-letter routing at exhaustion.
//! - [`connection`] — lazy connect, health, and the shared broker lifecycle.
//!
//! ## Example
//!
//! ```rust,no_run
//! use jetstream_bridge::{BridgeConfig, ConnectionManager};
//! use jetstream_bridge::producer::Producer;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BridgeConfig::new("api", "worker").with_nats_urls(["nats://localhost:4222"]);
//! let manager = Arc::new(ConnectionManager::new(config.clone()));
//! manager.connect().await?;
//!
//! let broker = Arc::new(jetstream_bridge::connection::NatsJetStreamBroker::new(manager.clone()));
//! let producer = Producer::new(broker, None, config);
//!
//! let result = producer
//!     .publish("user.created", "user", "42", serde_json::json!({"name": "Ada"}), None, None)
//!     .await;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod producer;
pub mod subject;
pub mod topology;

pub mod consumer_retry;

/// In-memory broker, outbox, and inbox test doubles — usable by this
/// crate's own tests and by host applications testing their own bridge
/// usage without NATS or Postgres.
pub mod testing;

pub use config::{AutoStartPolicy, BridgeConfig, ConsumerMode};
pub use connection::{ConnectionManager, ConnectionState, HealthCheck};
pub use envelope::Envelope;
pub use error::{BridgeError, BridgeResult};
