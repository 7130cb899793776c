//! Error taxonomy for the bridge, by kind rather than by originating library.
//!
//! Mirrors `event_bus::BusError`'s shape (a flat `thiserror` enum of
//! `String`-carrying variants) but widened to the seven kinds the bridge
//! distinguishes: configuration, connection, publish, duplicate,
//! deserialization, handler, and topology-overlap errors. `Duplicate` is
//! never raised through `?` — publish-side dedup is reflected on
//! `PublishResult` instead, never as an error to the caller.

use thiserror::Error;

/// Result type used throughout the bridge.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors the bridge can report, grouped by the taxonomy in the design doc.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Missing or invalid configuration. Fatal at startup; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Transport unreachable or broker connection in a bad state.
    #[error("connection error: {0}")]
    Connection(String),

    /// Broker rejected a publish (stream not found, no responders, ...).
    #[error("publish error: {0}")]
    Publish(String),

    /// Envelope bytes failed to parse as JSON.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The host-supplied handler returned an error.
    #[error("handler error: {0}")]
    Handler(String),

    /// A topology overlap persisted after the single retry; the reconciler
    /// logged a warning and left the stream untouched rather than raising —
    /// this variant exists for callers that want to observe the event, not
    /// for the reconciler to return it as a hard failure.
    #[error("topology overlap: {0}")]
    TopologyOverlap(String),

    /// Underlying broker client error.
    #[error("nats error: {0}")]
    Nats(String),

    /// Underlying persistence error (outbox/inbox store).
    #[error("store error: {0}")]
    Store(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Deserialization(e.to_string())
    }
}

impl From<async_nats::Error> for BridgeError {
    fn from(e: async_nats::Error) -> Self {
        BridgeError::Nats(e.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for BridgeError {
    fn from(e: sqlx::Error) -> Self {
        BridgeError::Store(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialization_error_wraps_serde() {
        let err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let bridge_err: BridgeError = err.into();
        assert!(matches!(bridge_err, BridgeError::Deserialization(_)));
    }

    #[test]
    fn display_messages_are_human_readable() {
        let err = BridgeError::Configuration("missing app_name".to_string());
        assert_eq!(err.to_string(), "configuration error: missing app_name");
    }
}
