//! Dead-letter routing at delivery exhaustion (spec §4.3 step 3e).
//!
//! Grounded in `modules/gl/src/dlq.rs`, which republishes the original
//! payload to a `.dlq` suffixed subject and records it in a
//! `failed_events` table; the table side here is the inbox row itself
//! (`status=failed`), so this module only owns the republish.

use tracing::warn;

use crate::broker::JetStreamBroker;
use crate::error::BridgeResult;

/// Publish `raw` (the original envelope bytes) to the dead-letter subject for
/// `event_id`. Failures to reach the DLQ are logged, not propagated — by the
/// time this runs the message is already being permanently ack'd, and the
/// inbox row already carries the failure; losing the DLQ copy must not
/// resurrect the original delivery.
pub async fn route<B: JetStreamBroker + ?Sized>(
    broker: &B,
    dlq_subject: &str,
    event_id: &str,
    raw: Vec<u8>,
) -> BridgeResult<()> {
    match broker.publish(dlq_subject, event_id, raw).await {
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(event_id, dlq_subject, error = %e, "failed to publish to dead-letter subject");
            Ok(())
        }
    }
}
