//! The unit of replication work.

use bytes::Bytes;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// One mutating operation bound for one target.
///
/// The payload is reference-counted, so fanning one operation out to several
/// targets copies no bytes. The queue owns an envelope until it is delivered
/// or dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryEnvelope {
    /// Name of the destination target.
    pub target: Arc<str>,
    /// Namespace the operation belongs to.
    pub namespace: Arc<str>,
    /// Encoded operation.
    pub payload: Bytes,
    /// Submission time, epoch milliseconds.
    pub submitted_at_ms: u64,
}

impl DeliveryEnvelope {
    /// Envelope stamped with the current time.
    pub fn new(target: Arc<str>, namespace: Arc<str>, payload: Bytes) -> Self {
        Self {
            target,
            namespace,
            payload,
            submitted_at_ms: epoch_millis(),
        }
    }

    /// Milliseconds spent queued so far.
    pub fn age_ms(&self) -> u64 {
        epoch_millis().saturating_sub(self.submitted_at_ms)
    }
}

/// Get current epoch milliseconds.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
