//! Delivery service state and request/report types.
//!
//! # State Transitions
//!
//! ```text
//!            start()              shutdown()
//! Created ─────────────► Running ─────────────► Draining ──► Stopped
//!    │                                                          ▲
//!    └───────────────────── shutdown() ─────────────────────────┘
//! ```
//!
//! - **Created**: after `ReplicationDelivery::new()`. Queues accept submissions,
//!   nothing is sent yet.
//! - **Running**: send loops are dialing and delivering.
//! - **Draining**: queues closed, connected slots emptying them.
//! - **Stopped**: every slot closed. Safe to drop.

use crate::error::Rejected;
use std::time::Duration;

/// State of a delivery service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Built but not started.
    Created,
    /// Send loops running.
    Running,
    /// Shutdown in progress.
    Draining,
    /// Shut down.
    Stopped,
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryState::Created => write!(f, "Created"),
            DeliveryState::Running => write!(f, "Running"),
            DeliveryState::Draining => write!(f, "Draining"),
            DeliveryState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// What the send loops are told to do.
///
/// Broadcast on one watch channel per worker; every loop and every backoff
/// sleep observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Normal operation.
    Running,
    /// Stop dialing; connected slots empty their queue, then exit.
    Draining,
    /// Deadline passed; exit immediately.
    Aborted,
}

/// Which targets a submission goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    /// Every registered target.
    All,
    /// One target by name.
    Named(String),
    /// One target by slot index.
    Slot(usize),
}

/// Outcome of one `submit` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitReport {
    /// Targets whose queue accepted the envelope.
    pub accepted: Vec<String>,
    /// Targets that refused it, with the reason.
    pub rejected: Vec<(String, Rejected)>,
}

impl SubmitReport {
    pub fn accepted_count(&self) -> usize {
        self.accepted.len()
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }

    /// No target was selected.
    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty() && self.rejected.is_empty()
    }

    /// Every selected target accepted.
    pub fn all_accepted(&self) -> bool {
        !self.accepted.is_empty() && self.rejected.is_empty()
    }
}

/// Outcome of a shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Envelopes delivered after shutdown began.
    pub drained: u64,
    /// Envelopes still queued at the end, counted as errors.
    pub discarded: u64,
    /// The deadline passed before every loop finished.
    pub timed_out: bool,
    /// Wall time spent.
    pub elapsed: Duration,
}
