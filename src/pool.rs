//! Connection pool: per-target connection slots.
//!
//! Each target owns `connections_per_target` slots. A slot is driven by exactly
//! one send loop; the pool only publishes each slot's state and owns the
//! target's recycle gate.
//!
//! # Slot Lifecycle
//!
//! ```text
//!                  dial ok
//! Disconnected ──► Connecting ──────────► Connected
//!      ▲              │  ▲                   │   │
//!      │   dial fail  │  │ recycle gate held │   │ write / read error
//!      │   (backoff)  ▼  │                   ▼   │
//!      └──────────────┘  └─────────────── Draining
//!      ▲                                         │
//!      └─────────────────────────────────────────┘
//!
//! any state ──► Closed   (shutdown)
//! ```
//!
//! Dial failures wait `reconnect_interval_base`, doubling per consecutive
//! failure up to `reconnect_interval_max`; a successful dial resets the wait.
//! Recycling requires the target's single-permit gate, so at most one slot per
//! target is out of service because of recycling.

use crate::config::Endpoint;
use crate::coordinator::ShutdownPhase;
use crate::counters::DeliveryCounters;
use crate::error::DeliveryError;
use crate::metrics;
use crate::resilience::{Backoff, Bulkhead};
use crate::transport::Transport;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// State of one connection slot.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnState {
    /// No connection; waiting to dial or in backoff.
    Disconnected = 0,
    /// Dial in progress.
    Connecting = 1,
    /// Connected and consuming the queue.
    Connected = 2,
    /// Being torn down for a forced recycle.
    Draining = 3,
    /// Stopped for good.
    Closed = 4,
}

impl ConnState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Draining => "draining",
            ConnState::Closed => "closed",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Disconnected,
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            3 => ConnState::Draining,
            _ => ConnState::Closed,
        }
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable state cell for one slot.
#[derive(Debug)]
pub struct ConnectionSlot {
    target: Arc<str>,
    index: usize,
    state: AtomicU8,
}

impl ConnectionSlot {
    pub fn new(target: Arc<str>, index: usize) -> Self {
        Self {
            target,
            index,
            state: AtomicU8::new(ConnState::Disconnected as u8),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Publish a new state. Closed is terminal.
    pub(crate) fn set_state(&self, next: ConnState) {
        let prev = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if cur == ConnState::Closed as u8 && next != ConnState::Closed {
                    None
                } else {
                    Some(next as u8)
                }
            });
        if let Ok(prev) = prev {
            if prev != next as u8 {
                metrics::record_connection_state(&self.target, self.index, next.as_str());
                debug!(slot = self.index, from = %ConnState::from_u8(prev), to = %next, "Slot state");
            }
        }
    }
}

/// The slots of one target plus its recycle gate.
#[derive(Debug)]
pub struct ConnectionPool {
    slots: Vec<Arc<ConnectionSlot>>,
    recycle_gate: Arc<Bulkhead>,
}

impl ConnectionPool {
    /// Pool of `size` disconnected slots (at least one).
    pub fn new(target: Arc<str>, size: usize) -> Self {
        let slots = (0..size.max(1))
            .map(|i| Arc::new(ConnectionSlot::new(Arc::clone(&target), i)))
            .collect();
        Self {
            slots,
            recycle_gate: Arc::new(Bulkhead::for_recycle()),
        }
    }

    pub fn slots(&self) -> &[Arc<ConnectionSlot>] {
        &self.slots
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Snapshot of every slot's state, in slot order.
    pub fn states(&self) -> Vec<ConnState> {
        self.slots.iter().map(|s| s.state()).collect()
    }

    /// Slots currently connected.
    pub fn connected(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state() == ConnState::Connected)
            .count()
    }

    pub fn recycle_gate(&self) -> &Arc<Bulkhead> {
        &self.recycle_gate
    }

    /// Mark every slot closed.
    pub fn close_all(&self) {
        for slot in &self.slots {
            slot.set_state(ConnState::Closed);
        }
    }
}

/// First recycle deadline of a slot, spread across the interval by slot index
/// so a pool does not rotate all at once.
pub fn staggered_recycle_delay(interval: Duration, index: usize, pool_size: usize) -> Duration {
    let pool_size = pool_size.max(1) as u32;
    let index = (index as u32) % pool_size;
    interval + interval.mul_f64(index as f64 / pool_size as f64)
}

/// Everything a slot needs to dial.
pub(crate) struct DialContext<'a, T: Transport> {
    pub transport: &'a T,
    pub endpoint: &'a Endpoint,
    pub connect_timeout: Duration,
    pub counters: &'a DeliveryCounters,
}

/// Dial until connected or told to stop.
///
/// Every failed or timed-out attempt costs one error and one backoff wait.
/// Returns `None` as soon as the phase leaves `Running`: an unconnected slot
/// has nothing to drain.
pub(crate) async fn connect_with_backoff<T: Transport>(
    ctx: &DialContext<'_, T>,
    slot: &ConnectionSlot,
    backoff: &mut Backoff,
    phase_rx: &mut watch::Receiver<ShutdownPhase>,
) -> Option<T::Stream> {
    loop {
        if *phase_rx.borrow() != ShutdownPhase::Running {
            return None;
        }

        slot.set_state(ConnState::Connecting);
        let attempt = tokio::select! {
            biased;

            changed = phase_rx.changed() => {
                // Any phase change means stop dialing; the loop head decides.
                // A dropped sender means the service is gone.
                if changed.is_err() {
                    return None;
                }
                continue;
            }

            r = timeout(ctx.connect_timeout, ctx.transport.dial(ctx.endpoint)) => r,
        };

        let err = match attempt {
            Ok(Ok(stream)) => {
                if backoff.failures() > 0 {
                    info!(
                        slot = slot.index(),
                        attempts = backoff.failures() + 1,
                        "Connected to target after retry"
                    );
                } else {
                    info!(slot = slot.index(), endpoint = %ctx.endpoint, "Connected to target");
                }
                backoff.reset();
                metrics::record_connect_attempt(slot.target(), true);
                return Some(stream);
            }
            Ok(Err(e)) => e,
            Err(_) => DeliveryError::ConnectTimeout {
                target: slot.target().to_string(),
                timeout: ctx.connect_timeout,
            },
        };

        ctx.counters.record_errors(1);
        metrics::record_connect_attempt(slot.target(), false);
        slot.set_state(ConnState::Disconnected);

        let delay = backoff.next_delay();
        metrics::record_reconnect_backoff(slot.target(), delay);
        if err.is_retryable() {
            warn!(
                slot = slot.index(),
                attempt = backoff.failures(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Connection attempt failed, retrying"
            );
        } else {
            error!(
                slot = slot.index(),
                attempt = backoff.failures(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Target cannot be dialed as configured, retrying"
            );
        }

        tokio::select! {
            biased;
            changed = phase_rx.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
