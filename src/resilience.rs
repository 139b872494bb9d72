//! Resilience utilities: reconnect backoff and bulkheads.
//!
//! - [`Backoff`]: capped doubling wait between failed dials of one slot
//! - [`Bulkhead`]: semaphore limiting how many slots of a target recycle at once
//!
//! # Example
//!
//! ```rust
//! use replication_delivery::resilience::{Backoff, Bulkhead};
//! use std::time::Duration;
//!
//! let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(20_000));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(100));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(200));
//! backoff.reset();
//! assert_eq!(backoff.next_delay(), Duration::from_millis(100));
//!
//! // One slot at a time may recycle.
//! let gate = Bulkhead::for_recycle();
//! let permit = gate.try_acquire();
//! assert!(permit.is_some());
//! assert!(gate.try_acquire().is_none());
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// =============================================================================
// Reconnect Backoff
// =============================================================================

/// Reconnect wait schedule for one connection slot.
///
/// The wait after the nth consecutive failure is `min(base * 2^(n-1), max)`.
///
/// ```text
/// Failure  Wait (base 100ms, max 20s)
/// -------  ----
/// 1        100ms
/// 2        200ms
/// 3        400ms
/// ...
/// 8        12.8s
/// 9+       20s
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    /// Create a schedule starting at `base`. A `max` below `base` is raised to it.
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.failures = self.failures.saturating_add(1);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// The wait the next failure would produce.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Return to `base` after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.base;
        self.failures = 0;
    }

    /// Wait for the nth consecutive failure (1-indexed) without mutating state.
    pub fn delay_for_failure(&self, n: u32) -> Duration {
        if n == 0 {
            return self.base;
        }
        let factor = 2u32.checked_pow(n - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Limits how many holders may be inside a section at once.
///
/// Each target owns one single-permit bulkhead used as its recycle gate: a slot
/// must hold the permit while it tears down and re-dials, so at most one
/// connection per target is out of service because of recycling.
#[derive(Debug)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Single-permit gate for connection recycling.
    pub fn for_recycle() -> Self {
        Self::new(1)
    }

    /// Try to acquire a permit without waiting.
    ///
    /// Returns `None` if the bulkhead is full.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Get the number of available permits.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get the maximum concurrent operations allowed.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Check if the bulkhead is full (no permits available).
    pub fn is_full(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}
