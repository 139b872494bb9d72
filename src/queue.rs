//! Per-target delivery queue.
//!
//! A bounded FIFO between the client path and the send loops of one target.
//!
//! ```text
//!   submit (sync, never waits)          recv (async, one per send loop)
//!   ─────────────────────────►  [ e5 e4 e3 e2 e1 ]  ─────────────────►
//!        │                       ◄── capacity ──►
//!        └─ Err(QueueFull) when depth == max_pending_queue_size + pending_queue_extra
//!        └─ Err(Closed) once close() was called
//! ```
//!
//! The queue never touches counters; whoever submits decides what a rejection
//! costs.

use crate::envelope::DeliveryEnvelope;
use crate::error::Rejected;
use crate::profile::OutboundProfile;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

/// Bounded multi-producer, multi-consumer envelope queue.
#[derive(Debug)]
pub struct DeliveryQueue {
    items: Mutex<VecDeque<DeliveryEnvelope>>,
    capacity: usize,
    closed: AtomicBool,
    notify: Notify,
}

impl DeliveryQueue {
    /// Queue holding at most `capacity` envelopes, with `preallocate` slots
    /// reserved up front.
    pub fn new(capacity: usize, preallocate: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(preallocate.min(capacity))),
            capacity,
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Queue sized from a profile.
    pub fn from_profile(profile: &OutboundProfile) -> Self {
        Self::new(profile.queue_capacity(), profile.queue_buffer_size)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DeliveryEnvelope>> {
        // A panic while holding the lock leaves the deque itself intact.
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue without waiting.
    pub fn try_submit(&self, envelope: DeliveryEnvelope) -> Result<(), Rejected> {
        {
            let mut items = self.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(Rejected::Closed);
            }
            if items.len() >= self.capacity {
                return Err(Rejected::QueueFull);
            }
            items.push_back(envelope);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue without waiting.
    pub fn try_recv(&self) -> Option<DeliveryEnvelope> {
        self.lock().pop_front()
    }

    /// Next envelope in FIFO order.
    ///
    /// Waits while the queue is empty and open. Returns `None` once the queue
    /// is closed and empty. Cancel-safe: an envelope is only removed when the
    /// future completes.
    pub async fn recv(&self) -> Option<DeliveryEnvelope> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a submit between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            if let Some(envelope) = self.try_recv() {
                return Some(envelope);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Switch to reject-new mode and wake every waiter.
    pub fn close(&self) {
        {
            let _items = self.lock();
            self.closed.store(true, Ordering::Release);
        }
        self.notify.notify_waiters();
    }

    /// Remove and return everything still queued.
    pub fn drain_remaining(&self) -> Vec<DeliveryEnvelope> {
        self.lock().drain(..).collect()
    }

    /// Current depth.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Hard capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `close()` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    fn env(n: u8) -> DeliveryEnvelope {
        DeliveryEnvelope::new("t0".into(), "ns".into(), Bytes::from(vec![n]))
    }

    #[test]
    fn test_fifo_order() {
        let q = DeliveryQueue::new(8, 8);
        for i in 0..5 {
            q.try_submit(env(i)).unwrap();
        }
        let got: Vec<u8> = std::iter::from_fn(|| q.try_recv())
            .map(|e| e.payload[0])
            .collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_capacity_boundary() {
        let profile = OutboundProfile::default();
        let q = DeliveryQueue::from_profile(&profile);
        assert_eq!(q.capacity(), 8392);

        for i in 0..8392 {
            assert!(q.try_submit(env((i % 256) as u8)).is_ok(), "submit {} failed", i + 1);
        }
        assert_eq!(q.try_submit(env(0)), Err(Rejected::QueueFull));
        assert_eq!(q.len(), 8392);
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let q = DeliveryQueue::new(0, 16);
        assert_eq!(q.try_submit(env(1)), Err(Rejected::QueueFull));
        assert!(q.is_empty());
    }

    #[test]
    fn test_closed_rejects_new() {
        let q = DeliveryQueue::new(4, 4);
        q.try_submit(env(1)).unwrap();
        q.close();
        assert!(q.is_closed());
        assert_eq!(q.try_submit(env(2)), Err(Rejected::Closed));
        // Already queued envelopes survive close.
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_drain_remaining() {
        let q = DeliveryQueue::new(4, 4);
        q.try_submit(env(1)).unwrap();
        q.try_submit(env(2)).unwrap();
        let rest = q.drain_remaining();
        assert_eq!(rest.len(), 2);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_recv_waits_for_submit() {
        let q = Arc::new(DeliveryQueue::new(4, 4));
        let q2 = Arc::clone(&q);
        let handle = tokio::spawn(async move { q2.recv().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        q.try_submit(env(9)).unwrap();
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got.payload[0], 9);
    }

    #[tokio::test]
    async fn test_recv_returns_none_when_closed_and_empty() {
        let q = Arc::new(DeliveryQueue::new(4, 4));
        let q2 = Arc::clone(&q);
        let handle = tokio::spawn(async move { q2.recv().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        assert!(handle.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recv_drains_before_reporting_closed() {
        let q = DeliveryQueue::new(4, 4);
        q.try_submit(env(1)).unwrap();
        q.close();
        assert!(q.recv().await.is_some());
        assert!(q.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_many_producers_many_consumers() {
        let q = Arc::new(DeliveryQueue::new(10_000, 0));
        let mut producers = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            producers.push(tokio::spawn(async move {
                for i in 0..250u32 {
                    q.try_submit(env((i % 256) as u8)).unwrap();
                }
            }));
        }
        for p in producers {
            p.await.unwrap();
        }
        q.close();

        let mut consumers = Vec::new();
        for _ in 0..3 {
            let q = Arc::clone(&q);
            consumers.push(tokio::spawn(async move {
                let mut n = 0usize;
                while q.recv().await.is_some() {
                    n += 1;
                }
                n
            }));
        }
        let mut total = 0;
        for c in consumers {
            total += c.await.unwrap();
        }
        assert_eq!(total, 1000);
    }
}
