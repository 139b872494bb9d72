// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded graceful drain.
//!
//! ```text
//! close queues ──► Draining ──► wait for loops ──┬── all done ───────────┐
//!                                                │                       ▼
//!                                                └── deadline ──► Aborted ──► discard queued
//!                                                                             as errors
//!                                                                             │
//!                                                    slots Closed, conns = 0 ◄┘
//! ```

use super::types::{ShutdownPhase, ShutdownReport};
use crate::dispatcher::TargetPipeline;
use crate::metrics;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// How long aborted loops get to notice the abort before their tasks are
/// cancelled.
const ABORT_GRACE: Duration = Duration::from_millis(50);

/// Drain every pipeline of one worker within `deadline`.
pub(crate) async fn drain(
    worker: usize,
    pipelines: &[Arc<TargetPipeline>],
    phase_tx: &watch::Sender<ShutdownPhase>,
    handles: Vec<JoinHandle<()>>,
    deadline: Duration,
) -> ShutdownReport {
    let started = Instant::now();
    let delivered_before: u64 = pipelines.iter().map(|p| p.delivered()).sum();
    let queued: usize = pipelines.iter().map(|p| p.queue.len()).sum();

    info!(
        worker,
        loops = handles.len(),
        queued,
        deadline_ms = deadline.as_millis() as u64,
        "Draining replication queues"
    );

    // 1. Reject new admissions.
    for p in pipelines {
        p.queue.close();
    }

    // 2. Unconnected slots stop; connected ones empty their queue.
    let _ = phase_tx.send(ShutdownPhase::Draining);

    // 3. Wait for the loops, bounded by the deadline.
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    let all = join_all(handles);
    tokio::pin!(all);

    let timed_out = match timeout(deadline, &mut all).await {
        Ok(results) => {
            log_join_results(&results);
            false
        }
        Err(_) => {
            // 4. Deadline: stop now, unflushed envelopes become errors.
            warn!(worker, "Drain deadline reached, aborting send loops");
            let _ = phase_tx.send(ShutdownPhase::Aborted);
            match timeout(ABORT_GRACE, &mut all).await {
                Ok(results) => log_join_results(&results),
                Err(_) => {
                    warn!(worker, "Send loops did not stop in time, cancelling");
                    for a in &aborts {
                        a.abort();
                    }
                }
            }
            true
        }
    };

    // 5. What is still queued will never be sent.
    let mut discarded = 0u64;
    for p in pipelines {
        let rest = p.queue.drain_remaining().len() as u64;
        if rest > 0 {
            p.counters.record_errors(rest);
            metrics::record_delivery_errors(&p.name, "shutdown", rest);
            debug!(target_name = %p.name, rest, "Discarded queued envelopes");
        }
        metrics::set_queue_depth(&p.name, 0);
        discarded += rest;
    }

    // 6. Nothing stays connected.
    for p in pipelines {
        p.pool.close_all();
        p.counters.reset_connections();
    }

    let delivered_after: u64 = pipelines.iter().map(|p| p.delivered()).sum();
    let report = ShutdownReport {
        drained: delivered_after.saturating_sub(delivered_before),
        discarded,
        timed_out,
        elapsed: started.elapsed(),
    };
    metrics::record_shutdown(
        worker,
        report.drained,
        report.discarded,
        report.elapsed,
        report.timed_out,
    );
    report
}

fn log_join_results(results: &[Result<(), tokio::task::JoinError>]) {
    for (i, r) in results.iter().enumerate() {
        match r {
            Ok(()) => debug!(task = i + 1, "Send loop completed"),
            Err(e) if e.is_cancelled() => debug!(task = i + 1, "Send loop cancelled"),
            Err(e) => warn!(task = i + 1, error = %e, "Send loop panicked during shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicationTarget;
    use crate::counters::DeliveryCounters;
    use crate::envelope::DeliveryEnvelope;
    use crate::pool::ConnState;
    use crate::profile::OutboundProfile;
    use bytes::Bytes;

    fn pipeline() -> Arc<TargetPipeline> {
        Arc::new(TargetPipeline::new(
            ReplicationTarget::for_testing("t0", "mock:1"),
            OutboundProfile::for_testing(),
            Arc::new(DeliveryCounters::default()),
        ))
    }

    #[tokio::test]
    async fn test_drain_without_loops_discards_as_errors() {
        let p = pipeline();
        for _ in 0..5 {
            p.queue
                .try_submit(DeliveryEnvelope::new("t0".into(), "ns".into(), Bytes::new()))
                .unwrap();
        }
        p.counters.connection_opened();
        let (tx, _rx) = watch::channel(ShutdownPhase::Running);

        let report = drain(0, &[Arc::clone(&p)], &tx, Vec::new(), Duration::from_secs(2)).await;

        assert_eq!(report.discarded, 5);
        assert_eq!(report.drained, 0);
        assert!(!report.timed_out);
        assert_eq!(p.counters.errors(), 5);
        assert_eq!(p.counters.drops(), 0);
        assert_eq!(p.counters.connections(), 0);
        assert!(p.queue.is_closed());
        assert!(p.pool.states().iter().all(|s| *s == ConnState::Closed));
        assert_eq!(*tx.borrow(), ShutdownPhase::Draining);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_aborts_stuck_loop_at_deadline() {
        let p = pipeline();
        let (tx, mut rx) = watch::channel(ShutdownPhase::Running);
        // A loop that ignores Draining and only exits on Aborted.
        let handle = tokio::spawn(async move {
            let _ = rx.wait_for(|ph| *ph == ShutdownPhase::Aborted).await;
        });

        let start = Instant::now();
        let report = drain(0, &[p], &tx, vec![handle], Duration::from_secs(2)).await;
        assert!(report.timed_out);
        assert!(start.elapsed() <= Duration::from_secs(2) + ABORT_GRACE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_cancels_loop_ignoring_abort() {
        let p = pipeline();
        let (tx, _rx) = watch::channel(ShutdownPhase::Running);
        let handle = tokio::spawn(std::future::pending::<()>());

        let start = Instant::now();
        let report = drain(0, &[p], &tx, vec![handle], Duration::from_millis(500)).await;
        assert!(report.timed_out);
        assert_eq!(start.elapsed(), Duration::from_millis(500) + ABORT_GRACE);
    }
}
