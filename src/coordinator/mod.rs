// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-worker delivery service.
//!
//! The facade the proxy worker talks to. It ties together, per target:
//! - a [`DeliveryQueue`](crate::queue::DeliveryQueue) sized from the target's profile
//! - a [`ConnectionPool`](crate::pool::ConnectionPool) of `connections_per_target` slots
//! - one send loop per slot ([`crate::dispatcher::run_sender`])
//! - the worker's row of the shared [`CounterTable`]
//!
//! # Lifecycle
//!
//! 1. `new()` builds every pipeline; submissions are accepted from here on
//! 2. `start()` spawns the send loops
//! 3. `submit()` fans an operation out to the selected targets, never waiting
//! 4. `shutdown()` drains within the deadline and closes everything

mod shutdown;
mod types;

pub use types::{DeliveryState, ShutdownPhase, ShutdownReport, SubmitReport, TargetSelector};

use crate::config::DeliveryConfig;
use crate::counters::{CounterTable, DeliveryCounters};
use crate::dispatcher::{run_sender, TargetPipeline};
use crate::envelope::DeliveryEnvelope;
use crate::error::{DeliveryError, Rejected, Result};
use crate::metrics;
use crate::pool::ConnState;
use crate::profile::OutboundProfileMap;
use crate::registry::TargetRegistry;
use crate::transport::{TcpTransport, Transport};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Replication delivery for one proxy worker.
///
/// Submission is synchronous and safe to call from many tasks at once; the
/// send loops run on the Tokio runtime that called [`start()`](Self::start).
pub struct ReplicationDelivery<T: Transport = TcpTransport> {
    /// Worker slot (row in the counter table).
    worker: usize,

    /// Validated targets in slot order.
    registry: TargetRegistry,

    /// Pipelines indexed by registry slot.
    pipelines: Vec<Arc<TargetPipeline>>,

    /// Shared counter table (also read by the stats sampler).
    counters: Arc<CounterTable>,

    /// How connections are opened.
    transport: Arc<T>,

    /// Service state (broadcast to watchers)
    state_tx: watch::Sender<DeliveryState>,

    /// Service state receiver (for internal use)
    state_rx: watch::Receiver<DeliveryState>,

    /// Shutdown phase seen by every send loop.
    phase_tx: watch::Sender<ShutdownPhase>,

    /// Send loop task handles
    handles: Vec<JoinHandle<()>>,
}

impl ReplicationDelivery<TcpTransport> {
    /// Service dialing targets over TCP.
    pub fn with_tcp(worker: usize, config: &DeliveryConfig, counters: Arc<CounterTable>) -> Self {
        Self::new(worker, config, counters, TcpTransport)
    }
}

impl<T: Transport> ReplicationDelivery<T> {
    /// Build the service for `worker` from a configuration.
    ///
    /// The target list is validated (a no-op when already valid) and each
    /// target's profile resolved once. The service starts in `Created`.
    pub fn new(
        worker: usize,
        config: &DeliveryConfig,
        counters: Arc<CounterTable>,
        transport: T,
    ) -> Self {
        let registry = TargetRegistry::new(config.targets.clone());
        Self::from_registry(worker, registry, &config.io, counters, transport)
    }

    /// Build the service from an already frozen registry.
    pub fn from_registry(
        worker: usize,
        registry: TargetRegistry,
        profiles: &OutboundProfileMap,
        counters: Arc<CounterTable>,
        transport: T,
    ) -> Self {
        let mut pipelines = Vec::with_capacity(registry.len());
        for (index, target) in registry.iter().enumerate() {
            let profile = profiles.resolve(&target.name);
            let cell = counters.counters(worker, index).unwrap_or_else(|| {
                warn!(
                    worker,
                    target_name = %target.name,
                    "Counter table has no cell for this worker/target, counting privately"
                );
                Arc::new(DeliveryCounters::default())
            });
            debug!(
                target_name = %target.name,
                endpoint = %target.endpoint,
                connections = profile.pool_size(),
                capacity = profile.queue_capacity(),
                compat = target.use_compat_protocol,
                "Configured replication target"
            );
            pipelines.push(Arc::new(TargetPipeline::new(target.clone(), profile, cell)));
        }

        let (state_tx, state_rx) = watch::channel(DeliveryState::Created);
        let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
        metrics::set_service_state(worker, "Created");

        Self {
            worker,
            registry,
            pipelines,
            counters,
            transport: Arc::new(transport),
            state_tx,
            state_rx,
            phase_tx,
            handles: Vec::new(),
        }
    }

    /// Get current state.
    pub fn state(&self) -> DeliveryState {
        *self.state_rx.borrow()
    }

    /// Get a receiver for state changes.
    pub fn state_receiver(&self) -> watch::Receiver<DeliveryState> {
        self.state_rx.clone()
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    pub fn counter_table(&self) -> &Arc<CounterTable> {
        &self.counters
    }

    /// Pipeline of a named target. On duplicate names the first slot wins.
    fn pipeline(&self, name: &str) -> Option<&Arc<TargetPipeline>> {
        self.registry
            .index_of(name)
            .and_then(|index| self.pipelines.get(index))
    }

    fn select(&self, selector: &TargetSelector) -> Vec<Arc<TargetPipeline>> {
        match selector {
            TargetSelector::All => self.pipelines.clone(),
            TargetSelector::Named(name) => self.pipeline(name).cloned().into_iter().collect(),
            TargetSelector::Slot(index) => self.pipelines.get(*index).cloned().into_iter().collect(),
        }
    }

    /// Number of pipelines (one per registry slot).
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Spawn one send loop per connection slot.
    pub fn start(&mut self) -> Result<()> {
        if self.state() != DeliveryState::Created {
            return Err(DeliveryError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        for pipeline in &self.pipelines {
            for slot in pipeline.pool.slots() {
                let handle = tokio::spawn(run_sender(
                    Arc::clone(pipeline),
                    Arc::clone(slot),
                    Arc::clone(&self.transport),
                    self.phase_tx.subscribe(),
                ));
                self.handles.push(handle);
            }
        }

        let _ = self.state_tx.send(DeliveryState::Running);
        metrics::set_service_state(self.worker, "Running");
        info!(
            worker = self.worker,
            targets = self.pipelines.len(),
            send_loops = self.handles.len(),
            "Replication delivery started"
        );
        Ok(())
    }

    /// Offer one operation to the selected targets.
    ///
    /// Never waits. Every refusal adds exactly one to that target's drop
    /// counter. An unknown name or slot selects nothing.
    pub fn submit(&self, selector: TargetSelector, namespace: &str, payload: Bytes) -> SubmitReport {
        let mut report = SubmitReport::default();
        let selected = self.select(&selector);
        if selected.is_empty() {
            debug!(selector = ?selector, "Submission selected no target");
            return report;
        }

        let namespace: Arc<str> = Arc::from(namespace);
        for pipeline in selected {
            let envelope = DeliveryEnvelope::new(
                Arc::clone(&pipeline.name),
                Arc::clone(&namespace),
                payload.clone(),
            );
            match pipeline.queue.try_submit(envelope) {
                Ok(()) => {
                    metrics::record_submitted(&pipeline.name);
                    metrics::set_queue_depth(&pipeline.name, pipeline.queue.len());
                    report.accepted.push(pipeline.target.name.clone());
                }
                Err(reason) => {
                    pipeline.counters.record_drop();
                    metrics::record_dropped(&pipeline.name, rejected_label(reason));
                    report.rejected.push((pipeline.target.name.clone(), reason));
                }
            }
        }
        report
    }

    /// Drain and stop, using the longest `graceful_shutdown_timeout` among
    /// this worker's targets as the deadline.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let deadline = self.default_shutdown_deadline();
        self.shutdown_with_deadline(deadline).await
    }

    /// Drain and stop within `deadline`.
    ///
    /// Calling it again after the service stopped returns an empty report.
    pub async fn shutdown_with_deadline(&mut self, deadline: Duration) -> ShutdownReport {
        if self.state() == DeliveryState::Stopped {
            debug!(worker = self.worker, "Replication delivery already stopped");
            return ShutdownReport::default();
        }

        info!(worker = self.worker, "Shutting down replication delivery");
        let _ = self.state_tx.send(DeliveryState::Draining);
        metrics::set_service_state(self.worker, "Draining");

        let handles = std::mem::take(&mut self.handles);
        let report = shutdown::drain(self.worker, &self.pipelines, &self.phase_tx, handles, deadline).await;

        let _ = self.state_tx.send(DeliveryState::Stopped);
        metrics::set_service_state(self.worker, "Stopped");
        info!(
            worker = self.worker,
            drained = report.drained,
            discarded = report.discarded,
            timed_out = report.timed_out,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Replication delivery stopped"
        );
        report
    }

    /// Longest graceful shutdown timeout among the targets (zero without targets).
    pub fn default_shutdown_deadline(&self) -> Duration {
        self.pipelines
            .iter()
            .map(|p| p.profile.graceful_shutdown_duration())
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// State of every slot of a target.
    pub fn connection_states(&self, target: &str) -> Option<Vec<ConnState>> {
        self.pipeline(target).map(|p| p.pool.states())
    }

    /// Envelopes waiting in a target's queue.
    pub fn queue_depth(&self, target: &str) -> Option<usize> {
        self.pipeline(target).map(|p| p.queue.len())
    }

    /// Envelopes waiting in the queue of a registry slot.
    pub fn slot_queue_depth(&self, slot: usize) -> Option<usize> {
        self.pipelines.get(slot).map(|p| p.queue.len())
    }

    /// Envelopes flushed to a target so far.
    pub fn delivered(&self, target: &str) -> Option<u64> {
        self.pipeline(target).map(|p| p.delivered())
    }

    /// Counters of a target for this worker.
    pub fn target_counters(&self, target: &str) -> Option<Arc<DeliveryCounters>> {
        self.pipeline(target).map(|p| Arc::clone(&p.counters))
    }
}

fn rejected_label(reason: Rejected) -> &'static str {
    match reason {
        Rejected::QueueFull => "queue_full",
        Rejected::Closed => "closed",
    }
}
