// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic sampling of the delivery counters.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  tick   ┌──────────────┐  Sample   ┌─────────────────────┐
//! │ CounterTable │────────►│ StatsSampler │──────────►│ StatsWriter         │
//! │ (per worker  │         │ (deltas for  │           │  ├─ StateLog (file) │
//! │  × target)   │         │  drops/errs) │           │  ├─ KeyValue (log)  │
//! └──────────────┘         └──────────────┘           │  └─ Metrics (gauge) │
//!                                                     └─────────────────────┘
//! ```
//!
//! Connection counts are sampled as gauges. Drops and errors are reported as
//! the increase since the previous tick.

mod writers;

pub use writers::{format_key_values, KeyValueWriter, MetricsWriter, StateLogWriter, STATE_LOG_FILE};

use crate::config::StatsConfig;
use crate::counters::{connections_column, drops_column, errors_column, CounterSnapshot, CounterTable};
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Sample types
// ═══════════════════════════════════════════════════════════════════════════════

/// How a column's value relates to the underlying counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Current value.
    Gauge,
    /// Increase since the previous sample.
    Delta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnValue {
    pub name: String,
    pub value: u64,
    pub kind: ColumnKind,
}

/// One worker's row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSample {
    pub worker: usize,
    pub columns: Vec<ColumnValue>,
}

/// Everything taken on one tick, worker-major.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sample {
    pub workers: Vec<WorkerSample>,
}

impl Sample {
    /// Build a sample from a snapshot, diffing drops and errors against
    /// `previous` (cells missing there count from zero).
    pub fn from_snapshots(current: &[CounterSnapshot], previous: &[CounterSnapshot]) -> Self {
        let before: HashMap<(usize, &str), &CounterSnapshot> = previous
            .iter()
            .map(|s| ((s.worker, s.target.as_str()), s))
            .collect();

        let mut workers: Vec<WorkerSample> = Vec::new();
        for snap in current {
            let (drops_before, errors_before) = before
                .get(&(snap.worker, snap.target.as_str()))
                .map(|p| (p.drops, p.errors))
                .unwrap_or((0, 0));

            if workers.last().map(|w| w.worker) != Some(snap.worker) {
                workers.push(WorkerSample {
                    worker: snap.worker,
                    columns: Vec::new(),
                });
            }
            let Some(row) = workers.last_mut() else {
                continue;
            };
            row.columns.push(ColumnValue {
                name: connections_column(&snap.target),
                value: u64::from(snap.connections),
                kind: ColumnKind::Gauge,
            });
            row.columns.push(ColumnValue {
                name: drops_column(&snap.target),
                value: snap.drops.saturating_sub(drops_before),
                kind: ColumnKind::Delta,
            });
            row.columns.push(ColumnValue {
                name: errors_column(&snap.target),
                value: snap.errors.saturating_sub(errors_before),
                kind: ColumnKind::Delta,
            });
        }
        Self { workers }
    }

    /// Column names in output order, taken from the first row.
    pub fn column_names(&self) -> Vec<&str> {
        self.workers
            .first()
            .map(|w| w.columns.iter().map(|c| c.name.as_str()).collect())
            .unwrap_or_default()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Writers
// ═══════════════════════════════════════════════════════════════════════════════

/// Destination for samples.
pub trait StatsSink {
    /// Write one sample taken at `now`.
    fn write(&mut self, sample: &Sample, now: DateTime<Local>) -> io::Result<()>;

    /// Flush and release resources. Called once when sampling stops.
    fn close(&mut self) -> io::Result<()>;
}

/// The configured outputs.
#[derive(Debug)]
pub enum StatsWriter {
    StateLog(StateLogWriter),
    KeyValue(KeyValueWriter),
    Metrics(MetricsWriter),
}

impl StatsWriter {
    fn name(&self) -> &'static str {
        match self {
            StatsWriter::StateLog(_) => "state_log",
            StatsWriter::KeyValue(_) => "key_value",
            StatsWriter::Metrics(_) => "metrics",
        }
    }
}

impl StatsSink for StatsWriter {
    fn write(&mut self, sample: &Sample, now: DateTime<Local>) -> io::Result<()> {
        match self {
            StatsWriter::StateLog(w) => w.write(sample, now),
            StatsWriter::KeyValue(w) => w.write(sample, now),
            StatsWriter::Metrics(w) => w.write(sample, now),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self {
            StatsWriter::StateLog(w) => w.close(),
            StatsWriter::KeyValue(w) => w.close(),
            StatsWriter::Metrics(w) => w.close(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sampler
// ═══════════════════════════════════════════════════════════════════════════════

/// Samples a [`CounterTable`] on a fixed period and fans each sample out to
/// its writers.
pub struct StatsSampler {
    table: Arc<CounterTable>,
    writers: Vec<StatsWriter>,
    interval: Duration,
    previous: Vec<CounterSnapshot>,
}

impl StatsSampler {
    pub fn new(table: Arc<CounterTable>, writers: Vec<StatsWriter>, interval: Duration) -> Self {
        Self {
            table,
            writers,
            interval,
            previous: Vec::new(),
        }
    }

    /// Build the writers `config` enables.
    ///
    /// Fails only when the state log cannot be opened.
    pub fn from_config(table: Arc<CounterTable>, config: &StatsConfig) -> io::Result<Self> {
        let mut writers = Vec::new();
        if config.state_log_enabled {
            writers.push(StatsWriter::StateLog(StateLogWriter::open(Path::new(
                &config.state_log_dir,
            ))?));
        }
        if config.key_value_enabled {
            writers.push(StatsWriter::KeyValue(KeyValueWriter::new()));
        }
        if config.metrics_enabled {
            writers.push(StatsWriter::Metrics(MetricsWriter::new(config.metrics_resolution)));
        }
        Ok(Self::new(table, writers, config.sample_interval_duration()))
    }

    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }

    /// Take a sample and remember it as the baseline for the next one.
    pub fn sample(&mut self) -> Sample {
        let current = self.table.snapshot();
        let sample = Sample::from_snapshots(&current, &self.previous);
        self.previous = current;
        sample
    }

    /// Sample once and hand the result to every writer.
    pub fn tick(&mut self, now: DateTime<Local>) {
        let sample = self.sample();
        for w in &mut self.writers {
            if let Err(e) = w.write(&sample, now) {
                debug!(writer = w.name(), error = %e, "Stats write failed");
            }
        }
    }

    /// Sample every interval until `shutdown` flips to true, then close the
    /// writers.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if self.writers.is_empty() {
            debug!("No stats writers configured");
            return;
        }
        info!(
            interval_ms = self.interval.as_millis() as u64,
            writers = self.writers.len(),
            "Stats sampler started"
        );

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    // A dropped handle also stops sampling.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    self.tick(Local::now());
                }
            }
        }

        for w in &mut self.writers {
            if let Err(e) = w.close() {
                warn!(writer = w.name(), error = %e, "Failed to close stats writer");
            }
        }
        info!("Stats sampler stopped");
    }

    /// Run on a background task.
    pub fn spawn(self) -> StatsHandle {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(rx));
        StatsHandle { shutdown: tx, handle }
    }
}

/// Stops a spawned sampler.
pub struct StatsHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl StatsHandle {
    /// Signal the sampler and wait for it to close its writers.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Stats sampler task failed");
        }
    }
}
