// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-(worker, target) delivery counters.
//!
//! One [`CounterTable`] is shared by every worker of the process and by the
//! stats sampler. Each cell is written by exactly one delivery service and read
//! by anyone.
//!
//! ```text
//!              target 0          target 1          ...
//!            ┌─────────────────┬─────────────────┐
//! worker 0   │ conns drops errs│ conns drops errs│
//! worker 1   │ conns drops errs│ conns drops errs│
//!            └─────────────────┴─────────────────┘
//! exported as  <target>_c       <target>_d        <target>_e
//! ```
//!
//! Counters are cumulative and only reset by a restart, with the exception of
//! the live connection count which shutdown zeroes.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Atomic counters for one (worker, target) pair.
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    connections: AtomicU32,
    drops: AtomicU64,
    errors: AtomicU64,
}

impl DeliveryCounters {
    /// A connection reached `Connected`.
    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// A connection left `Connected`. Never goes below zero.
    pub fn connection_closed(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Zero the live connection count.
    pub fn reset_connections(&self) {
        self.connections.store(0, Ordering::Relaxed);
    }

    /// One envelope refused at submission.
    pub fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    /// `n` envelopes or dials that failed after admission.
    pub fn record_errors(&self, n: u64) {
        if n > 0 {
            self.errors.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Point-in-time copy of one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub worker: usize,
    pub target: String,
    pub connections: u32,
    pub drops: u64,
    pub errors: u64,
}

/// Grid of counters indexed by worker slot and target slot.
#[derive(Debug)]
pub struct CounterTable {
    num_workers: usize,
    targets: Vec<String>,
    cells: Vec<Arc<DeliveryCounters>>,
}

impl CounterTable {
    /// Allocate `num_workers × target_names.len()` zeroed cells.
    pub fn new(num_workers: usize, target_names: Vec<String>) -> Self {
        let cells = (0..num_workers * target_names.len())
            .map(|_| Arc::new(DeliveryCounters::default()))
            .collect();
        Self {
            num_workers,
            targets: target_names,
            cells,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Target names in column order.
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Cell for a (worker, target) pair, `None` when out of range.
    pub fn counters(&self, worker: usize, target: usize) -> Option<Arc<DeliveryCounters>> {
        if worker >= self.num_workers || target >= self.targets.len() {
            return None;
        }
        self.cells
            .get(worker * self.targets.len() + target)
            .map(Arc::clone)
    }

    /// Copy of every cell, worker-major.
    pub fn snapshot(&self) -> Vec<CounterSnapshot> {
        let mut out = Vec::with_capacity(self.cells.len());
        for worker in 0..self.num_workers {
            for (t, name) in self.targets.iter().enumerate() {
                let cell = &self.cells[worker * self.targets.len() + t];
                out.push(CounterSnapshot {
                    worker,
                    target: name.clone(),
                    connections: cell.connections(),
                    drops: cell.drops(),
                    errors: cell.errors(),
                });
            }
        }
        out
    }

    /// Export column names: `<target>_c`, `<target>_d`, `<target>_e` per target.
    pub fn column_names(&self) -> Vec<String> {
        self.targets
            .iter()
            .flat_map(|t| [connections_column(t), drops_column(t), errors_column(t)])
            .collect()
    }
}

pub fn connections_column(target: &str) -> String {
    format!("{}_c", target)
}

pub fn drops_column(target: &str) -> String {
    format!("{}_d", target)
}

pub fn errors_column(target: &str) -> String {
    format!("{}_e", target)
}
