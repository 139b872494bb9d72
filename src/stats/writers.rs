//! Stats outputs.

use super::{ColumnKind, Sample, StatsSink, WorkerSample};
use crate::metrics;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Name of the state log inside its directory.
pub const STATE_LOG_FILE: &str = "state.log";

/// Rows between repeated headers.
const HEADER_EVERY: usize = 23;

const MIN_COLUMN_WIDTH: usize = 5;

const TIMESTAMP_FORMAT: &str = "%m-%d %H:%M:%S";

// ═══════════════════════════════════════════════════════════════════════════════
// StateLog: fixed-width table appended to a file
// ═══════════════════════════════════════════════════════════════════════════════

/// Appends one fixed-width row per worker and tick, repeating the column
/// header every 23 rows.
///
/// ```text
/// 10-17 09:30:01  id t0_c  t0_d  t0_e
/// 10-17 09:30:01   0     1     0     0
/// 10-17 09:30:01   1     1     0     2
/// ```
#[derive(Debug)]
pub struct StateLogWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    rows: usize,
}

impl StateLogWriter {
    /// Open `<dir>/state.log` for appending, creating `dir` if needed.
    pub fn open(dir: &Path) -> io::Result<Self> {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
        let path = dir.join(STATE_LOG_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            out: Some(BufWriter::new(file)),
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }
}

fn column_width(name: &str) -> usize {
    name.len().max(MIN_COLUMN_WIDTH)
}

fn header_line(timestamp: &str, row: &WorkerSample) -> String {
    let mut line = format!("{timestamp} {:>3} ", "id");
    for c in &row.columns {
        line.push_str(&format!("{:>w$} ", c.name, w = column_width(&c.name)));
    }
    line.trim_end().to_string()
}

fn data_line(timestamp: &str, row: &WorkerSample) -> String {
    let mut line = format!("{timestamp} {:>3} ", row.worker);
    for c in &row.columns {
        line.push_str(&format!("{:>w$} ", c.value, w = column_width(&c.name)));
    }
    line.trim_end().to_string()
}

impl StatsSink for StateLogWriter {
    fn write(&mut self, sample: &Sample, now: DateTime<Local>) -> io::Result<()> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "state log closed"))?;
        let ts = now.format(TIMESTAMP_FORMAT).to_string();
        for row in &sample.workers {
            if self.rows % HEADER_EVERY == 0 {
                writeln!(out, "{}", header_line(&ts, row))?;
            }
            writeln!(out, "{}", data_line(&ts, row))?;
            self.rows += 1;
        }
        out.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        match self.out.take() {
            Some(mut out) => out.flush(),
            None => Ok(()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// KeyValue: one structured log event per worker
// ═══════════════════════════════════════════════════════════════════════════════

/// `t0_c=1&t0_d=0&t0_e=2`
pub fn format_key_values(row: &WorkerSample) -> String {
    row.columns
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("&")
}

/// Emits each worker's row as an `info` event on the
/// `replication_delivery::state` target.
#[derive(Debug, Default)]
pub struct KeyValueWriter {
    events: u64,
}

impl KeyValueWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> u64 {
        self.events
    }
}

impl StatsSink for KeyValueWriter {
    fn write(&mut self, sample: &Sample, _now: DateTime<Local>) -> io::Result<()> {
        for row in &sample.workers {
            let values = format_key_values(row);
            info!(target: "replication_delivery::state", worker = row.worker, "{}", values);
            self.events += 1;
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Metrics: gauges published every `resolution` ticks
// ═══════════════════════════════════════════════════════════════════════════════

/// Publishes samples as gauges on every `resolution`-th tick, starting with
/// the first. Delta columns are summed over the ticks in between.
#[derive(Debug)]
pub struct MetricsWriter {
    resolution: u32,
    ticks: u64,
    pending: HashMap<(usize, String), u64>,
}

impl MetricsWriter {
    pub fn new(resolution: u32) -> Self {
        Self {
            resolution: resolution.max(1),
            ticks: 0,
            pending: HashMap::new(),
        }
    }

    /// Fold in one sample. Returns the values to publish when this tick is
    /// a publishing tick.
    pub fn collect(&mut self, sample: &Sample) -> Option<Vec<(usize, String, u64)>> {
        for row in &sample.workers {
            for c in &row.columns {
                let slot = self.pending.entry((row.worker, c.name.clone())).or_insert(0);
                match c.kind {
                    ColumnKind::Gauge => *slot = c.value,
                    ColumnKind::Delta => *slot = slot.saturating_add(c.value),
                }
            }
        }

        let publish = self.ticks % u64::from(self.resolution) == 0;
        self.ticks += 1;
        if !publish {
            return None;
        }

        let mut out: Vec<(usize, String, u64)> = self
            .pending
            .drain()
            .map(|((worker, name), value)| (worker, name, value))
            .collect();
        out.sort();
        Some(out)
    }
}

impl StatsSink for MetricsWriter {
    fn write(&mut self, sample: &Sample, _now: DateTime<Local>) -> io::Result<()> {
        if let Some(values) = self.collect(sample) {
            for (worker, column, value) in values {
                metrics::set_sampled_value(worker, &column, value as f64);
            }
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }
}
