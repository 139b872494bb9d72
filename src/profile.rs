// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound profiles: per-target delivery tuning.
//!
//! A profile governs queueing, pooling and reconnection for one target. Profiles
//! live in an [`OutboundProfileMap`] keyed by target name, with a mandatory
//! `"default"` entry.
//!
//! # Lookup
//!
//! ```text
//! resolve("mirror-1")
//!   ├── io["mirror-1"]   exact match
//!   ├── io["default"]    named default
//!   └── OutboundProfile::default()   built-in constant
//! ```
//!
//! # TOML Example
//!
//! ```toml
//! [io.default]
//! connect_timeout = "1s"
//! max_pending_queue_size = 8092
//! pending_queue_extra = 300
//! reconnect_interval_base = 100
//! reconnect_interval_max = 20000
//!
//! [io.mirror-1]
//! connections_per_target = 4
//! enable_connection_recycle = false
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Name of the fallback profile entry.
pub const DEFAULT_PROFILE_NAME: &str = "default";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_RECYCLE_INTERVAL: Duration = Duration::from_secs(180);
const DEFAULT_GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(2);
const MIN_RECONNECT_BASE_MS: u64 = 1;

/// Delivery tuning parameters for one target.
///
/// Durations are human-readable strings (`"1s"`, `"500ms"`, `"3m"`). A string
/// that does not parse falls back to the built-in value rather than failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundProfile {
    /// Dial timeout for one connection attempt.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// How often a healthy connection is forcibly recycled.
    #[serde(default = "default_connect_recycle_interval")]
    pub connect_recycle_interval: String,

    /// Drain deadline used by shutdown.
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout: String,

    /// Submission buffer size. Used as the queue's pre-allocated capacity.
    #[serde(default = "default_queue_size")]
    pub queue_buffer_size: usize,

    /// Soft queue limit.
    #[serde(default = "default_queue_size")]
    pub max_pending_queue_size: usize,

    /// Overflow allowance on top of the soft limit.
    #[serde(default = "default_pending_queue_extra")]
    pub pending_queue_extra: usize,

    /// Bytes accumulated in the write buffer before a forced flush.
    #[serde(default = "default_io_size")]
    pub max_buffered_write_size: usize,

    /// Fixed read buffer size.
    #[serde(default = "default_io_size")]
    pub io_buffer_size: usize,

    /// First reconnect wait, in milliseconds.
    #[serde(default = "default_reconnect_interval_base")]
    pub reconnect_interval_base: u64,

    /// Reconnect wait ceiling, in milliseconds.
    #[serde(default = "default_reconnect_interval_max")]
    pub reconnect_interval_max: u64,

    /// Pool size.
    #[serde(default = "default_connections_per_target")]
    pub connections_per_target: usize,

    /// Whether periodic forced reconnect is active.
    #[serde(default = "default_true")]
    pub enable_connection_recycle: bool,
}

fn default_connect_timeout() -> String {
    "1s".to_string()
}

fn default_connect_recycle_interval() -> String {
    "180s".to_string()
}

fn default_graceful_shutdown_timeout() -> String {
    "2s".to_string()
}

fn default_queue_size() -> usize {
    8092
}

fn default_pending_queue_extra() -> usize {
    300
}

fn default_io_size() -> usize {
    64 * 1024
}

fn default_reconnect_interval_base() -> u64 {
    100 // 100ms
}

fn default_reconnect_interval_max() -> u64 {
    20_000 // 20 seconds
}

fn default_connections_per_target() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl Default for OutboundProfile {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            connect_recycle_interval: default_connect_recycle_interval(),
            graceful_shutdown_timeout: default_graceful_shutdown_timeout(),
            queue_buffer_size: 8092,
            max_pending_queue_size: 8092,
            pending_queue_extra: 300,
            max_buffered_write_size: 64 * 1024,
            io_buffer_size: 64 * 1024,
            reconnect_interval_base: 100,
            reconnect_interval_max: 20_000,
            connections_per_target: 1,
            enable_connection_recycle: true,
        }
    }
}

impl OutboundProfile {
    /// Parse `connect_timeout`, falling back to 1s.
    pub fn connect_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.connect_timeout).unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    /// Parse `connect_recycle_interval`, falling back to 180s.
    ///
    /// A zero interval is treated as the fallback so a recycle timer can never
    /// spin.
    pub fn connect_recycle_duration(&self) -> Duration {
        match humantime::parse_duration(&self.connect_recycle_interval) {
            Ok(d) if !d.is_zero() => d,
            _ => DEFAULT_RECYCLE_INTERVAL,
        }
    }

    /// Parse `graceful_shutdown_timeout`, falling back to 2s.
    pub fn graceful_shutdown_duration(&self) -> Duration {
        humantime::parse_duration(&self.graceful_shutdown_timeout)
            .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN)
    }

    /// Hard queue capacity: soft limit plus overflow allowance.
    pub fn queue_capacity(&self) -> usize {
        self.max_pending_queue_size
            .saturating_add(self.pending_queue_extra)
    }

    /// Pool size, never below one.
    pub fn pool_size(&self) -> usize {
        self.connections_per_target.max(1)
    }

    /// Reconnect backoff floor, never below 1ms.
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_base.max(MIN_RECONNECT_BASE_MS))
    }

    /// Reconnect backoff ceiling (never below the floor).
    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_max).max(self.reconnect_base())
    }

    /// Profile with small sizes and fast timers for tests.
    pub fn for_testing() -> Self {
        Self {
            connect_timeout: "200ms".to_string(),
            connect_recycle_interval: "180s".to_string(),
            graceful_shutdown_timeout: "2s".to_string(),
            queue_buffer_size: 64,
            max_pending_queue_size: 64,
            pending_queue_extra: 8,
            max_buffered_write_size: 4 * 1024,
            io_buffer_size: 4 * 1024,
            reconnect_interval_base: 10,
            reconnect_interval_max: 200,
            connections_per_target: 1,
            enable_connection_recycle: false,
        }
    }
}

/// Profiles keyed by target name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboundProfileMap(BTreeMap<String, OutboundProfile>);

impl OutboundProfileMap {
    /// Empty map (no `"default"` entry yet).
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Map holding only the built-in profile under `"default"`.
    pub fn with_builtin_default() -> Self {
        let mut map = Self::new();
        map.set_default_if_not_defined();
        map
    }

    /// Insert or replace a profile.
    pub fn insert(&mut self, name: impl Into<String>, profile: OutboundProfile) {
        self.0.insert(name.into(), profile);
    }

    /// Exact-name lookup.
    pub fn get(&self, name: &str) -> Option<&OutboundProfile> {
        self.0.get(name)
    }

    /// Number of named profiles.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ensure a `"default"` entry exists, synthesizing it from the built-in
    /// constant when the configuration did not define one.
    pub fn set_default_if_not_defined(&mut self) {
        self.0
            .entry(DEFAULT_PROFILE_NAME.to_string())
            .or_default();
    }

    /// Resolve the profile for a target: exact name, then `"default"`, then the
    /// built-in constant.
    pub fn resolve(&self, target_name: &str) -> OutboundProfile {
        self.0
            .get(target_name)
            .or_else(|| self.0.get(DEFAULT_PROFILE_NAME))
            .cloned()
            .unwrap_or_default()
    }
}
