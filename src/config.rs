//! Configuration for replication delivery.
//!
//! The configuration is loaded once at process start from a TOML file, then
//! validated. Validation is lenient: a malformed target is repaired or dropped,
//! never reported as an error, so one bad entry cannot stop startup.
//!
//! # Quick Start
//!
//! ```rust
//! use replication_delivery::config::{DeliveryConfig, ReplicationTarget};
//!
//! let mut config = DeliveryConfig {
//!     targets: vec![
//!         ReplicationTarget::for_testing("", "10.0.0.7:5080"),
//!         ReplicationTarget::for_testing("broken", "   "),
//!     ],
//!     ..Default::default()
//! };
//! config.validate();
//!
//! assert_eq!(config.targets.len(), 1);
//! assert_eq!(config.targets[0].name, "t0");
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! DeliveryConfig
//! ├── targets: Vec<ReplicationTarget>
//! │   ├── name                      # synthesized as t<index> when empty
//! │   ├── network / addr            # network defaults to "tcp"
//! │   ├── use_compat_protocol       # frame encoding selector
//! │   ├── namespaces                # allow-list, empty = all
//! │   └── bypass_local_txn_manager
//! ├── io: OutboundProfileMap        # "default" + per-target overrides
//! └── stats: StatsConfig            # sampler outputs
//! ```
//!
//! # TOML Example
//!
//! ```toml
//! [[targets]]
//! name = "mirror-1"
//! addr = "10.0.0.7:5080"
//! namespaces = ["orders"]
//!
//! [[targets]]
//! addr = "10.0.0.8:5080"
//! use_compat_protocol = true
//!
//! [io.default]
//! connect_timeout = "1s"
//! connections_per_target = 2
//! ```

use crate::error::{DeliveryError, Result};
use crate::profile::{OutboundProfile, OutboundProfileMap};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Network family used when a target leaves it unset.
pub const DEFAULT_NETWORK: &str = "tcp";

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Target list plus outbound profile map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Downstream destinations.
    #[serde(default)]
    pub targets: Vec<ReplicationTarget>,

    /// Delivery tuning keyed by target name.
    #[serde(default)]
    pub io: OutboundProfileMap,

    /// Counter sampling and its outputs.
    #[serde(default)]
    pub stats: StatsConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            io: OutboundProfileMap::with_builtin_default(),
            stats: StatsConfig::default(),
        }
    }
}

impl DeliveryConfig {
    /// Repair or drop malformed targets, then make sure a `"default"` profile
    /// exists. Never fails.
    pub fn validate(&mut self) {
        validate_targets(&mut self.targets);
        self.io.set_default_if_not_defined();
    }

    /// Profile for a target (exact name, `"default"`, built-in).
    pub fn profile_for(&self, target: &ReplicationTarget) -> OutboundProfile {
        self.io.resolve(&target.name)
    }

    /// Parse TOML and validate.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(contents)
            .map_err(|e| DeliveryError::Config(format!("failed to parse config: {e}")))?;
        config.validate();
        Ok(config)
    }

    /// Read a TOML file and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            DeliveryError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&contents)?;
        debug!(
            path = %path.display(),
            targets = config.targets.len(),
            profiles = config.io.len(),
            "Loaded delivery config"
        );
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DeliveryError::Config(format!("failed to render config: {e}")))
    }

    /// Render as pretty-printed JSON.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DeliveryError::Config(format!("failed to render config: {e}")))
    }

    /// Render as TOML and write to `path`, creating parent directories.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| {
                DeliveryError::Config(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        let contents = self.to_toml_string()?;
        fs::write(path, contents).map_err(|e| {
            DeliveryError::Config(format!("failed to write {}: {e}", path.display()))
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StatsConfig: counter sampling
// ═══════════════════════════════════════════════════════════════════════════════

/// Which outputs the stats sampler writes to, and how often it samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Sampling period (e.g., "1s").
    #[serde(default = "default_sample_interval")]
    pub sample_interval: String,

    /// Append samples to `<state_log_dir>/state.log`.
    #[serde(default = "default_true")]
    pub state_log_enabled: bool,

    /// Directory of the state log; created when missing.
    #[serde(default = "default_state_log_dir")]
    pub state_log_dir: String,

    /// Emit one `name=value&...` log event per worker and tick.
    #[serde(default)]
    pub key_value_enabled: bool,

    /// Publish samples as metrics gauges.
    #[serde(default)]
    pub metrics_enabled: bool,

    /// Publish to metrics every this many ticks.
    #[serde(default = "default_metrics_resolution")]
    pub metrics_resolution: u32,
}

fn default_sample_interval() -> String {
    "1s".to_string()
}

fn default_true() -> bool {
    true
}

fn default_state_log_dir() -> String {
    "./".to_string()
}

fn default_metrics_resolution() -> u32 {
    60
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            sample_interval: default_sample_interval(),
            state_log_enabled: true,
            state_log_dir: default_state_log_dir(),
            key_value_enabled: false,
            metrics_enabled: false,
            metrics_resolution: default_metrics_resolution(),
        }
    }
}

impl StatsConfig {
    /// Parse `sample_interval`, falling back to 1s (also for zero).
    pub fn sample_interval_duration(&self) -> Duration {
        match humantime::parse_duration(&self.sample_interval) {
            Ok(d) if !d.is_zero() => d,
            _ => Duration::from_secs(1),
        }
    }

    /// Config with every output off.
    pub fn disabled() -> Self {
        Self {
            state_log_enabled: false,
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationTarget: one entry per downstream destination
// ═══════════════════════════════════════════════════════════════════════════════

/// Network address of a target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Network family (`tcp`, `tcp4`, `tcp6`).
    #[serde(default)]
    pub network: String,

    /// `host:port`.
    #[serde(default)]
    pub addr: String,
}

impl Endpoint {
    /// TCP endpoint for `addr`.
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self {
            network: DEFAULT_NETWORK.to_string(),
            addr: addr.into(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.network, self.addr)
    }
}

/// One configured downstream destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTarget {
    /// Unique name; `t<index>` is synthesized when empty.
    #[serde(default)]
    pub name: String,

    /// Where to dial.
    #[serde(flatten)]
    pub endpoint: Endpoint,

    /// Use the compat frame encoding instead of the native one.
    #[serde(default)]
    pub use_compat_protocol: bool,

    /// Namespaces replicated to this target. Empty means all.
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Deliver even when the namespace filter would discard.
    #[serde(default)]
    pub bypass_local_txn_manager: bool,
}

impl ReplicationTarget {
    /// Whether an envelope for `namespace` should be delivered to this target.
    pub fn accepts(&self, namespace: &str) -> bool {
        self.bypass_local_txn_manager
            || self.namespaces.is_empty()
            || self.namespaces.iter().any(|ns| ns == namespace)
    }

    /// Whether validation would keep this target.
    pub fn has_address(&self) -> bool {
        !self.endpoint.addr.trim().is_empty()
    }

    /// Create a target for testing.
    pub fn for_testing(name: &str, addr: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: Endpoint {
                network: String::new(),
                addr: addr.to_string(),
            },
            use_compat_protocol: false,
            namespaces: Vec::new(),
            bypass_local_txn_manager: false,
        }
    }
}

/// Compact the target list in place.
///
/// Walks from last to first so a removal never shifts an index that is still to
/// be examined. Entries with an empty (or all-whitespace) address are removed;
/// survivors get `t<index>` as a name when unnamed and `"tcp"` as network when
/// unset. The synthesized index is the entry's position before compaction.
pub fn validate_targets(targets: &mut Vec<ReplicationTarget>) {
    for i in (0..targets.len()).rev() {
        if !targets[i].has_address() {
            let removed = targets.remove(i);
            warn!(
                index = i,
                name = %removed.name,
                "Dropping replication target with empty address"
            );
            continue;
        }
        let target = &mut targets[i];
        if target.name.is_empty() {
            target.name = format!("t{}", i);
        }
        if target.endpoint.network.is_empty() {
            target.endpoint.network = DEFAULT_NETWORK.to_string();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
