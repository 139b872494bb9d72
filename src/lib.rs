//! # Replication Delivery
//!
//! Best-effort, asynchronous replication of write operations from a
//! key-value proxy worker to one or more remote targets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                         ReplicationDelivery (per worker)                    │
//! │                                                                             │
//! │  submit() ──► ┌───────────────┐   ┌──────────────────────────────────────┐  │
//! │  (never       │ DeliveryQueue │──►│ ConnectionPool: N send loops         │  │
//! │   blocks)     │ (bounded, one │   │  dial ─► buffer ─► flush ─► recycle  │──┼──► target
//! │               │  per target)  │   │  backoff on failure                  │  │
//! │               └───────────────┘   └──────────────────────────────────────┘  │
//! │                      │ full: drop                     │ lost: errors        │
//! │                      ▼                                ▼                     │
//! │               ┌────────────────────────────────────────────────┐            │
//! │               │ CounterTable (worker × target: conns/drops/errs)│───► StatsSampler
//! │               └────────────────────────────────────────────────┘            │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Submission never waits on the network: a full queue drops the envelope and
//! counts it. Send loops own their connections and reconnect with exponential
//! backoff. Shutdown drains within a deadline, then discards what is left.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replication_delivery::{CounterTable, DeliveryConfig, ReplicationDelivery, TargetSelector};
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> replication_delivery::Result<()> {
//!     let config = DeliveryConfig::load("config.toml".as_ref())?;
//!     let names = config.targets.iter().map(|t| t.name.clone()).collect();
//!     let table = Arc::new(CounterTable::new(1, names));
//!
//!     let mut delivery = ReplicationDelivery::with_tcp(0, &config, table);
//!     delivery.start()?;
//!     delivery.submit(TargetSelector::All, "users", Bytes::from_static(b"op"));
//!
//!     delivery.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod counters;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod profile;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod resilience;
pub mod stats;
pub mod transport;

// Re-exports for convenience
pub use config::{DeliveryConfig, Endpoint, ReplicationTarget, StatsConfig};
pub use coordinator::{
    DeliveryState, ReplicationDelivery, ShutdownReport, SubmitReport, TargetSelector,
};
pub use counters::{CounterSnapshot, CounterTable, DeliveryCounters};
pub use envelope::DeliveryEnvelope;
pub use error::{DeliveryError, Rejected, Result};
pub use pool::ConnState;
pub use profile::{OutboundProfile, OutboundProfileMap};
pub use protocol::ProtocolVariant;
pub use registry::TargetRegistry;
pub use stats::{StatsHandle, StatsSampler};
pub use transport::{TcpTransport, Transport};
