//! Shared test utilities for integration, property and chaos tests.
//!
//! This module provides:
//! - An in-memory transport handing the target side of each connection to the test
//! - A frame reader for that target side
//! - Config and service builders

#![allow(dead_code)]

pub mod mock_transport;

pub use mock_transport::*;

use replication_delivery::{
    CounterTable, DeliveryConfig, OutboundProfile, OutboundProfileMap, ReplicationDelivery,
    ReplicationTarget, StatsConfig, TargetRegistry,
};
use std::sync::Arc;
use std::time::Duration;

/// Config with `targets` all using `profile` as the default.
pub fn config_with(targets: Vec<ReplicationTarget>, profile: OutboundProfile) -> DeliveryConfig {
    let mut io = OutboundProfileMap::new();
    io.insert("default", profile);
    DeliveryConfig {
        targets,
        io,
        stats: StatsConfig::disabled(),
    }
}

/// One-worker service over a mock transport.
pub fn service(config: &DeliveryConfig, transport: &MockTransport) -> ReplicationDelivery<MockTransport> {
    let names = TargetRegistry::new(config.targets.clone()).names();
    let table = Arc::new(CounterTable::new(1, names));
    ReplicationDelivery::new(0, config, table, transport.clone())
}

/// Poll `cond` every 5ms until it holds, panicking after `within`.
pub async fn eventually<F: FnMut() -> bool>(within: Duration, what: &str, mut cond: F) {
    let deadline = tokio::time::Instant::now() + within;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
