// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for replication delivery.
//!
//! Nothing in this crate is fatal to the owning process. Errors surface in two
//! places: as [`DeliveryError`] values inside the send loops (where they drive
//! reconnection and counter increments) and as [`Rejected`] from a queue submit.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Io` | Yes | Write, flush or read failure on an established connection |
//! | `Connect` | Yes | Dial refused or failed |
//! | `ConnectTimeout` | Yes | Dial exceeded `connect_timeout` |
//! | `TargetClosed` | Yes | Target closed the connection (EOF) |
//! | `UnsupportedNetwork` | No | Endpoint network the transport cannot dial |
//! | `Config` | No | Configuration file unreadable or unparsable |
//! | `Frame` | No | Malformed or oversized frame |
//! | `InvalidState` | No | Service lifecycle violation |
//! | `Shutdown` | No | Shutdown in progress |

use std::time::Duration;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised inside the delivery subsystem.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Configuration file could not be read, parsed or rendered.
    ///
    /// Malformed *targets* never produce this; they are repaired or dropped
    /// silently by validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O failure on an established connection.
    #[error("I/O error ({operation}): {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Dial to a target failed.
    #[error("Connect error ({target}): {message}")]
    Connect { target: String, message: String },

    /// Dial did not complete within `connect_timeout`.
    #[error("Connect to {target} timed out after {}ms", timeout.as_millis())]
    ConnectTimeout { target: String, timeout: Duration },

    /// The endpoint names a network family the transport does not support.
    #[error("Unsupported network '{network}' for {addr}")]
    UnsupportedNetwork { network: String, addr: String },

    /// The target closed its side of the connection.
    #[error("Target {0} closed the connection")]
    TargetClosed(String),

    /// Frame could not be encoded or decoded.
    #[error("Frame error: {0}")]
    Frame(String),

    /// Lifecycle method called in the wrong state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,
}

impl DeliveryError {
    /// Wrap an I/O error with the operation that produced it.
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }

    /// Check if this error should send the connection back to reconnect.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connect { .. } => true,
            Self::ConnectTimeout { .. } => true,
            Self::TargetClosed(_) => true,
            Self::UnsupportedNetwork { .. } => false,
            Self::Config(_) => false,
            Self::Frame(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Io { .. } => "io",
            Self::Connect { .. } => "connect",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::UnsupportedNetwork { .. } => "unsupported_network",
            Self::TargetClosed(_) => "target_closed",
            Self::Frame(_) => "frame",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Why a queue refused an envelope.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// Depth reached `max_pending_queue_size + pending_queue_extra`.
    #[error("delivery queue full")]
    QueueFull,

    /// Queue is in reject-new mode (shutdown started).
    #[error("delivery queue closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_io() {
        let err = DeliveryError::io(
            "flush",
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe"),
        );
        assert!(err.is_retryable());
        assert!(err.to_string().contains("flush"));
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn test_is_retryable_connect() {
        let err = DeliveryError::Connect {
            target: "mirror-1".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("mirror-1"));
    }

    #[test]
    fn test_connect_timeout_formatting() {
        let err = DeliveryError::ConnectTimeout {
            target: "t0".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Connect to t0 timed out after 1000ms");
    }

    #[test]
    fn test_target_closed_is_retryable() {
        assert!(DeliveryError::TargetClosed("t1".into()).is_retryable());
    }

    #[test]
    fn test_not_retryable_unsupported_network() {
        let err = DeliveryError::UnsupportedNetwork {
            network: "udp".to_string(),
            addr: "127.0.0.1:9000".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("udp"));
    }

    #[test]
    fn test_not_retryable_config_frame_state() {
        assert!(!DeliveryError::Config("bad toml".into()).is_retryable());
        assert!(!DeliveryError::Frame("truncated".into()).is_retryable());
        assert!(!DeliveryError::Shutdown.is_retryable());
        let err = DeliveryError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_rejected_display() {
        assert_eq!(Rejected::QueueFull.to_string(), "delivery queue full");
        assert_eq!(Rejected::Closed.to_string(), "delivery queue closed");
    }
}
