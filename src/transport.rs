// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pluggable transports for target connections.
//!
//! The send loops only need a byte stream; how it is obtained is behind the
//! [`Transport`] trait so tests can substitute in-memory pipes. The dial
//! timeout is applied by the caller, not by the transport.

use crate::config::Endpoint;
use crate::error::{DeliveryError, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Dials target endpoints.
pub trait Transport: Send + Sync + 'static {
    /// Connected byte stream.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open one connection to `endpoint`.
    fn dial<'a>(
        &'a self,
        endpoint: &'a Endpoint,
    ) -> Pin<Box<dyn Future<Output = Result<Self::Stream>> + Send + 'a>>;
}

/// Address family accepted by a network name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    fn from_network(network: &str) -> Option<Self> {
        match network {
            "tcp" => Some(Family::Any),
            "tcp4" => Some(Family::V4),
            "tcp6" => Some(Family::V6),
            _ => None,
        }
    }

    fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Any => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

/// Plain TCP transport (`tcp`, `tcp4`, `tcp6`).
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    async fn connect(endpoint: &Endpoint) -> Result<TcpStream> {
        let family = Family::from_network(&endpoint.network).ok_or_else(|| {
            DeliveryError::UnsupportedNetwork {
                network: endpoint.network.clone(),
                addr: endpoint.addr.clone(),
            }
        })?;

        let candidates = tokio::net::lookup_host(endpoint.addr.as_str())
            .await
            .map_err(|e| DeliveryError::Connect {
                target: endpoint.addr.clone(),
                message: format!("resolve failed: {}", e),
            })?;

        let mut last_err: Option<std::io::Error> = None;
        for addr in candidates.filter(|a| family.admits(a)) {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    // Frames are batched by the send loop already.
                    let _ = stream.set_nodelay(true);
                    debug!(addr = %addr, "TCP connection established");
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(DeliveryError::Connect {
            target: endpoint.addr.clone(),
            message: match last_err {
                Some(e) => e.to_string(),
                None => format!("no {} address found", endpoint.network),
            },
        })
    }
}

impl Transport for TcpTransport {
    type Stream = TcpStream;

    fn dial<'a>(
        &'a self,
        endpoint: &'a Endpoint,
    ) -> Pin<Box<dyn Future<Output = Result<TcpStream>> + Send + 'a>> {
        Box::pin(Self::connect(endpoint))
    }
}
