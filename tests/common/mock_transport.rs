//! In-memory transport for tests.
//!
//! Every successful dial creates a duplex pipe: the client half goes to the
//! send loop, the target half is delivered on a channel so tests can read
//! frames, stall, or hang up.

use bytes::BytesMut;
use replication_delivery::protocol::{decode_frame, Frame, ProtocolVariant};
use replication_delivery::{DeliveryError, Endpoint, Result, Transport};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;

/// Target side of one accepted connection.
#[derive(Debug)]
pub struct Accepted {
    pub addr: String,
    pub stream: DuplexStream,
}

#[derive(Debug)]
struct Inner {
    attempts: AtomicUsize,
    failed: AtomicUsize,
    fail_next: AtomicUsize,
    down: AtomicBool,
    dial_delay: Duration,
    pipe_size: usize,
    accepted: mpsc::UnboundedSender<Accepted>,
}

/// Cloneable handle; clones share state.
#[derive(Debug, Clone)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

impl MockTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Accepted>) {
        Self::with_options(Duration::ZERO, 64 * 1024)
    }

    /// Each dial waits `dial_delay`; each pipe buffers `pipe_size` bytes.
    pub fn with_options(
        dial_delay: Duration,
        pipe_size: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Accepted>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            attempts: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            down: AtomicBool::new(false),
            dial_delay,
            pipe_size,
            accepted: tx,
        };
        (Self { inner: Arc::new(inner) }, rx)
    }

    /// Refuse the next `n` dials.
    pub fn fail_next(&self, n: usize) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Refuse every dial while down.
    pub fn set_down(&self, down: bool) {
        self.inner.down.store(down, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Dials refused so far.
    pub fn failed(&self) -> usize {
        self.inner.failed.load(Ordering::SeqCst)
    }

    fn refuse(&self) -> bool {
        if self.inner.down.load(Ordering::SeqCst) {
            return true;
        }
        self.inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Transport for MockTransport {
    type Stream = DuplexStream;

    fn dial<'a>(
        &'a self,
        endpoint: &'a Endpoint,
    ) -> Pin<Box<dyn Future<Output = Result<DuplexStream>> + Send + 'a>> {
        Box::pin(async move {
            self.inner.attempts.fetch_add(1, Ordering::SeqCst);
            if !self.inner.dial_delay.is_zero() {
                tokio::time::sleep(self.inner.dial_delay).await;
            }
            if self.refuse() {
                self.inner.failed.fetch_add(1, Ordering::SeqCst);
                return Err(DeliveryError::Connect {
                    target: endpoint.addr.clone(),
                    message: "connection refused".to_string(),
                });
            }
            let (client, server) = tokio::io::duplex(self.inner.pipe_size);
            // A test that stopped listening just gets a dead peer.
            let _ = self.inner.accepted.send(Accepted {
                addr: endpoint.addr.clone(),
                stream: server,
            });
            Ok(client)
        })
    }
}

/// Reads frames off the target side of a connection.
pub struct FrameReader {
    stream: DuplexStream,
    variant: ProtocolVariant,
    buf: BytesMut,
}

impl FrameReader {
    pub fn new(stream: DuplexStream, variant: ProtocolVariant) -> Self {
        Self {
            stream,
            variant,
            buf: BytesMut::new(),
        }
    }

    /// Next frame, or `None` once the sender hung up.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some((frame, used)) = decode_frame(self.variant, &self.buf).expect("valid frame") {
                let _ = self.buf.split_to(used);
                return Some(frame);
            }
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// Read until the sender hangs up, returning every frame.
    pub async fn read_to_end(mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(f) = self.next_frame().await {
            frames.push(f);
        }
        frames
    }
}
