// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dispatcher: one send loop per connection slot.
//!
//! Each loop:
//! 1. Dials its target, backing off on failure
//! 2. Takes envelopes from the target queue
//! 3. Drops envelopes outside the target's namespace allow-list
//! 4. Encodes frames into a write buffer, flushing when the queue has nothing
//!    immediately available or the buffer reaches `max_buffered_write_size`
//! 5. Watches the read side only to notice the target closing the connection
//!
//! # Failure Accounting
//!
//! A failed write or flush costs one error for every envelope still sitting
//! in the write buffer; they are discarded, never retried. The connection is
//! dropped and the slot dials again. Delivered envelopes are not counted in
//! the counter table.
//!
//! # Shutdown
//!
//! On `Draining` a connected loop keeps consuming until the queue is empty and
//! the buffer flushed, then exits. On `Aborted` it exits at once and counts
//! whatever was unflushed as errors. Unconnected loops exit on either.

use crate::config::ReplicationTarget;
use crate::coordinator::ShutdownPhase;
use crate::counters::DeliveryCounters;
use crate::envelope::DeliveryEnvelope;
use crate::error::DeliveryError;
use crate::metrics;
use crate::pool::{
    connect_with_backoff, staggered_recycle_delay, ConnState, ConnectionPool, ConnectionSlot,
    DialContext,
};
use crate::profile::OutboundProfile;
use crate::protocol::{encode_frame, ProtocolVariant};
use crate::queue::DeliveryQueue;
use crate::resilience::Backoff;
use crate::transport::Transport;
use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{watch, OwnedSemaphorePermit};
use tracing::{debug, info, info_span, warn, Instrument};

/// How long a slot waits before asking again when another slot holds the
/// recycle gate.
const RECYCLE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Everything the send loops of one target share.
#[derive(Debug)]
pub struct TargetPipeline {
    pub target: ReplicationTarget,
    pub name: Arc<str>,
    pub profile: OutboundProfile,
    pub variant: ProtocolVariant,
    pub queue: DeliveryQueue,
    pub pool: ConnectionPool,
    pub counters: Arc<DeliveryCounters>,
    delivered: AtomicU64,
}

impl TargetPipeline {
    pub fn new(
        target: ReplicationTarget,
        profile: OutboundProfile,
        counters: Arc<DeliveryCounters>,
    ) -> Self {
        let name: Arc<str> = Arc::from(target.name.as_str());
        let variant = ProtocolVariant::from_compat_flag(target.use_compat_protocol);
        let queue = DeliveryQueue::from_profile(&profile);
        let pool = ConnectionPool::new(Arc::clone(&name), profile.pool_size());
        Self {
            target,
            name,
            profile,
            variant,
            queue,
            pool,
            counters,
            delivered: AtomicU64::new(0),
        }
    }

    /// Envelopes flushed to the target so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn record_delivered(&self, n: usize) {
        self.delivered.fetch_add(n as u64, Ordering::Relaxed);
        metrics::record_delivered(&self.name, n);
    }

    fn record_lost(&self, n: usize, kind: &'static str) {
        if n == 0 {
            return;
        }
        self.counters.record_errors(n as u64);
        metrics::record_delivery_errors(&self.name, kind, n as u64);
    }
}

/// Encoded frames not yet handed to the socket.
struct WriteBuffer {
    buf: BytesMut,
    envelopes: usize,
    limit: usize,
}

impl WriteBuffer {
    fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            buf: BytesMut::with_capacity(limit),
            envelopes: 0,
            limit,
        }
    }

    fn is_empty(&self) -> bool {
        self.envelopes == 0
    }

    fn would_overflow(&self, frame_len: usize) -> bool {
        !self.is_empty() && self.buf.len() + frame_len > self.limit
    }

    fn is_full(&self) -> bool {
        self.buf.len() >= self.limit
    }

    /// Forget buffered frames, returning how many envelopes they held.
    fn discard(&mut self) -> usize {
        let n = self.envelopes;
        self.buf.clear();
        self.envelopes = 0;
        n
    }
}

/// Why a connected session ended.
enum SessionEnd {
    /// Queue drained or loop aborted; the loop is done.
    Finished,
    /// Connection lost; dial again.
    Failed,
    /// Recycle due; dial again while holding the gate permit.
    Recycle(OwnedSemaphorePermit),
}

/// Run the send loop for one slot until shutdown completes.
pub async fn run_sender<T: Transport>(
    pipeline: Arc<TargetPipeline>,
    slot: Arc<ConnectionSlot>,
    transport: Arc<T>,
    mut phase_rx: watch::Receiver<ShutdownPhase>,
) {
    let span = info_span!("send_loop", target_name = %pipeline.name, slot = slot.index());

    async move {
        debug!("Starting send loop");

        let profile = &pipeline.profile;
        let mut backoff = Backoff::new(profile.reconnect_base(), profile.reconnect_max());
        let recycle_interval = profile
            .enable_connection_recycle
            .then(|| profile.connect_recycle_duration());
        let mut next_recycle = recycle_interval
            .map(|iv| staggered_recycle_delay(iv, slot.index(), pipeline.pool.size()));
        let mut recycle_permit: Option<OwnedSemaphorePermit> = None;

        let ctx = DialContext {
            transport: transport.as_ref(),
            endpoint: &pipeline.target.endpoint,
            connect_timeout: profile.connect_timeout_duration(),
            counters: &pipeline.counters,
        };

        loop {
            let stream = connect_with_backoff(&ctx, &slot, &mut backoff, &mut phase_rx).await;

            // The recycle is over once its reconnect has an outcome.
            if recycle_permit.take().is_some() {
                metrics::record_recycle(&pipeline.name);
                debug!("Recycle complete, gate released");
            }

            let Some(stream) = stream else {
                break;
            };

            slot.set_state(ConnState::Connected);
            pipeline.counters.connection_opened();

            let end = run_session(&pipeline, &slot, stream, next_recycle, &mut phase_rx).await;

            pipeline.counters.connection_closed();
            next_recycle = recycle_interval;

            match end {
                SessionEnd::Finished => break,
                SessionEnd::Failed => {
                    slot.set_state(ConnState::Disconnected);
                }
                SessionEnd::Recycle(permit) => {
                    info!("Recycling connection");
                    recycle_permit = Some(permit);
                }
            }
        }

        slot.set_state(ConnState::Closed);
        debug!("Send loop stopped");
    }
    .instrument(span)
    .await
}

/// Consume the queue over one established connection.
async fn run_session<S>(
    pipeline: &TargetPipeline,
    slot: &ConnectionSlot,
    stream: S,
    recycle_after: Option<Duration>,
    phase_rx: &mut watch::Receiver<ShutdownPhase>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut out = WriteBuffer::new(pipeline.profile.max_buffered_write_size);
    let mut read_buf = vec![0u8; pipeline.profile.io_buffer_size.max(1)];
    let io_timeout = pipeline.profile.connect_timeout_duration();

    // Never polled when recycling is off.
    let recycle_timer = tokio::time::sleep(recycle_after.unwrap_or(Duration::from_secs(86_400)));
    tokio::pin!(recycle_timer);

    loop {
        let phase = *phase_rx.borrow();
        if phase == ShutdownPhase::Aborted {
            let lost = out.discard();
            pipeline.record_lost(lost, "aborted");
            if lost > 0 {
                warn!(lost, "Shutdown deadline hit with unflushed envelopes");
            }
            return SessionEnd::Finished;
        }

        // Take whatever is immediately available.
        if let Some(envelope) = pipeline.queue.try_recv() {
            if let Err(end) =
                buffer_envelope(pipeline, &mut out, &mut writer, envelope, io_timeout, phase_rx)
                    .await
            {
                return end;
            }
            continue;
        }

        // Queue is empty right now: push out what we have.
        if !out.is_empty() {
            if let Err(end) = flush(pipeline, &mut out, &mut writer, io_timeout, phase_rx).await {
                return end;
            }
        }

        if phase == ShutdownPhase::Draining {
            debug!("Queue drained");
            let _ = writer.shutdown().await;
            return SessionEnd::Finished;
        }

        let may_recycle = recycle_after.is_some() && phase == ShutdownPhase::Running;

        tokio::select! {
            biased;

            _ = phase_rx.changed() => {
                // Re-evaluated at the loop head. A dropped sender means the
                // service is gone.
                if phase_rx.has_changed().is_err() {
                    return SessionEnd::Finished;
                }
            }

            read = reader.read(&mut read_buf) => {
                if let Some(err) = read_outcome(&pipeline.name, read) {
                    warn!(error = %err, "Target connection lost");
                    return SessionEnd::Failed;
                }
            }

            _ = &mut recycle_timer, if may_recycle => {
                match pipeline.pool.recycle_gate().try_acquire() {
                    Some(permit) => {
                        slot.set_state(ConnState::Draining);
                        let _ = writer.shutdown().await;
                        return SessionEnd::Recycle(permit);
                    }
                    None => {
                        debug!("Recycle gate busy, retrying shortly");
                        recycle_timer
                            .as_mut()
                            .reset(tokio::time::Instant::now() + RECYCLE_RETRY_DELAY);
                    }
                }
            }

            next = pipeline.queue.recv() => {
                match next {
                    Some(envelope) => {
                        if let Err(end) = buffer_envelope(
                            pipeline, &mut out, &mut writer, envelope, io_timeout, phase_rx,
                        )
                        .await
                        {
                            return end;
                        }
                    }
                    None => {
                        // Closed and empty while still running: shutdown is
                        // about to change the phase.
                        if phase_rx.changed().await.is_err() {
                            return SessionEnd::Finished;
                        }
                    }
                }
            }
        }
    }
}

/// Interpret a read on the otherwise silent read side.
fn read_outcome(target: &str, read: std::io::Result<usize>) -> Option<DeliveryError> {
    match read {
        Ok(0) => Some(DeliveryError::TargetClosed(target.to_string())),
        Ok(_) => None,
        Err(e) => Some(DeliveryError::io("read", e)),
    }
}

/// Filter, encode and buffer one envelope, flushing around it as needed.
async fn buffer_envelope<W>(
    pipeline: &TargetPipeline,
    out: &mut WriteBuffer,
    writer: &mut WriteHalf<W>,
    envelope: DeliveryEnvelope,
    io_timeout: Duration,
    phase_rx: &mut watch::Receiver<ShutdownPhase>,
) -> Result<(), SessionEnd>
where
    W: AsyncRead + AsyncWrite + Unpin + Send,
{
    if !pipeline.target.accepts(&envelope.namespace) {
        metrics::record_filtered(&pipeline.name);
        return Ok(());
    }

    let frame_len = pipeline
        .variant
        .frame_len(envelope.namespace.len(), envelope.payload.len());
    if out.would_overflow(frame_len) {
        if let Err(end) = flush(pipeline, out, writer, io_timeout, phase_rx).await {
            // The envelope in hand is lost with the buffer.
            pipeline.record_lost(1, "unsent");
            return Err(end);
        }
    }

    if let Err(e) = encode_frame(pipeline.variant, &envelope, &mut out.buf) {
        pipeline.record_lost(1, e.kind());
        warn!(namespace = %envelope.namespace, error = %e, "Envelope could not be encoded");
        return Ok(());
    }
    out.envelopes += 1;
    metrics::record_queue_latency(&pipeline.name, envelope.age_ms());

    if out.is_full() {
        flush(pipeline, out, writer, io_timeout, phase_rx).await?;
    }
    Ok(())
}

/// Write the buffer to the socket.
///
/// Bounded by `io_timeout` and interrupted by an abort. Any failure discards
/// the buffer and counts its envelopes as errors.
async fn flush<W>(
    pipeline: &TargetPipeline,
    out: &mut WriteBuffer,
    writer: &mut WriteHalf<W>,
    io_timeout: Duration,
    phase_rx: &mut watch::Receiver<ShutdownPhase>,
) -> Result<(), SessionEnd>
where
    W: AsyncRead + AsyncWrite + Unpin + Send,
{
    let start = Instant::now();
    let bytes = out.buf.len();

    let result = tokio::select! {
        biased;

        _ = phase_rx.wait_for(|p| *p == ShutdownPhase::Aborted) => {
            let lost = out.discard();
            pipeline.record_lost(lost, "aborted");
            warn!(lost, "Flush interrupted by shutdown deadline");
            return Err(SessionEnd::Finished);
        }

        r = tokio::time::timeout(io_timeout, async {
            writer.write_all(&out.buf).await?;
            writer.flush().await
        }) => r,
    };

    let err = match result {
        Ok(Ok(())) => {
            let n = out.envelopes;
            out.buf.clear();
            out.envelopes = 0;
            pipeline.record_delivered(n);
            metrics::record_flush(&pipeline.name, n, bytes, start.elapsed());
            return Ok(());
        }
        Ok(Err(e)) => DeliveryError::io("flush", e),
        Err(_) => DeliveryError::io(
            "flush",
            std::io::Error::new(std::io::ErrorKind::TimedOut, "flush timed out"),
        ),
    };

    let lost = out.discard();
    pipeline.record_lost(lost, err.kind());
    warn!(lost, error = %err, "Write to target failed, reconnecting");
    Err(SessionEnd::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_frame;
    use bytes::Bytes;

    fn pipeline(namespaces: &[&str], bypass: bool) -> TargetPipeline {
        let mut target = ReplicationTarget::for_testing("t0", "mock:1");
        target.namespaces = namespaces.iter().map(|s| s.to_string()).collect();
        target.bypass_local_txn_manager = bypass;
        TargetPipeline::new(
            target,
            OutboundProfile::for_testing(),
            Arc::new(DeliveryCounters::default()),
        )
    }

    fn env(ns: &str, payload: &'static [u8]) -> DeliveryEnvelope {
        DeliveryEnvelope::new("t0".into(), ns.into(), Bytes::from_static(payload))
    }

    #[test]
    fn test_write_buffer_overflow_rules() {
        let mut out = WriteBuffer::new(10);
        assert!(!out.would_overflow(100), "an empty buffer takes any frame");
        out.buf.extend_from_slice(&[0u8; 8]);
        out.envelopes = 1;
        assert!(out.would_overflow(3));
        assert!(!out.would_overflow(2));
        assert_eq!(out.discard(), 1);
        assert!(out.is_empty());
    }

    #[test]
    fn test_read_outcome() {
        assert!(matches!(read_outcome("t0", Ok(0)), Some(DeliveryError::TargetClosed(_))));
        assert!(read_outcome("t0", Ok(12)).is_none());
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(read_outcome("t0", Err(err)), Some(DeliveryError::Io { .. })));
    }

    #[tokio::test]
    async fn test_session_delivers_and_filters() {
        let pipeline = Arc::new(pipeline(&["ns1"], false));
        let slot = ConnectionSlot::new("t0".into(), 0);
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let (tx, mut rx) = watch::channel(ShutdownPhase::Running);

        pipeline.queue.try_submit(env("ns1", b"a")).unwrap();
        pipeline.queue.try_submit(env("ns2", b"b")).unwrap();
        pipeline.queue.try_submit(env("ns1", b"c")).unwrap();

        let p = Arc::clone(&pipeline);
        let session = tokio::spawn(async move {
            matches!(
                run_session(&p, &slot, client, None, &mut rx).await,
                SessionEnd::Finished
            )
        });

        let mut received = Vec::new();
        let mut buf = BytesMut::new();
        while received.len() < 2 {
            let mut chunk = [0u8; 256];
            let n = server.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            while let Some((frame, used)) = decode_frame(ProtocolVariant::Native, &buf).unwrap() {
                let _ = buf.split_to(used);
                received.push(frame);
            }
        }
        assert_eq!(received[0].payload, Bytes::from_static(b"a"));
        assert_eq!(received[1].payload, Bytes::from_static(b"c"));

        pipeline.queue.close();
        tx.send(ShutdownPhase::Draining).unwrap();
        assert!(session.await.unwrap());
        assert_eq!(pipeline.delivered(), 2);
        assert_eq!(pipeline.counters.errors(), 0);
    }

    #[tokio::test]
    async fn test_session_bypass_ignores_namespace_filter() {
        let pipeline = Arc::new(pipeline(&["ns1"], true));
        let slot = ConnectionSlot::new("t0".into(), 0);
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let (tx, mut rx) = watch::channel(ShutdownPhase::Running);

        pipeline.queue.try_submit(env("ns2", b"other")).unwrap();
        pipeline.queue.close();
        tx.send(ShutdownPhase::Draining).unwrap();

        let end = run_session(&pipeline, &slot, client, None, &mut rx).await;
        assert!(matches!(end, SessionEnd::Finished));
        assert_eq!(pipeline.delivered(), 1);

        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();
        let (frame, _) = decode_frame(ProtocolVariant::Native, &raw).unwrap().unwrap();
        assert_eq!(frame.namespace, "ns2");
        assert_eq!(frame.payload, Bytes::from_static(b"other"));
    }

    #[tokio::test]
    async fn test_session_counts_unflushed_on_write_failure() {
        let pipeline = Arc::new(pipeline(&[], false));
        let slot = ConnectionSlot::new("t0".into(), 0);
        let (client, server) = tokio::io::duplex(16);
        drop(server);
        let (_tx, mut rx) = watch::channel(ShutdownPhase::Running);

        for _ in 0..3 {
            pipeline.queue.try_submit(env("ns", b"payload")).unwrap();
        }

        let end = run_session(&pipeline, &slot, client, None, &mut rx).await;
        assert!(matches!(end, SessionEnd::Failed));
        assert_eq!(pipeline.counters.errors(), 3);
        assert_eq!(pipeline.delivered(), 0);
        assert!(pipeline.queue.is_empty());
    }

    #[tokio::test]
    async fn test_session_detects_target_close() {
        let pipeline = Arc::new(pipeline(&[], false));
        let slot = ConnectionSlot::new("t0".into(), 0);
        let (client, server) = tokio::io::duplex(1024);
        let (_tx, mut rx) = watch::channel(ShutdownPhase::Running);

        let p = Arc::clone(&pipeline);
        let session = tokio::spawn(async move {
            matches!(
                run_session(&p, &slot, client, None, &mut rx).await,
                SessionEnd::Failed
            )
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(server);
        assert!(session.await.unwrap());
        assert_eq!(pipeline.counters.errors(), 0);
    }

    #[tokio::test]
    async fn test_session_aborted_counts_unflushed() {
        let pipeline = Arc::new(pipeline(&[], false));
        let slot = ConnectionSlot::new("t0".into(), 0);
        // Tiny pipe that nobody reads: the first flush blocks.
        let (client, _server) = tokio::io::duplex(8);
        let (tx, mut rx) = watch::channel(ShutdownPhase::Running);

        pipeline.queue.try_submit(env("ns", b"0123456789")).unwrap();
        pipeline.queue.try_submit(env("ns", b"0123456789")).unwrap();

        let p = Arc::clone(&pipeline);
        let session =
            tokio::spawn(async move { run_session(&p, &slot, client, None, &mut rx).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(ShutdownPhase::Aborted).unwrap();
        assert!(matches!(session.await.unwrap(), SessionEnd::Finished));
        assert_eq!(pipeline.counters.errors(), 2);
    }
}
