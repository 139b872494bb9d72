// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Frame encodings spoken to targets.
//!
//! Each target speaks exactly one encoding, chosen by `use_compat_protocol`.
//! All integers are big-endian.
//!
//! # Native
//!
//! ```text
//! ┌──────────────┬────────────┬───────────┬─────────┐
//! │ total_len u32│ ns_len u16 │ namespace │ payload │
//! └──────────────┴────────────┴───────────┴─────────┘
//!   total_len counts everything after itself
//! ```
//!
//! # Compat
//!
//! ```text
//! ┌──────┬────────┬──────────┬─────────────┬────────────┬─────────────┬───────────┬─────────┐
//! │ "RP" │ ver u8 │ flags u8 │ millis u64  │ ns_len u16 │ pay_len u32 │ namespace │ payload │
//! └──────┴────────┴──────────┴─────────────┴────────────┴─────────────┴───────────┴─────────┘
//! ```

use crate::envelope::DeliveryEnvelope;
use crate::error::{DeliveryError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic prefix of compat frames.
pub const COMPAT_MAGIC: [u8; 2] = *b"RP";
/// Compat frame version written by this crate.
pub const COMPAT_VERSION: u8 = 1;

const NATIVE_HEADER_LEN: usize = 4 + 2;
const COMPAT_HEADER_LEN: usize = 2 + 1 + 1 + 8 + 2 + 4;

/// Which encoding a target speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVariant {
    /// Length-prefixed native frames.
    #[default]
    Native,
    /// Magic-prefixed compat frames carrying the submission time.
    Compat,
}

impl ProtocolVariant {
    /// Variant for a target's `use_compat_protocol` flag.
    pub fn from_compat_flag(use_compat_protocol: bool) -> Self {
        if use_compat_protocol {
            ProtocolVariant::Compat
        } else {
            ProtocolVariant::Native
        }
    }

    /// Encoded size of one frame.
    pub fn frame_len(self, namespace_len: usize, payload_len: usize) -> usize {
        let header = match self {
            ProtocolVariant::Native => NATIVE_HEADER_LEN,
            ProtocolVariant::Compat => COMPAT_HEADER_LEN,
        };
        header + namespace_len + payload_len
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub namespace: String,
    pub payload: Bytes,
    /// Submission time; only compat frames carry it.
    pub submitted_at_ms: Option<u64>,
}

/// Append one frame for `envelope` to `buf`.
pub fn encode_frame(
    variant: ProtocolVariant,
    envelope: &DeliveryEnvelope,
    buf: &mut BytesMut,
) -> Result<()> {
    let ns = envelope.namespace.as_bytes();
    let payload = &envelope.payload;

    let ns_len = u16::try_from(ns.len())
        .map_err(|_| DeliveryError::Frame(format!("namespace too long: {} bytes", ns.len())))?;

    match variant {
        ProtocolVariant::Native => {
            let total = u32::try_from(2 + ns.len() + payload.len()).map_err(|_| {
                DeliveryError::Frame(format!("payload too large: {} bytes", payload.len()))
            })?;
            buf.reserve(NATIVE_HEADER_LEN + ns.len() + payload.len());
            buf.put_u32(total);
            buf.put_u16(ns_len);
        }
        ProtocolVariant::Compat => {
            let pay_len = u32::try_from(payload.len()).map_err(|_| {
                DeliveryError::Frame(format!("payload too large: {} bytes", payload.len()))
            })?;
            buf.reserve(COMPAT_HEADER_LEN + ns.len() + payload.len());
            buf.put_slice(&COMPAT_MAGIC);
            buf.put_u8(COMPAT_VERSION);
            buf.put_u8(0);
            buf.put_u64(envelope.submitted_at_ms);
            buf.put_u16(ns_len);
            buf.put_u32(pay_len);
        }
    }
    buf.put_slice(ns);
    buf.put_slice(payload);
    Ok(())
}

/// Parse one frame from the front of `input`.
///
/// Returns `Ok(None)` when `input` holds only part of a frame, and the frame
/// plus the number of bytes it occupied otherwise. Malformed input is an
/// error, never a panic.
pub fn decode_frame(variant: ProtocolVariant, input: &[u8]) -> Result<Option<(Frame, usize)>> {
    match variant {
        ProtocolVariant::Native => decode_native(input),
        ProtocolVariant::Compat => decode_compat(input),
    }
}

fn decode_native(input: &[u8]) -> Result<Option<(Frame, usize)>> {
    if input.len() < NATIVE_HEADER_LEN {
        return Ok(None);
    }
    let mut header = &input[..NATIVE_HEADER_LEN];
    let total = header.get_u32() as usize;
    let ns_len = header.get_u16() as usize;

    if total < 2 || ns_len > total - 2 {
        return Err(DeliveryError::Frame(format!(
            "namespace length {} exceeds frame length {}",
            ns_len, total
        )));
    }
    let frame_len = match total.checked_add(4) {
        Some(n) => n,
        None => return Err(DeliveryError::Frame("frame length overflow".to_string())),
    };
    if input.len() < frame_len {
        return Ok(None);
    }

    let ns_end = NATIVE_HEADER_LEN + ns_len;
    let namespace = parse_namespace(&input[NATIVE_HEADER_LEN..ns_end])?;
    let payload = Bytes::copy_from_slice(&input[ns_end..frame_len]);
    Ok(Some((
        Frame {
            namespace,
            payload,
            submitted_at_ms: None,
        },
        frame_len,
    )))
}

fn decode_compat(input: &[u8]) -> Result<Option<(Frame, usize)>> {
    // Reject a wrong magic as soon as it is visible.
    let magic_seen = input.len().min(COMPAT_MAGIC.len());
    if input[..magic_seen] != COMPAT_MAGIC[..magic_seen] {
        return Err(DeliveryError::Frame("bad magic".to_string()));
    }
    if input.len() < COMPAT_HEADER_LEN {
        return Ok(None);
    }

    let mut header = &input[2..COMPAT_HEADER_LEN];
    let version = header.get_u8();
    let _flags = header.get_u8();
    let millis = header.get_u64();
    let ns_len = header.get_u16() as usize;
    let pay_len = header.get_u32() as usize;

    if version != COMPAT_VERSION {
        return Err(DeliveryError::Frame(format!("unsupported version {}", version)));
    }

    let frame_len = COMPAT_HEADER_LEN.saturating_add(ns_len).saturating_add(pay_len);
    if input.len() < frame_len {
        return Ok(None);
    }

    let ns_end = COMPAT_HEADER_LEN + ns_len;
    let namespace = parse_namespace(&input[COMPAT_HEADER_LEN..ns_end])?;
    let payload = Bytes::copy_from_slice(&input[ns_end..frame_len]);
    Ok(Some((
        Frame {
            namespace,
            payload,
            submitted_at_ms: Some(millis),
        },
        frame_len,
    )))
}

fn parse_namespace(raw: &[u8]) -> Result<String> {
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|e| DeliveryError::Frame(format!("namespace is not UTF-8: {}", e)))
}
