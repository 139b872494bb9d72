//! Fuzz target for frame decoding.
//!
//! This tests that decoding never panics on arbitrary input, never claims
//! more bytes than it was given, and that a decoded frame encodes back to
//! the bytes it came from.

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use replication_delivery::protocol::{decode_frame, encode_frame, ProtocolVariant};
use replication_delivery::DeliveryEnvelope;

fuzz_target!(|data: &[u8]| {
    for variant in [ProtocolVariant::Native, ProtocolVariant::Compat] {
        // Should never panic
        let Ok(Some((frame, used))) = decode_frame(variant, data) else {
            continue;
        };
        assert!(used <= data.len());

        let mut env = DeliveryEnvelope::new(
            "fuzz".into(),
            frame.namespace.as_str().into(),
            frame.payload.clone(),
        );
        if let Some(ms) = frame.submitted_at_ms {
            env.submitted_at_ms = ms;
        }
        let mut buf = BytesMut::new();
        encode_frame(variant, &env, &mut buf).expect("decoded frame re-encodes");

        // Compat flags are not preserved.
        if variant == ProtocolVariant::Native {
            assert_eq!(&buf[..], &data[..used]);
        } else {
            assert_eq!(buf.len(), used);
        }
    }
});
