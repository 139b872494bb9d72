//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use replication_delivery::config::validate_targets;
use replication_delivery::protocol::{decode_frame, encode_frame, ProtocolVariant};
use replication_delivery::queue::DeliveryQueue;
use replication_delivery::resilience::Backoff;
use replication_delivery::{
    CounterTable, DeliveryConfig, DeliveryEnvelope, Rejected, ReplicationDelivery,
    ReplicationTarget, StatsConfig, TargetSelector,
};
use std::sync::Arc;
use std::time::Duration;

fn envelope(ns: &str, payload: Vec<u8>) -> DeliveryEnvelope {
    DeliveryEnvelope::new("t0".into(), ns.into(), Bytes::from(payload))
}

fn variant() -> impl Strategy<Value = ProtocolVariant> {
    prop_oneof![Just(ProtocolVariant::Native), Just(ProtocolVariant::Compat)]
}

// =============================================================================
// Backoff Properties
// =============================================================================

proptest! {
    /// Delays never exceed the ceiling and never shrink between failures.
    #[test]
    fn backoff_is_monotonic_and_capped(
        base_ms in 1u64..1_000,
        max_ms in 1u64..60_000,
        failures in 1usize..64,
    ) {
        let base = Duration::from_millis(base_ms);
        let max = Duration::from_millis(max_ms).max(base);
        let mut backoff = Backoff::new(base, Duration::from_millis(max_ms));

        let mut last = Duration::ZERO;
        for i in 0..failures {
            let d = backoff.next_delay();
            prop_assert!(d <= max);
            prop_assert!(d >= last);
            if i == 0 {
                prop_assert_eq!(d, base);
            }
            last = d;
        }
        prop_assert_eq!(backoff.failures() as usize, failures);
    }

    /// After a reset the next delay is the base again.
    #[test]
    fn backoff_reset_restores_base(base_ms in 1u64..1_000, failures in 0usize..40) {
        let base = Duration::from_millis(base_ms);
        let mut backoff = Backoff::new(base, Duration::from_secs(20));
        for _ in 0..failures {
            backoff.next_delay();
        }
        backoff.reset();
        prop_assert_eq!(backoff.failures(), 0);
        prop_assert_eq!(backoff.next_delay(), base);
    }

    /// The stateless lookup agrees with the stateful schedule.
    #[test]
    fn backoff_delay_for_failure_matches_schedule(base_ms in 1u64..500, n in 1u32..30) {
        let mut backoff = Backoff::new(Duration::from_millis(base_ms), Duration::from_secs(20));
        let expected = backoff.delay_for_failure(n);
        let mut got = Duration::ZERO;
        for _ in 0..n {
            got = backoff.next_delay();
        }
        prop_assert_eq!(got, expected);
    }
}

// =============================================================================
// Target Validation Properties
// =============================================================================

fn target_strategy() -> impl Strategy<Value = ReplicationTarget> {
    (
        prop_oneof![Just(String::new()), "[a-z]{1,6}"],
        prop_oneof![Just(String::new()), Just("  ".to_string()), "[a-z0-9.]{1,12}:[0-9]{1,5}"],
        prop_oneof![Just(String::new()), Just("tcp4".to_string())],
    )
        .prop_map(|(name, addr, network)| {
            let mut t = ReplicationTarget::for_testing(&name, &addr);
            t.endpoint.network = network;
            t
        })
}

proptest! {
    /// Validating twice changes nothing the first pass did not.
    #[test]
    fn validation_is_idempotent(targets in prop::collection::vec(target_strategy(), 0..12)) {
        let mut once = targets.clone();
        validate_targets(&mut once);
        let mut twice = once.clone();
        validate_targets(&mut twice);
        prop_assert_eq!(once, twice);
    }

    /// Survivors have an address, a name and a network; order is preserved.
    #[test]
    fn validation_keeps_addressed_targets_in_order(
        targets in prop::collection::vec(target_strategy(), 0..12),
    ) {
        let expected: Vec<String> = targets
            .iter()
            .filter(|t| !t.endpoint.addr.trim().is_empty())
            .map(|t| t.endpoint.addr.clone())
            .collect();

        let mut validated = targets;
        validate_targets(&mut validated);

        let addrs: Vec<String> = validated.iter().map(|t| t.endpoint.addr.clone()).collect();
        prop_assert_eq!(addrs, expected);
        for t in &validated {
            prop_assert!(!t.name.is_empty());
            prop_assert!(!t.endpoint.network.is_empty());
        }
    }
}

proptest! {
    /// Every validated slot gets its own pipeline, even when names collide.
    #[test]
    fn service_keeps_one_pipeline_per_slot(
        targets in prop::collection::vec(target_strategy(), 0..12),
    ) {
        let mut config = DeliveryConfig {
            targets,
            stats: StatsConfig::disabled(),
            ..Default::default()
        };
        config.validate();
        let slots = config.targets.len();
        let table = Arc::new(CounterTable::new(1, config.targets.iter().map(|t| t.name.clone()).collect()));
        let delivery = ReplicationDelivery::with_tcp(0, &config, table);

        prop_assert_eq!(delivery.pipeline_count(), slots);
        prop_assert_eq!(delivery.registry().len(), slots);
        for (slot, target) in config.targets.iter().enumerate() {
            prop_assert_eq!(
                &delivery.registry().get(slot).unwrap().endpoint.addr,
                &target.endpoint.addr
            );
        }

        let report = delivery.submit(TargetSelector::All, "ns", Bytes::from_static(b"v"));
        prop_assert_eq!(report.accepted_count(), slots);
        for slot in 0..slots {
            prop_assert_eq!(delivery.slot_queue_depth(slot), Some(1));
        }
    }
}

// =============================================================================
// Queue Properties
// =============================================================================

proptest! {
    /// A queue admits exactly `capacity` envelopes, then rejects as full.
    #[test]
    fn queue_admits_exactly_capacity(capacity in 1usize..256, extra in 0usize..64) {
        let queue = DeliveryQueue::new(capacity, capacity.min(16));
        let mut accepted = 0;
        let mut full = 0;
        for _ in 0..(capacity + extra) {
            match queue.try_submit(envelope("ns", vec![1])) {
                Ok(()) => accepted += 1,
                Err(Rejected::QueueFull) => full += 1,
                Err(Rejected::Closed) => prop_assert!(false, "queue unexpectedly closed"),
            }
        }
        prop_assert_eq!(accepted, capacity);
        prop_assert_eq!(full, extra);
        prop_assert_eq!(queue.len(), capacity);
    }
}

// =============================================================================
// Frame Properties
// =============================================================================

proptest! {
    /// Encoded frames decode back to their namespace and payload, consuming
    /// exactly the encoded length.
    #[test]
    fn frame_decodes_what_was_encoded(
        variant in variant(),
        ns in "[a-z_]{0,24}",
        payload in prop::collection::vec(any::<u8>(), 0..2048),
    ) {
        let env = envelope(&ns, payload.clone());
        let mut buf = BytesMut::new();
        encode_frame(variant, &env, &mut buf).unwrap();
        prop_assert_eq!(buf.len(), variant.frame_len(ns.len(), payload.len()));

        let (frame, used) = decode_frame(variant, &buf).unwrap().unwrap();
        prop_assert_eq!(used, buf.len());
        prop_assert_eq!(frame.namespace, ns);
        prop_assert_eq!(frame.payload.as_ref(), payload.as_slice());
    }

    /// Every strict prefix of a frame is reported as incomplete.
    #[test]
    fn frame_prefix_is_incomplete(
        variant in variant(),
        payload in prop::collection::vec(any::<u8>(), 0..256),
        cut in any::<prop::sample::Index>(),
    ) {
        let mut buf = BytesMut::new();
        encode_frame(variant, &envelope("ns", payload), &mut buf).unwrap();
        let at = cut.index(buf.len());
        prop_assert!(decode_frame(variant, &buf[..at]).unwrap().is_none());
    }

    /// Arbitrary bytes never panic the decoder.
    #[test]
    fn frame_decode_never_panics(
        variant in variant(),
        data in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        if let Ok(Some((_, used))) = decode_frame(variant, &data) {
            prop_assert!(used <= data.len());
        }
    }
}
