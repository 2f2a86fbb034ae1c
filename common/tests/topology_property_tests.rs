// Property-based tests for broker topology, routing and dead letter envelopes

use common::errors::TopologyError;
use common::queue::{DeadLetterEnvelope, DeathRecord, Delivery, MessageProperties};
use common::retry::{ExponentialBackoff, RetryStrategy};
use common::topology::{routing_key_matches, QueueBinding, Topology};
use proptest::prelude::*;
use std::time::Duration;

fn word() -> impl Strategy<Value = String> {
    "[a-z]{1,8}"
}

fn routing_key() -> impl Strategy<Value = String> {
    prop::collection::vec(word(), 1..5).prop_map(|words| words.join("."))
}

fn binding(queue: &str, dlq: &str, key: &str) -> QueueBinding {
    QueueBinding {
        queue: queue.to_string(),
        dead_letter_queue: dlq.to_string(),
        routing_keys: vec![key.to_string()],
        message_ttl_ms: None,
    }
}

fn topology(bindings: Vec<QueueBinding>) -> Topology {
    Topology {
        exchange: "events".to_string(),
        dead_letter_exchange: "events.dlx".to_string(),
        bindings,
    }
}

/// **Property: Literal patterns match only themselves**
///
/// *For any* two routing keys without wildcards, the pattern matches the key
/// exactly when they are equal.
#[test]
fn property_literal_pattern_matches_only_itself() {
    proptest!(|(pattern in routing_key(), key in routing_key())| {
        prop_assert!(routing_key_matches(&pattern, &pattern));
        prop_assert_eq!(routing_key_matches(&pattern, &key), pattern == key);
    });
}

/// **Property: `#` matches every key, `*` matches exactly one word**
#[test]
fn property_wildcards() {
    proptest!(|(words in prop::collection::vec(word(), 1..6))| {
        let key = words.join(".");
        prop_assert!(routing_key_matches("#", &key));

        let stars = vec!["*"; words.len()].join(".");
        prop_assert!(routing_key_matches(&stars, &key));

        let prefix_hash = format!("{}.#", words[0]);
        prop_assert!(routing_key_matches(&prefix_hash, &key));

        let prefix_star = format!("{}.*", words[0]);
        prop_assert_eq!(routing_key_matches(&prefix_star, &key), words.len() == 2);
    });
}

/// **Property: A DLQ is never shared**
///
/// *For any* two primary queues, a topology binding both to the same DLQ is
/// rejected, and distinct DLQs are accepted.
#[test]
fn property_shared_dead_letter_queue_rejected() {
    proptest!(|(a in word(), b in word(), dlq in word())| {
        prop_assume!(a != b && a != dlq && b != dlq);

        let shared = topology(vec![binding(&a, &dlq, "x.#"), binding(&b, &dlq, "y.#")]);
        let is_shared = matches!(
            shared.validate(),
            Err(TopologyError::SharedDeadLetterQueue { .. })
        );
        prop_assert!(is_shared);

        let a_dlq = format!("{}.dlq", a);
        let b_dlq = format!("{}.dlq", b);
        let distinct = topology(vec![binding(&a, &a_dlq, "x.#"), binding(&b, &b_dlq, "y.#")]);
        prop_assert!(distinct.validate().is_ok());
        prop_assert_eq!(&distinct.binding_for_dlq(&b_dlq).unwrap().queue, &b);
    });
}

/// **Property: A queue cannot be both a primary and a DLQ**
#[test]
fn property_queue_role_conflict_rejected() {
    proptest!(|(a in word(), b in word())| {
        prop_assume!(a != b);
        let a_dlq = format!("{}.dlq", a);
        let t = topology(vec![binding(&a, &a_dlq, "x.#"), binding(&a_dlq, &b, "y.#")]);
        prop_assert!(t.validate().is_err());
    });
}

/// **Property: The original routing key survives dead-lettering**
///
/// *For any* routing key and body, a delivery carrying a death record for the
/// primary queue yields the original key and the body verbatim.
#[test]
fn property_envelope_recovers_original_key_and_body() {
    proptest!(|(
        key in routing_key(),
        body in prop::collection::vec(any::<u8>(), 0..256),
        count in 1u64..50
    )| {
        let mut record = DeathRecord::new("primary", "expired", "events", &key);
        record.count = count;
        let delivery = Delivery {
            delivery_tag: 1,
            queue: "primary.dlq".to_string(),
            exchange: "events.dlx".to_string(),
            routing_key: "primary.dlq".to_string(),
            redelivered: false,
            body: body.clone(),
            properties: MessageProperties::json(),
            deaths: vec![record],
        };

        let envelope = DeadLetterEnvelope::from_delivery(&delivery, Some("primary"));
        prop_assert_eq!(envelope.original_routing_key, key);
        prop_assert_eq!(envelope.body, body);
        prop_assert_eq!(envelope.death_count, count);
    });
}

/// **Property: Error backoff grows monotonically and stays capped**
#[test]
fn property_backoff_monotonic_and_capped() {
    proptest!(|(base_ms in 1u64..5_000, max_s in 1u64..900, failures in 1u32..40)| {
        let base = Duration::from_millis(base_ms);
        let max = Duration::from_secs(max_s);
        let backoff = ExponentialBackoff::new(base, max).with_jitter(0.0);

        let current = backoff.next_delay(failures);
        let next = backoff.next_delay(failures + 1);
        prop_assert!(next >= current);
        prop_assert!(current <= max.max(base));
        prop_assert_eq!(backoff.next_delay(1), base);
    });
}
