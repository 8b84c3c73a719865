//! Property-based tests for routing invariants
//!
//! - Selection: lowest priority wins, ties go to the smallest id
//! - Selection ignores the order rules are supplied in
//! - Deleted and disabled rules are never selected
//! - Fallback never revisits a channel
//! - A token bucket never holds more than its capacity

use proptest::prelude::*;
use rust_decimal::Decimal;
use signature_router::admission::{RateLimitConfig, TokenBucket};
use signature_router::condition::ExpressionEvaluator;
use signature_router::fallback::{FailureReason, FallbackConfig, FallbackPolicy};
use signature_router::routing::RoutingEngine;
use signature_router::{ActiveRule, Channel, Money, RoutingRule, RuleId, TransactionContext};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Strategy for generating channels
fn channel_strategy() -> impl Strategy<Value = Channel> {
    prop_oneof![
        Just(Channel::Sms),
        Just(Channel::Push),
        Just(Channel::Voice),
        Just(Channel::Biometric),
    ]
}

/// Strategy for generating failure reasons
fn reason_strategy() -> impl Strategy<Value = FailureReason> {
    prop_oneof![
        Just(FailureReason::ProviderDown),
        Just(FailureReason::Timeout),
        Just(FailureReason::Error),
        Just(FailureReason::CircuitOpen),
    ]
}

/// Strategy for generating (id, priority, channel) triples with unique ids
fn rule_specs() -> impl Strategy<Value = Vec<(u128, i32, Channel)>> {
    prop::collection::btree_set(1u128..10_000, 1..20).prop_flat_map(|ids| {
        let n = ids.len();
        (
            Just(ids.into_iter().collect::<Vec<_>>()),
            prop::collection::vec(-5i32..5, n),
            prop::collection::vec(channel_strategy(), n),
        )
            .prop_map(|(ids, priorities, channels)| {
                ids.into_iter()
                    .zip(priorities)
                    .zip(channels)
                    .map(|((id, priority), channel)| (id, priority, channel))
                    .collect()
            })
    })
}

fn build_rules(specs: &[(u128, i32, Channel)]) -> Vec<RoutingRule> {
    specs
        .iter()
        .map(|(id, priority, channel)| {
            ActiveRule::with_id(
                RuleId::from_uuid(Uuid::from_u128(*id)),
                format!("rule-{}", id),
                "true",
                *channel,
                *priority,
                "proptest",
            )
            .into()
        })
        .collect()
}

fn context() -> TransactionContext {
    TransactionContext::new(Money::new(Decimal::new(100, 0), "EUR"), "m-1", "o-1")
}

fn engine() -> RoutingEngine {
    RoutingEngine::new(Arc::new(ExpressionEvaluator::new()))
}

proptest! {
    /// Lowest (priority, id) wins when every condition holds
    #[test]
    fn prop_lowest_priority_then_id_wins(specs in rule_specs()) {
        let rules = build_rules(&specs);
        let decision = engine().select(&context(), &rules).unwrap();

        let expected = specs.iter().min_by_key(|(id, priority, _)| (*priority, *id)).unwrap();
        prop_assert_eq!(decision.rule_id, RuleId::from_uuid(Uuid::from_u128(expected.0)));
        prop_assert_eq!(decision.channel, expected.2);
    }

    /// Shuffling the input does not change the decision
    #[test]
    fn prop_selection_order_independent(
        (specs, shuffled) in rule_specs().prop_flat_map(|specs| (Just(specs.clone()), Just(specs).prop_shuffle()))
    ) {
        let engine = engine();
        let a = engine.select(&context(), &build_rules(&specs)).unwrap();
        let b = engine.select(&context(), &build_rules(&shuffled)).unwrap();
        prop_assert_eq!(a, b);
    }

    /// Deleted and disabled rules are skipped
    #[test]
    fn prop_removed_rules_never_selected(
        specs in rule_specs(),
        mask in prop::collection::vec(0u8..3, 20),
    ) {
        let mut rules = build_rules(&specs);
        let mut removed = Vec::new();
        for (rule, flag) in rules.iter_mut().zip(&mask) {
            match flag {
                1 => {
                    rule.mark_as_deleted("proptest").unwrap();
                    removed.push(rule.id());
                }
                2 => {
                    rule.disable("proptest").unwrap();
                    removed.push(rule.id());
                }
                _ => {}
            }
        }

        match engine().select(&context(), &rules) {
            Ok(decision) => prop_assert!(!removed.contains(&decision.rule_id)),
            Err(_) => prop_assert_eq!(removed.len(), rules.len()),
        }
    }

    /// The policy never returns the current channel or one already tried
    #[test]
    fn prop_fallback_never_revisits(
        chain in Just(Channel::ALL.to_vec()).prop_shuffle(),
        start in channel_strategy(),
        reasons in prop::collection::vec(reason_strategy(), 1..8),
    ) {
        let policy = FallbackPolicy::new(FallbackConfig {
            chain,
            ..FallbackConfig::default()
        });

        let mut current = start;
        let mut attempted = vec![start];
        for reason in reasons {
            match policy.next(current, reason, &attempted) {
                Some(next) => {
                    prop_assert!(!attempted.contains(&next));
                    attempted.push(next);
                    current = next;
                }
                None => break,
            }
        }
        prop_assert!(attempted.len() <= Channel::ALL.len());
    }

    /// Permits granted never exceed capacity without a refill
    #[test]
    fn prop_bucket_bounded_by_capacity(capacity in 1u64..50, requests in 0usize..120) {
        let bucket = TokenBucket::new(RateLimitConfig::per_period(capacity, Duration::from_secs(3_600)));
        let granted = (0..requests).filter(|_| bucket.try_acquire()).count() as u64;

        prop_assert_eq!(granted, capacity.min(requests as u64));
        prop_assert!(bucket.available() <= capacity);
    }
}
