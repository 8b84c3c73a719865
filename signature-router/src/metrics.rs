//! Router metrics
//!
//! - `router_routing_decisions_total` - Rule selections by channel
//! - `router_rule_evaluation_errors_total` - Conditions that failed to evaluate
//! - `router_admission_decisions_total` - Rate limiter outcomes by scope
//! - `router_circuit_breaker_state` - Breaker state per provider
//! - `router_provider_calls_total` / `router_provider_call_duration_seconds`
//! - `router_fallback_events_total` - Channel hops by reason
//! - `router_dispatch_outcomes_total` - Terminal dispatch outcomes
//! - `router_idempotency_total` - Replays, conflicts, in-flight duplicates
//! - `router_provider_config_version` - Active provider snapshot version

use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Encoder, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec,
    TextEncoder,
};

lazy_static::lazy_static! {
    pub static ref ROUTING_DECISIONS: IntCounterVec = register_int_counter_vec!(
        "router_routing_decisions_total",
        "Rule selections by channel",
        &["channel"]
    )
    .unwrap();

    pub static ref RULE_EVALUATION_ERRORS: IntCounterVec = register_int_counter_vec!(
        "router_rule_evaluation_errors_total",
        "Rule conditions that failed to evaluate, by the rule's channel",
        &["channel"]
    )
    .unwrap();

    pub static ref ADMISSION_DECISIONS: IntCounterVec = register_int_counter_vec!(
        "router_admission_decisions_total",
        "Rate limiter outcomes",
        &["scope", "outcome"]
    )
    .unwrap();

    pub static ref CIRCUIT_BREAKER_STATE: IntGaugeVec = register_int_gauge_vec!(
        "router_circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=half-open, 2=open)",
        &["provider"]
    )
    .unwrap();

    pub static ref PROVIDER_CALLS: IntCounterVec = register_int_counter_vec!(
        "router_provider_calls_total",
        "Provider send attempts",
        &["provider", "channel", "status"]
    )
    .unwrap();

    pub static ref PROVIDER_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "router_provider_call_duration_seconds",
        "Provider send latency",
        &["provider", "channel"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    pub static ref FALLBACK_EVENTS: IntCounterVec = register_int_counter_vec!(
        "router_fallback_events_total",
        "Channel fallbacks",
        &["from", "to", "reason"]
    )
    .unwrap();

    pub static ref DISPATCH_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "router_dispatch_outcomes_total",
        "Terminal dispatch outcomes",
        &["outcome"]
    )
    .unwrap();

    pub static ref IDEMPOTENCY_EVENTS: IntCounterVec = register_int_counter_vec!(
        "router_idempotency_total",
        "Idempotency store outcomes",
        &["outcome"]
    )
    .unwrap();

    pub static ref PROVIDER_CONFIG_VERSION: IntGauge = register_int_gauge!(
        "router_provider_config_version",
        "Active provider snapshot version"
    )
    .unwrap();
}

/// Render the default registry in text exposition format
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        DISPATCH_OUTCOMES.with_label_values(&["sent"]).inc();
        let text = gather_text();
        assert!(text.contains("router_dispatch_outcomes_total"));
    }
}
