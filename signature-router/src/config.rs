//! Configuration for the signature router

use crate::admission::AdmissionConfig;
use crate::challenge::ChallengeConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::fallback::FallbackConfig;
use crate::idempotency::IdempotencyConfig;
use crate::retry::RetryConfig;
use crate::types::Channel;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "SIGNATURE_ROUTER_";

/// Router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Rate limiting
    pub admission: AdmissionConfig,

    /// Per-provider circuit breakers
    pub circuit_breaker: CircuitBreakerConfig,

    /// Backoff between provider attempts
    pub retry: RetryConfig,

    /// Channel fallback
    pub fallback: FallbackConfig,

    /// Idempotency store
    pub idempotency: IdempotencyConfig,

    /// Challenge codes
    pub challenge: ChallengeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "signature-router".to_string(),
            admission: AdmissionConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            fallback: FallbackConfig::default(),
            idempotency: IdempotencyConfig::default(),
            challenge: ChallengeConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus `SIGNATURE_ROUTER_*` environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SIGNATURE_ROUTER_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));

        if let Some(name) = var("SERVICE_NAME") {
            self.service_name = name;
        }
        if let Some(permits) = parse::<u64>(&var, "GLOBAL_PERMITS_PER_SECOND")? {
            self.admission.global.capacity = permits;
            self.admission.global.refill_tokens = permits;
            self.admission.global.refill_period_ms = 1_000;
        }
        if let Some(permits) = parse::<u64>(&var, "CALLER_PERMITS_PER_MINUTE")? {
            self.admission.per_caller.capacity = permits;
            self.admission.per_caller.refill_tokens = permits;
            self.admission.per_caller.refill_period_ms = 60_000;
        }
        if let Some(rate) = parse::<f64>(&var, "CB_FAILURE_RATE_THRESHOLD")? {
            self.circuit_breaker.failure_rate_threshold = rate;
        }
        if let Some(wait) = parse::<u64>(&var, "CB_WAIT_DURATION_MS")? {
            self.circuit_breaker.wait_duration_open_ms = wait;
        }
        if let Some(delay) = parse::<u64>(&var, "RETRY_BASE_DELAY_MS")? {
            self.retry.base_delay_ms = delay;
        }
        if let Some(chain) = var("FALLBACK_CHAIN") {
            self.fallback.chain = chain
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Channel::from_str)
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(ttl) = parse::<u64>(&var, "CHALLENGE_TTL_SECONDS")? {
            self.challenge.ttl_seconds = ttl;
        }
        if let Some(hours) = parse::<u64>(&var, "IDEMPOTENCY_RETENTION_HOURS")? {
            self.idempotency.retention_hours = hours;
        }
        Ok(())
    }

    /// Reject settings the router cannot run with
    pub fn validate(&self) -> Result<()> {
        for (scope, limit) in [("global", &self.admission.global), ("per_caller", &self.admission.per_caller)] {
            if limit.capacity == 0 || limit.refill_tokens == 0 || limit.refill_period_ms == 0 {
                return Err(Error::Config(format!("admission.{} must have non-zero capacity, refill and period", scope)));
            }
        }

        let cb = &self.circuit_breaker;
        if cb.sliding_window_size == 0 || cb.permitted_calls_in_half_open == 0 {
            return Err(Error::Config("circuit_breaker window and trial calls must be non-zero".to_string()));
        }
        if !(cb.failure_rate_threshold > 0.0 && cb.failure_rate_threshold <= 100.0) {
            return Err(Error::Config("circuit_breaker.failure_rate_threshold must be in (0, 100]".to_string()));
        }

        if self.retry.backoff_multiplier < 1.0 || !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(Error::Config("retry multiplier must be >= 1 and jitter within [0, 1]".to_string()));
        }

        if self.fallback.chain.is_empty() {
            return Err(Error::Config("fallback.chain must not be empty".to_string()));
        }
        let mut seen = HashSet::new();
        if !self.fallback.chain.iter().all(|c| seen.insert(*c)) {
            return Err(Error::Config("fallback.chain contains duplicates".to_string()));
        }

        if self.idempotency.retention_hours == 0 || self.idempotency.in_flight_timeout_secs == 0 {
            return Err(Error::Config(
                "idempotency retention and in-flight timeout must be non-zero".to_string(),
            ));
        }
        if self.challenge.ttl_seconds == 0 || !(4..=12).contains(&self.challenge.code_length) {
            return Err(Error::Config("challenge ttl must be non-zero and code length within 4..=12".to_string()));
        }
        Ok(())
    }

    /// Idempotency replay window
    pub fn idempotency_retention(&self) -> Duration {
        Duration::from_secs(self.idempotency.retention_hours * 3_600)
    }
}

fn parse<T: FromStr>(var: &impl Fn(&str) -> Option<String>, suffix: &str) -> Result<Option<T>> {
    match var(suffix) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{}{} has invalid value `{}`", ENV_PREFIX, suffix, raw))),
    }
}
