//! Circuit breaker per provider
//!
//! Failure-rate breaker over a count-based sliding window. While open, calls
//! are rejected without reaching the provider. After the cool-down a fixed
//! number of trial calls is let through; one failed trial re-opens the
//! breaker, all trials succeeding closes it with a fresh window.
//!
//! Calls go through a [`CallPermit`]. A trial permit dropped without an
//! outcome (the dispatch was cancelled or timed out upstream) counts as a
//! failed trial. A half-open breaker whose trials stay unresolved for a full
//! cool-down re-opens on the next acquire.

use crate::metrics::CIRCUIT_BREAKER_STATE;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Closed (normal operation)
    Closed,
    /// Open (rejecting requests)
    Open,
    /// Half-open (trial calls)
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of most recent outcomes considered
    pub sliding_window_size: usize,
    /// Outcomes required before the failure rate is evaluated
    pub minimum_calls: usize,
    /// Failure percentage above which the breaker opens
    pub failure_rate_threshold: f64,
    /// Cool-down before trial calls are allowed (milliseconds)
    pub wait_duration_open_ms: u64,
    /// Trial calls permitted while half-open
    pub permitted_calls_in_half_open: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            sliding_window_size: 20,
            minimum_calls: 10,
            failure_rate_threshold: 50.0,
            wait_duration_open_ms: 30_000,
            permitted_calls_in_half_open: 3,
        }
    }
}

impl CircuitBreakerConfig {
    fn wait_duration(&self) -> Duration {
        Duration::from_millis(self.wait_duration_open_ms)
    }
}

/// Decision for a single call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPermission {
    /// Breaker closed
    Allowed,
    /// Half-open trial call
    Trial,
    /// Breaker open or trial budget spent
    Rejected {
        /// Time until trial calls are allowed (zero while trials are running)
        retry_in: Duration,
    },
}

impl CallPermission {
    /// Whether the call may proceed
    pub fn is_permitted(&self) -> bool {
        !matches!(self, CallPermission::Rejected { .. })
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Outcomes in the window
    pub window_len: usize,
    /// Failures in the window
    pub window_failures: usize,
    /// Failure percentage (0 for an empty window)
    pub failure_rate: f64,
    /// Milliseconds since the last state change
    pub time_in_state_ms: u64,
}

/// Circuit breaker for one provider
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    /// true = failure
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    trials_issued: u32,
    trial_successes: u32,
    last_transition: Instant,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create new circuit breaker
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::with_capacity(config.sliding_window_size),
            opened_at: None,
            trials_issued: 0,
            trial_successes: 0,
            last_transition: Instant::now(),
            config,
        }
    }

    /// Ask to place one call
    pub fn try_acquire(&mut self, provider: &str) -> CallPermission {
        match self.state {
            CircuitState::Closed => CallPermission::Allowed,
            CircuitState::Open => {
                let wait = self.config.wait_duration();
                let elapsed = self.opened_at.map(|at| at.elapsed()).unwrap_or(wait);
                if elapsed < wait {
                    return CallPermission::Rejected {
                        retry_in: wait - elapsed,
                    };
                }
                info!("Circuit breaker half-opening for provider {}", provider);
                self.transition(CircuitState::HalfOpen, provider);
                self.issue_trial()
            }
            CircuitState::HalfOpen => {
                let permission = self.issue_trial();
                let wait = self.config.wait_duration();
                if !permission.is_permitted() && self.time_in_state() >= wait {
                    warn!(
                        "Circuit breaker re-opening for provider {}: trials unresolved after {:?}",
                        provider,
                        self.time_in_state()
                    );
                    self.open(provider);
                    return CallPermission::Rejected { retry_in: wait };
                }
                permission
            }
        }
    }

    fn issue_trial(&mut self) -> CallPermission {
        if self.trials_issued < self.config.permitted_calls_in_half_open {
            self.trials_issued += 1;
            CallPermission::Trial
        } else {
            CallPermission::Rejected {
                retry_in: Duration::ZERO,
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&mut self, provider: &str) {
        match self.state {
            CircuitState::Closed => {
                self.push_outcome(false);
            }
            CircuitState::HalfOpen => {
                self.trial_successes += 1;
                if self.trial_successes >= self.config.permitted_calls_in_half_open {
                    info!("Circuit breaker closing for provider {}", provider);
                    self.window.clear();
                    self.transition(CircuitState::Closed, provider);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&mut self, provider: &str) {
        match self.state {
            CircuitState::Closed => {
                self.push_outcome(true);
                if self.window.len() >= self.config.minimum_calls.max(1)
                    && self.failure_rate() > self.config.failure_rate_threshold
                {
                    warn!(
                        "Circuit breaker opening for provider {} at {:.1}% failures over {} calls",
                        provider,
                        self.failure_rate(),
                        self.window.len()
                    );
                    self.open(provider);
                }
            }
            CircuitState::HalfOpen => {
                warn!("Circuit breaker re-opening for provider {} after failed trial", provider);
                self.open(provider);
            }
            CircuitState::Open => {}
        }
    }

    /// A trial call ended without an outcome
    pub fn abandon_trial(&mut self, provider: &str) {
        if self.state == CircuitState::HalfOpen {
            warn!("Circuit breaker re-opening for provider {} after abandoned trial", provider);
            self.open(provider);
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Failure percentage over the window
    pub fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|failed| **failed).count();
        failures as f64 * 100.0 / self.window.len() as f64
    }

    /// Time since the last state change
    pub fn time_in_state(&self) -> Duration {
        self.last_transition.elapsed()
    }

    /// Point-in-time view
    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            window_len: self.window.len(),
            window_failures: self.window.iter().filter(|failed| **failed).count(),
            failure_rate: self.failure_rate(),
            time_in_state_ms: u64::try_from(self.time_in_state().as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Reset to closed (manual intervention)
    pub fn reset(&mut self, provider: &str) {
        info!("Manually resetting circuit breaker for provider {}", provider);
        self.window.clear();
        self.opened_at = None;
        self.transition(CircuitState::Closed, provider);
    }

    fn push_outcome(&mut self, failed: bool) {
        if self.window.len() >= self.config.sliding_window_size.max(1) {
            self.window.pop_front();
        }
        self.window.push_back(failed);
    }

    fn open(&mut self, provider: &str) {
        self.opened_at = Some(Instant::now());
        self.transition(CircuitState::Open, provider);
    }

    fn transition(&mut self, state: CircuitState, provider: &str) {
        self.state = state;
        self.trials_issued = 0;
        self.trial_successes = 0;
        self.last_transition = Instant::now();
        CIRCUIT_BREAKER_STATE
            .with_label_values(&[provider])
            .set(state.gauge_value());
    }
}

/// Permission to place one call, settled with its outcome
#[must_use = "settle the permit with record_success or record_failure"]
pub struct CallPermit {
    breaker: Arc<Mutex<CircuitBreaker>>,
    provider: String,
    permission: CallPermission,
    settled: bool,
}

impl CallPermit {
    /// Whether this is a half-open trial call
    pub fn is_trial(&self) -> bool {
        self.permission == CallPermission::Trial
    }

    /// Record a successful call
    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.lock().record_success(&self.provider);
    }

    /// Record a failed call
    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.lock().record_failure(&self.provider);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.is_trial() {
            self.breaker.lock().abandon_trial(&self.provider);
        }
    }
}

impl std::fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPermit")
            .field("provider", &self.provider)
            .field("permission", &self.permission)
            .field("settled", &self.settled)
            .finish()
    }
}

/// Circuit breakers keyed by provider code, created lazily
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<Mutex<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerManager {
    /// Create new manager
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    fn breaker(&self, provider: &str) -> Arc<Mutex<CircuitBreaker>> {
        if let Some(breaker) = self.breakers.get(provider) {
            return breaker.clone();
        }
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(self.default_config.clone()))))
            .clone()
    }

    /// Ask to place one call to the provider. Rejection carries the time
    /// until trials are allowed.
    pub fn acquire(&self, provider: &str) -> std::result::Result<CallPermit, Duration> {
        let breaker = self.breaker(provider);
        let permission = breaker.lock().try_acquire(provider);
        match permission {
            CallPermission::Rejected { retry_in } => Err(retry_in),
            _ => Ok(CallPermit {
                breaker,
                provider: provider.to_string(),
                permission,
                settled: false,
            }),
        }
    }

    /// Get state for provider
    pub fn state(&self, provider: &str) -> CircuitState {
        self.breakers
            .get(provider)
            .map(|b| b.lock().state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshot for provider, if a breaker exists
    pub fn snapshot(&self, provider: &str) -> Option<CircuitSnapshot> {
        self.breakers.get(provider).map(|b| b.lock().snapshot())
    }

    /// Reset circuit breaker
    pub fn reset(&self, provider: &str) {
        if let Some(breaker) = self.breakers.get(provider) {
            breaker.lock().reset(provider);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            sliding_window_size: 10,
            minimum_calls: 4,
            failure_rate_threshold: 50.0,
            wait_duration_open_ms: 1_000,
            permitted_calls_in_half_open: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_above_threshold() {
        let mut cb = CircuitBreaker::new(config());

        // below minimum sample size nothing happens
        for _ in 0..3 {
            cb.record_failure("p");
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure("p");
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.try_acquire("p"), CallPermission::Rejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_closed_at_threshold() {
        let mut cb = CircuitBreaker::new(config());
        cb.record_success("p");
        cb.record_failure("p");
        cb.record_success("p");
        cb.record_failure("p");
        assert_eq!(cb.failure_rate(), 50.0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_issues_bounded_trials() {
        let mut cb = CircuitBreaker::new(config());
        for _ in 0..4 {
            cb.record_failure("p");
        }

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!cb.try_acquire("p").is_permitted());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cb.try_acquire("p"), CallPermission::Trial);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.try_acquire("p"), CallPermission::Trial);
        assert!(!cb.try_acquire("p").is_permitted());

        cb.record_success("p");
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success("p");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().window_len, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_fresh_cooldown() {
        let mut cb = CircuitBreaker::new(config());
        for _ in 0..4 {
            cb.record_failure("p");
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.try_acquire("p"), CallPermission::Trial);

        cb.record_failure("p");
        assert_eq!(cb.state(), CircuitState::Open);
        match cb.try_acquire("p") {
            CallPermission::Rejected { retry_in } => assert_eq!(retry_in, Duration::from_secs(1)),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            sliding_window_size: 4,
            minimum_calls: 4,
            ..config()
        });
        cb.record_failure("p");
        for _ in 0..4 {
            cb.record_success("p");
        }
        assert_eq!(cb.snapshot().window_failures, 0);
        assert_eq!(cb.snapshot().window_len, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manager_isolates_providers() {
        let manager = CircuitBreakerManager::new(config());
        for _ in 0..4 {
            manager.acquire("sms-a").unwrap().record_failure();
        }
        assert_eq!(manager.state("sms-a"), CircuitState::Open);
        assert_eq!(manager.state("sms-b"), CircuitState::Closed);
        assert!(manager.acquire("sms-b").is_ok());
        assert!(manager.acquire("sms-a").is_err());

        manager.reset("sms-a");
        assert!(manager.acquire("sms-a").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_permit_reopens() {
        let manager = CircuitBreakerManager::new(config());
        for _ in 0..4 {
            manager.acquire("p").unwrap().record_failure();
        }
        tokio::time::advance(Duration::from_secs(1)).await;

        let permit = manager.acquire("p").unwrap();
        assert!(permit.is_trial());
        assert_eq!(manager.state("p"), CircuitState::HalfOpen);
        drop(permit);

        assert_eq!(manager.state("p"), CircuitState::Open);
        assert_eq!(manager.acquire("p").unwrap_err(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_closed_permit_changes_nothing() {
        let manager = CircuitBreakerManager::new(config());
        let permit = manager.acquire("p").unwrap();
        assert!(!permit.is_trial());
        drop(permit);
        assert_eq!(manager.state("p"), CircuitState::Closed);
        assert_eq!(manager.snapshot("p").unwrap().window_len, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_half_open_reopens_after_cooldown() {
        let mut cb = CircuitBreaker::new(config());
        for _ in 0..4 {
            cb.record_failure("p");
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.try_acquire("p"), CallPermission::Trial);
        assert_eq!(cb.try_acquire("p"), CallPermission::Trial);

        // trials never report back
        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(cb.try_acquire("p"), CallPermission::Rejected { retry_in: Duration::ZERO });
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cb.try_acquire("p"), CallPermission::Rejected { retry_in: Duration::from_secs(1) });
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_time_in_state() {
        let mut cb = CircuitBreaker::new(config());
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(cb.snapshot().time_in_state_ms, 250);

        for _ in 0..4 {
            cb.record_failure("p");
        }
        assert_eq!(cb.snapshot().state, CircuitState::Open);
        assert_eq!(cb.snapshot().time_in_state_ms, 0);
    }
}
