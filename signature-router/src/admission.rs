//! Admission control (global and per-caller rate limiting)
//!
//! Both tiers are token buckets that refill a fixed number of permits at the
//! end of every refill period, capped at capacity. Acquisition never waits:
//! an empty bucket rejects immediately. Per-caller buckets are created on
//! first use and evicted after a period of inactivity.

use crate::metrics::ADMISSION_DECISIONS;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Token bucket parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum permits held
    pub capacity: u64,
    /// Permits added per refill period
    pub refill_tokens: u64,
    /// Refill period (milliseconds)
    pub refill_period_ms: u64,
}

impl RateLimitConfig {
    /// Bucket that grants `permits` per `period`
    pub fn per_period(permits: u64, period: Duration) -> Self {
        Self {
            capacity: permits,
            refill_tokens: permits,
            refill_period_ms: period.as_millis() as u64,
        }
    }

    fn refill_period(&self) -> Duration {
        Duration::from_millis(self.refill_period_ms.max(1))
    }
}

/// Admission configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Shared across all callers
    pub global: RateLimitConfig,
    /// One bucket per caller id
    pub per_caller: RateLimitConfig,
    /// Idle time after which a caller bucket is dropped (seconds)
    pub idle_eviction_secs: u64,
    /// Cleanup task interval (seconds)
    pub cleanup_interval_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global: RateLimitConfig::per_period(100, Duration::from_secs(1)),
            per_caller: RateLimitConfig::per_period(10, Duration::from_secs(60)),
            idle_eviction_secs: 600,
            cleanup_interval_secs: 60,
        }
    }
}

/// Which limiter made the decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionScope {
    /// Global budget
    Global,
    /// Per-caller budget
    PerCaller,
}

impl AdmissionScope {
    fn label(&self) -> &'static str {
        match self {
            AdmissionScope::Global => "global",
            AdmissionScope::PerCaller => "per_caller",
        }
    }
}

impl fmt::Display for AdmissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionScope::Global => write!(f, "global"),
            AdmissionScope::PerCaller => write!(f, "per-caller"),
        }
    }
}

#[derive(Debug)]
struct BucketClock {
    last_refill: Instant,
    last_access: Instant,
}

/// Token bucket with atomic permit accounting
#[derive(Debug)]
pub struct TokenBucket {
    permits: AtomicU64,
    clock: Mutex<BucketClock>,
    config: RateLimitConfig,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            permits: AtomicU64::new(config.capacity),
            clock: Mutex::new(BucketClock {
                last_refill: now,
                last_access: now,
            }),
            config,
        }
    }

    /// Take one permit if available, never waits
    pub fn try_acquire(&self) -> bool {
        self.refill();

        self.permits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| current.checked_sub(1))
            .is_ok()
    }

    /// Permits currently available
    pub fn available(&self) -> u64 {
        self.refill();
        self.permits.load(Ordering::SeqCst)
    }

    /// Time since last acquisition attempt
    pub fn idle_for(&self) -> Duration {
        self.clock.lock().last_access.elapsed()
    }

    fn refill(&self) {
        let now = Instant::now();
        let mut clock = self.clock.lock();
        clock.last_access = now;

        let period = self.config.refill_period();
        let elapsed = now.saturating_duration_since(clock.last_refill);
        let periods = (elapsed.as_nanos() / period.as_nanos()) as u64;
        if periods == 0 {
            return;
        }
        // whole periods only, the remainder carries over
        clock.last_refill += period * periods.min(u32::MAX as u64) as u32;

        let added = self.config.refill_tokens.saturating_mul(periods);
        let capacity = self.config.capacity;
        let _ = self
            .permits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_add(added).min(capacity))
            });
    }
}

/// Global and per-caller rate limiting
pub struct AdmissionController {
    global: TokenBucket,
    callers: DashMap<String, Arc<TokenBucket>>,
    config: AdmissionConfig,
}

impl AdmissionController {
    /// Create new controller
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            global: TokenBucket::new(config.global.clone()),
            callers: DashMap::new(),
            config,
        }
    }

    /// Acquire one global permit
    pub fn check_global(&self) -> Result<()> {
        self.decide(AdmissionScope::Global, self.global.try_acquire(), "global")
    }

    /// Acquire one permit from the caller's bucket
    pub fn check_per_caller(&self, caller_id: &str) -> Result<()> {
        let bucket = match self.callers.get(caller_id) {
            Some(bucket) => bucket.clone(),
            None => self
                .callers
                .entry(caller_id.to_string())
                .or_insert_with(|| Arc::new(TokenBucket::new(self.config.per_caller.clone())))
                .clone(),
        };
        self.decide(AdmissionScope::PerCaller, bucket.try_acquire(), caller_id)
    }

    /// Global check first, then per-caller
    pub fn admit(&self, caller_id: &str) -> Result<()> {
        self.check_global()?;
        self.check_per_caller(caller_id)
    }

    fn decide(&self, scope: AdmissionScope, acquired: bool, subject: &str) -> Result<()> {
        if acquired {
            ADMISSION_DECISIONS.with_label_values(&[scope.label(), "allowed"]).inc();
            Ok(())
        } else {
            ADMISSION_DECISIONS.with_label_values(&[scope.label(), "exceeded"]).inc();
            warn!("{} rate limit exceeded: {}", scope, subject);
            Err(Error::AdmissionRejected { scope })
        }
    }

    /// Number of live caller buckets
    pub fn tracked_callers(&self) -> usize {
        self.callers.len()
    }

    /// Drop caller buckets idle for at least `max_idle`
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.callers.len();
        self.callers.retain(|_, bucket| bucket.idle_for() < max_idle);
        let evicted = before.saturating_sub(self.callers.len());
        if evicted > 0 {
            debug!("Evicted {} idle caller buckets", evicted);
        }
        evicted
    }

    /// Start periodic eviction of idle caller buckets
    pub fn start_cleanup_task(self: Arc<Self>) -> JoinHandle<()> {
        let every = Duration::from_secs(self.config.cleanup_interval_secs.max(1));
        let max_idle = Duration::from_secs(self.config.idle_eviction_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let evicted = self.evict_idle(max_idle);
                info!(
                    "Rate limiter cleanup: evicted {}, tracking {} callers",
                    evicted,
                    self.tracked_callers()
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(global: u64, per_caller: u64) -> AdmissionController {
        AdmissionController::new(AdmissionConfig {
            global: RateLimitConfig::per_period(global, Duration::from_secs(1)),
            per_caller: RateLimitConfig::per_period(per_caller, Duration::from_secs(60)),
            idle_eviction_secs: 120,
            cleanup_interval_secs: 30,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_capacity_per_period() {
        let bucket = TokenBucket::new(RateLimitConfig::per_period(5, Duration::from_secs(1)));
        for _ in 0..5 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!bucket.try_acquire());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(bucket.available(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_capped_at_capacity() {
        let bucket = TokenBucket::new(RateLimitConfig {
            capacity: 3,
            refill_tokens: 2,
            refill_period_ms: 100,
        });
        assert!(bucket.try_acquire());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(bucket.available(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_never_over_grants() {
        let bucket = Arc::new(TokenBucket::new(RateLimitConfig::per_period(50, Duration::from_secs(60))));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move {
                (0..20).filter(|_| bucket.try_acquire()).count()
            }));
        }
        let mut granted = 0;
        for handle in handles {
            granted += handle.await.unwrap();
        }
        assert_eq!(granted, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_caller_isolated() {
        let admission = controller(100, 2);
        assert!(admission.admit("alice").is_ok());
        assert!(admission.admit("alice").is_ok());
        let rejected = admission.admit("alice").unwrap_err();
        assert!(matches!(
            rejected,
            Error::AdmissionRejected {
                scope: AdmissionScope::PerCaller
            }
        ));
        assert!(admission.admit("bob").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_checked_first() {
        let admission = controller(1, 10);
        assert!(admission.admit("alice").is_ok());
        let rejected = admission.admit("bob").unwrap_err();
        assert!(matches!(
            rejected,
            Error::AdmissionRejected {
                scope: AdmissionScope::Global
            }
        ));
        assert!(rejected.is_throttled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_callers_evicted() {
        let admission = controller(100, 10);
        admission.admit("alice").unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        admission.admit("bob").unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(admission.evict_idle(Duration::from_secs(120)), 1);
        assert_eq!(admission.tracked_callers(), 1);
    }
}
