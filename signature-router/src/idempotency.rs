//! Request-level idempotency
//!
//! Keys are claimed with a compare-and-insert before any dispatch work, so two
//! concurrent first-time callers with the same key cannot both reach a
//! provider. Only successful outcomes are stored; a failed dispatch releases
//! its claim and the key can be retried.
//!
//! Every claim carries a [`ClaimToken`]. Release and completion only act on
//! the claim the token names, and the owner refreshes the claim while its
//! dispatch runs, so a slow dispatch is never taken over as abandoned.

use crate::types::SignatureRequest;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::fmt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Idempotency settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// How long completed responses are replayed
    pub retention_hours: u64,
    /// Claims older than this are considered abandoned
    pub in_flight_timeout_secs: u64,
    /// Purge task interval
    pub purge_interval_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention_hours: 24,
            in_flight_timeout_secs: 30,
            purge_interval_secs: 300,
        }
    }
}

impl IdempotencyConfig {
    /// Claims older than this are considered abandoned
    pub fn in_flight_timeout(&self) -> Duration {
        Duration::from_secs(self.in_flight_timeout_secs)
    }

    /// How often an owner refreshes its claim
    pub fn claim_refresh_interval(&self) -> Duration {
        (self.in_flight_timeout() / 3).max(Duration::from_millis(100))
    }
}

/// Proof of ownership of an in-flight claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    /// Fresh random token
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Cached response for a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Caller-supplied key
    pub key: String,
    /// SHA-256 of the original request
    pub request_fingerprint: String,
    /// Response status
    pub status_code: u16,
    /// Response body, replayed byte for byte
    pub body: String,
    /// Stored at
    pub created_at: DateTime<Utc>,
    /// Replay window end
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Create a record valid for `retention`
    pub fn new(
        key: impl Into<String>,
        request_fingerprint: impl Into<String>,
        status_code: u16,
        body: impl Into<String>,
        retention: Duration,
    ) -> Self {
        let created_at = Utc::now();
        let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(24));
        Self {
            key: key.into(),
            request_fingerprint: request_fingerprint.into(),
            status_code,
            body: body.into(),
            created_at,
            expires_at: created_at + retention,
        }
    }

    /// Whether the replay window has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of claiming a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Caller owns the key and must store or release it with the token
    Acquired(ClaimToken),
    /// Another request holds the key
    InFlight,
    /// Key already completed
    Completed(IdempotencyRecord),
}

/// Idempotency storage collaborator
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Completed, unexpired record for the key
    async fn lookup(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Atomically reserve the key unless it is held or completed
    async fn claim(&self, key: &str, request_fingerprint: &str) -> Result<ClaimOutcome>;

    /// Keep an owned claim alive. Returns false when the claim is no longer
    /// held by `token`.
    async fn refresh(&self, key: &str, token: &ClaimToken) -> Result<bool>;

    /// Complete the claim held by `token`. The first completion wins: an
    /// unexpired record already present is returned unchanged, and a claim
    /// now held by another token is left alone.
    async fn store(&self, record: IdempotencyRecord, token: &ClaimToken) -> Result<IdempotencyRecord>;

    /// Drop the in-flight claim held by `token`
    async fn release(&self, key: &str, token: &ClaimToken) -> Result<()>;

    /// Delete expired records and abandoned claims
    async fn purge_expired(&self) -> Result<usize>;
}

#[derive(Debug, Clone)]
enum Slot {
    InFlight { token: ClaimToken, claimed_at: Instant },
    Completed(IdempotencyRecord),
}

/// In-process idempotency store
pub struct InMemoryIdempotencyStore {
    slots: DashMap<String, Slot>,
    in_flight_timeout: Duration,
}

impl InMemoryIdempotencyStore {
    /// Create store
    pub fn new(in_flight_timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            in_flight_timeout,
        }
    }

    /// Create store from config
    pub fn from_config(config: &IdempotencyConfig) -> Self {
        Self::new(Duration::from_secs(config.in_flight_timeout_secs))
    }

    /// Number of keys held (claims and records)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn is_stale(&self, slot: &Slot, now: DateTime<Utc>) -> bool {
        match slot {
            Slot::InFlight { claimed_at, .. } => claimed_at.elapsed() >= self.in_flight_timeout,
            Slot::Completed(record) => record.is_expired(now),
        }
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn lookup(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let now = Utc::now();
        Ok(self.slots.get(key).and_then(|slot| match slot.value() {
            Slot::Completed(record) if !record.is_expired(now) => Some(record.clone()),
            _ => None,
        }))
    }

    async fn claim(&self, key: &str, request_fingerprint: &str) -> Result<ClaimOutcome> {
        let now = Utc::now();
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if self.is_stale(occupied.get(), now) {
                    if let Slot::InFlight { token, .. } = occupied.get() {
                        warn!("Reclaiming abandoned idempotency key {} from claim {}", key, token);
                    }
                    let token = ClaimToken::new();
                    occupied.insert(Slot::InFlight {
                        token,
                        claimed_at: Instant::now(),
                    });
                    return Ok(ClaimOutcome::Acquired(token));
                }
                match occupied.get() {
                    Slot::InFlight { .. } => {
                        debug!("Idempotency key {} in flight ({})", key, request_fingerprint);
                        Ok(ClaimOutcome::InFlight)
                    }
                    Slot::Completed(record) => Ok(ClaimOutcome::Completed(record.clone())),
                }
            }
            Entry::Vacant(vacant) => {
                let token = ClaimToken::new();
                vacant.insert(Slot::InFlight {
                    token,
                    claimed_at: Instant::now(),
                });
                Ok(ClaimOutcome::Acquired(token))
            }
        }
    }

    async fn refresh(&self, key: &str, token: &ClaimToken) -> Result<bool> {
        Ok(match self.slots.get_mut(key) {
            Some(mut slot) => match slot.value_mut() {
                Slot::InFlight { token: held, claimed_at } if *held == *token => {
                    *claimed_at = Instant::now();
                    true
                }
                _ => false,
            },
            None => false,
        })
    }

    async fn store(&self, record: IdempotencyRecord, token: &ClaimToken) -> Result<IdempotencyRecord> {
        let now = Utc::now();
        match self.slots.entry(record.key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get() {
                Slot::Completed(existing) if !existing.is_expired(now) => Ok(existing.clone()),
                Slot::InFlight { token: held, .. } if held != token => {
                    warn!(
                        "Idempotency key {} is held by claim {}, not storing result of {}",
                        record.key, held, token
                    );
                    Ok(record)
                }
                _ => {
                    occupied.insert(Slot::Completed(record.clone()));
                    Ok(record)
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Completed(record.clone()));
                Ok(record)
            }
        }
    }

    async fn release(&self, key: &str, token: &ClaimToken) -> Result<()> {
        let released = self
            .slots
            .remove_if(key, |_, slot| matches!(slot, Slot::InFlight { token: held, .. } if held == token));
        if released.is_none() {
            debug!("Idempotency key {} not held by claim {}, nothing to release", key, token);
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !self.is_stale(slot, now));
        Ok(before.saturating_sub(self.slots.len()))
    }
}

/// SHA-256 over the canonical JSON form of the request, hex encoded.
/// Amounts are normalized first so `1500` and `1500.00` hash alike.
pub fn request_fingerprint(request: &SignatureRequest) -> Result<String> {
    let mut canonical = request.clone();
    canonical.context.amount.value = canonical.context.amount.value.normalize();
    let canonical = serde_json::to_vec(&canonical)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Start periodic purge of expired records and abandoned claims
pub fn start_purge_task(store: Arc<dyn IdempotencyStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
        loop {
            interval.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => info!("Idempotency purge removed {} entries", purged),
                Err(e) => warn!("Idempotency purge failed: {}", e),
            }
        }
    })
}
