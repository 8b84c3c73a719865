//! Delivery providers and their configuration snapshot
//!
//! [`ProviderRegistry`] holds an immutable [`ProviderSnapshot`] behind an
//! `Arc` that is swapped wholesale on reload. A dispatch grabs the snapshot
//! once and keeps it, so a concurrent reload never produces a torn read.

use crate::challenge::SignatureChallenge;
use crate::metrics::PROVIDER_CONFIG_VERSION;
use crate::repository::ProviderConfigSource;
use crate::types::Channel;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Provider configuration, as loaded from storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Channel served
    pub provider_type: Channel,
    /// Unique provider code, keys the circuit breaker and client
    pub code: String,
    /// Disabled providers are never resolved
    pub enabled: bool,
    /// Lower is preferred within a channel
    pub priority: i32,
    /// Bound on a single send (milliseconds)
    pub timeout_ms: u64,
    /// Total send attempts per dispatch, first call included
    pub max_retry_attempts: u32,
    /// Provider-specific settings
    #[serde(default)]
    pub config: serde_json::Value,
    /// Reference into the secret store, never the secret
    #[serde(default)]
    pub secret_ref: Option<String>,
}

impl ProviderConfig {
    /// Enabled provider with a 5s timeout and 3 attempts
    pub fn new(provider_type: Channel, code: impl Into<String>) -> Self {
        Self {
            provider_type,
            code: code.into(),
            enabled: true,
            priority: 1,
            timeout_ms: 5_000,
            max_retry_attempts: 3,
            config: serde_json::Value::Null,
            secret_ref: None,
        }
    }

    /// Send timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Attempts per dispatch (at least one)
    pub fn max_attempts(&self) -> u32 {
        self.max_retry_attempts.max(1)
    }
}

/// Immutable view of every configured provider
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    /// Providers, in load order
    pub providers: Vec<ProviderConfig>,
    /// Monotonic version, bumped on every swap
    pub version: u64,
    /// When the snapshot was applied
    pub loaded_at: DateTime<Utc>,
}

impl ProviderSnapshot {
    fn empty() -> Self {
        Self {
            providers: Vec::new(),
            version: 0,
            loaded_at: Utc::now(),
        }
    }

    /// Preferred enabled provider for the channel
    pub fn resolve(&self, channel: Channel) -> Option<&ProviderConfig> {
        self.providers
            .iter()
            .filter(|p| p.enabled && p.provider_type == channel)
            .min_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.code.cmp(&b.code)))
    }

    /// Whether any provider, enabled or not, serves the channel
    pub fn is_configured(&self, channel: Channel) -> bool {
        self.providers.iter().any(|p| p.provider_type == channel)
    }
}

/// Provider acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Provider-side message id
    pub provider_message_id: String,
}

/// Provider liveness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderHealth {
    /// Reachable
    Up,
    /// Unreachable
    Down {
        /// Reason reported by the client
        reason: String,
    },
}

/// Provider call failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// No answer within the timeout
    #[error("Timed out after {ms}ms")]
    Timeout {
        /// Timeout that elapsed
        ms: u64,
    },

    /// Provider reported itself unavailable
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// Network-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Provider refused the request; retrying will not help
    #[error("Rejected ({code}): {message}")]
    Rejected {
        /// Provider error code
        code: String,
        /// Provider message
        message: String,
    },
}

impl ProviderError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Rejected { .. })
    }

    /// Whether this is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProviderError::Timeout { .. })
    }
}

/// Client for one provider
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Channel served
    fn channel(&self) -> Channel;

    /// Send the challenge to the recipient
    async fn send(
        &self,
        challenge: &SignatureChallenge,
        recipient: &str,
    ) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Liveness check
    async fn health_check(&self) -> ProviderHealth;
}

/// Provider snapshot plus the clients that talk to them
pub struct ProviderRegistry {
    current: RwLock<Arc<ProviderSnapshot>>,
    clients: DashMap<String, Arc<dyn ProviderClient>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(ProviderSnapshot::empty())),
            clients: DashMap::new(),
        }
    }

    /// Current snapshot, held by the caller for the whole dispatch
    pub fn snapshot(&self) -> Arc<ProviderSnapshot> {
        self.current.read().clone()
    }

    /// Validate and atomically install a new provider list
    pub fn apply_snapshot(&self, providers: Vec<ProviderConfig>) -> Result<u64> {
        let mut seen: HashSet<&str> = HashSet::new();
        for provider in &providers {
            if provider.code.trim().is_empty() {
                return Err(Error::Config("provider code must not be empty".to_string()));
            }
            if !seen.insert(provider.code.as_str()) {
                return Err(Error::Config(format!("duplicate provider code {}", provider.code)));
            }
            if provider.timeout_ms == 0 {
                return Err(Error::Config(format!("provider {} has zero timeout", provider.code)));
            }
        }

        let mut current = self.current.write();
        let version = current.version + 1;
        *current = Arc::new(ProviderSnapshot {
            providers,
            version,
            loaded_at: Utc::now(),
        });
        drop(current);

        PROVIDER_CONFIG_VERSION.set(version as i64);
        info!("Provider snapshot v{} applied", version);
        Ok(version)
    }

    /// Load from the configuration source and apply
    pub async fn reload(&self, source: &dyn ProviderConfigSource) -> Result<u64> {
        let providers = source.load_providers().await?;
        self.apply_snapshot(providers)
    }

    /// Register the client for a provider code
    pub fn register_client(&self, code: impl Into<String>, client: Arc<dyn ProviderClient>) {
        self.clients.insert(code.into(), client);
    }

    /// Client for a provider code
    pub fn client_for(&self, code: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(code).map(|c| c.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(channel: Channel, code: &str, priority: i32, enabled: bool) -> ProviderConfig {
        ProviderConfig {
            priority,
            enabled,
            ..ProviderConfig::new(channel, code)
        }
    }

    #[test]
    fn test_resolve_prefers_enabled_low_priority() {
        let registry = ProviderRegistry::new();
        registry
            .apply_snapshot(vec![
                provider(Channel::Sms, "sms-b", 2, true),
                provider(Channel::Sms, "sms-a", 1, false),
                provider(Channel::Sms, "sms-c", 3, true),
                provider(Channel::Voice, "voice-a", 1, true),
            ])
            .unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.resolve(Channel::Sms).unwrap().code, "sms-b");
        assert!(snapshot.resolve(Channel::Push).is_none());
        assert!(snapshot.is_configured(Channel::Sms));
        assert!(!snapshot.is_configured(Channel::Biometric));
    }

    #[test]
    fn test_swap_keeps_old_snapshot_for_holders() {
        let registry = ProviderRegistry::new();
        registry.apply_snapshot(vec![provider(Channel::Sms, "sms-a", 1, true)]).unwrap();
        let held = registry.snapshot();

        let version = registry
            .apply_snapshot(vec![provider(Channel::Sms, "sms-a", 1, false)])
            .unwrap();
        assert_eq!(version, 2);
        assert!(held.resolve(Channel::Sms).is_some());
        assert!(registry.snapshot().resolve(Channel::Sms).is_none());
    }

    #[test]
    fn test_rejects_invalid_snapshot() {
        let registry = ProviderRegistry::new();
        let dup = registry.apply_snapshot(vec![
            provider(Channel::Sms, "x", 1, true),
            provider(Channel::Voice, "x", 1, true),
        ]);
        assert!(matches!(dup, Err(Error::Config(_))));

        let zero = ProviderConfig {
            timeout_ms: 0,
            ..ProviderConfig::new(Channel::Sms, "y")
        };
        assert!(registry.apply_snapshot(vec![zero]).is_err());
        assert_eq!(registry.snapshot().version, 0);
    }

    #[test]
    fn test_error_classification() {
        assert!(ProviderError::Timeout { ms: 10 }.is_retryable());
        assert!(ProviderError::Unavailable("503".into()).is_retryable());
        assert!(!ProviderError::Rejected {
            code: "INVALID_NUMBER".into(),
            message: "bad".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_max_attempts_at_least_one() {
        let config = ProviderConfig {
            max_retry_attempts: 0,
            ..ProviderConfig::new(Channel::Push, "push")
        };
        assert_eq!(config.max_attempts(), 1);
    }
}
