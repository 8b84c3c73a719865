//! Channel fallback policy

use crate::types::Channel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a channel was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// No enabled provider, or the provider reported itself down
    ProviderDown,
    /// Every attempt timed out
    Timeout,
    /// Provider returned an error
    Error,
    /// Breaker refused the call
    CircuitOpen,
}

impl FailureReason {
    /// All reasons
    pub const ALL: [FailureReason; 4] = [
        FailureReason::ProviderDown,
        FailureReason::Timeout,
        FailureReason::Error,
        FailureReason::CircuitOpen,
    ];

    /// Wire name
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::ProviderDown => "PROVIDER_DOWN",
            FailureReason::Timeout => "TIMEOUT",
            FailureReason::Error => "ERROR",
            FailureReason::CircuitOpen => "CIRCUIT_OPEN",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Observable channel hop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackEvent {
    /// Abandoned channel
    pub from: Channel,
    /// Next channel
    pub to: Channel,
    /// Why `from` was abandoned
    pub reason: FailureReason,
    /// When the hop happened
    pub at: DateTime<Utc>,
}

/// Fallback settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Channels in fallback order
    pub chain: Vec<Channel>,
    /// Reasons that trigger a hop
    pub fallback_on: Vec<FailureReason>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            chain: vec![Channel::Sms, Channel::Voice, Channel::Push],
            fallback_on: FailureReason::ALL.to_vec(),
        }
    }
}

/// Picks the next channel after a failure
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    config: FallbackConfig,
}

impl FallbackPolicy {
    /// Create policy
    pub fn new(config: FallbackConfig) -> Self {
        Self { config }
    }

    /// Configured chain
    pub fn chain(&self) -> &[Channel] {
        &self.config.chain
    }

    /// Next untried channel after `current`, or `None` when the reason does not
    /// trigger fallback or the chain is spent.
    ///
    /// A channel outside the chain (chosen by a rule) falls back to the first
    /// untried chain element.
    pub fn next(&self, current: Channel, reason: FailureReason, attempted: &[Channel]) -> Option<Channel> {
        if !self.config.fallback_on.contains(&reason) {
            return None;
        }

        let start = self
            .config
            .chain
            .iter()
            .position(|c| *c == current)
            .map(|i| i + 1)
            .unwrap_or(0);

        self.config.chain[start..]
            .iter()
            .copied()
            .find(|c| *c != current && !attempted.contains(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> FallbackPolicy {
        FallbackPolicy::new(FallbackConfig::default())
    }

    #[test]
    fn test_walks_chain_in_order() {
        let p = policy();
        assert_eq!(p.next(Channel::Sms, FailureReason::Timeout, &[Channel::Sms]), Some(Channel::Voice));
        assert_eq!(
            p.next(Channel::Voice, FailureReason::Error, &[Channel::Sms, Channel::Voice]),
            Some(Channel::Push)
        );
        assert_eq!(
            p.next(Channel::Push, FailureReason::Error, &[Channel::Sms, Channel::Voice, Channel::Push]),
            None
        );
    }

    #[test]
    fn test_channel_outside_chain_starts_at_head() {
        let p = policy();
        assert_eq!(
            p.next(Channel::Biometric, FailureReason::ProviderDown, &[Channel::Biometric]),
            Some(Channel::Sms)
        );
    }

    #[test]
    fn test_never_revisits_attempted() {
        let p = policy();
        // rule picked VOICE, VOICE failed, chain continues with PUSH only
        assert_eq!(p.next(Channel::Voice, FailureReason::Timeout, &[Channel::Voice]), Some(Channel::Push));
        assert_eq!(
            p.next(Channel::Push, FailureReason::Timeout, &[Channel::Voice, Channel::Push]),
            None
        );
    }

    #[test]
    fn test_reason_outside_trigger_set() {
        let p = FallbackPolicy::new(FallbackConfig {
            fallback_on: vec![FailureReason::Timeout],
            ..FallbackConfig::default()
        });
        assert_eq!(p.next(Channel::Sms, FailureReason::Error, &[Channel::Sms]), None);
        assert_eq!(p.next(Channel::Sms, FailureReason::Timeout, &[Channel::Sms]), Some(Channel::Voice));
    }
}
