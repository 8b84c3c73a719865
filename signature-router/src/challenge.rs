//! Signature challenge lifecycle
//!
//! `PENDING → SENT → (VERIFIED | EXPIRED | FAILED)`, with `PENDING → FAILED`
//! when every channel is exhausted.

use crate::types::Channel;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Challenge settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    /// Validity window
    pub ttl_seconds: u64,
    /// Digits in the code
    pub code_length: usize,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            code_length: 6,
        }
    }
}

/// Challenge status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeStatus {
    /// Created, not yet delivered
    Pending,
    /// Accepted by a provider
    Sent,
    /// Code confirmed
    Verified,
    /// Validity window passed
    Expired,
    /// Delivery failed on every channel
    Failed,
}

impl ChallengeStatus {
    /// No further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChallengeStatus::Verified | ChallengeStatus::Expired | ChallengeStatus::Failed
        )
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChallengeStatus::Pending => "PENDING",
            ChallengeStatus::Sent => "SENT",
            ChallengeStatus::Verified => "VERIFIED",
            ChallengeStatus::Expired => "EXPIRED",
            ChallengeStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Result of a verification attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationResult {
    /// Code matched
    Verified,
    /// Code did not match, challenge still open
    Mismatch,
    /// Challenge expired
    Expired,
}

/// Challenge delivered to the signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureChallenge {
    /// Identity (UUIDv7)
    pub id: Uuid,
    /// Numeric code
    #[serde(skip_serializing, default)]
    pub code: String,
    /// Current channel
    pub channel: Channel,
    /// Provider that accepted the challenge
    pub provider: Option<String>,
    /// Provider-side message id
    pub provider_message_id: Option<String>,
    /// Status
    pub status: ChallengeStatus,
    /// Created at
    pub created_at: DateTime<Utc>,
    /// Expires at
    pub expires_at: DateTime<Utc>,
    /// Provider calls made across all channels
    pub attempt_count: u32,
}

impl SignatureChallenge {
    /// New pending challenge with a random code
    pub fn new(channel: Channel, config: &ChallengeConfig) -> Self {
        let created_at = Utc::now();
        Self {
            id: Uuid::now_v7(),
            code: generate_code(config.code_length),
            channel,
            provider: None,
            provider_message_id: None,
            status: ChallengeStatus::Pending,
            created_at,
            expires_at: created_at + Duration::seconds(config.ttl_seconds.min(i64::MAX as u64) as i64),
            attempt_count: 0,
        }
    }

    /// Move to another channel before delivery
    pub fn switch_channel(&mut self, channel: Channel) -> Result<()> {
        self.require(ChallengeStatus::Pending, "PENDING")?;
        self.channel = channel;
        self.provider = None;
        Ok(())
    }

    /// Count provider calls made on the current channel
    pub fn record_attempts(&mut self, provider: &str, calls: u32) {
        self.attempt_count += calls;
        self.provider = Some(provider.to_string());
    }

    /// Provider accepted the challenge
    pub fn mark_sent(&mut self, provider: &str, provider_message_id: &str) -> Result<()> {
        self.require(ChallengeStatus::Pending, "SENT")?;
        self.provider = Some(provider.to_string());
        self.provider_message_id = Some(provider_message_id.to_string());
        self.status = ChallengeStatus::Sent;
        Ok(())
    }

    /// Delivery failed everywhere
    pub fn mark_failed(&mut self) -> Result<()> {
        self.require(ChallengeStatus::Pending, "FAILED")?;
        self.status = ChallengeStatus::Failed;
        Ok(())
    }

    /// Check a code submitted by the signer
    pub fn verify(&mut self, code: &str, now: DateTime<Utc>) -> Result<VerificationResult> {
        if self.expire_if_due(now) {
            return Ok(VerificationResult::Expired);
        }
        self.require(ChallengeStatus::Sent, "VERIFIED")?;
        if constant_time_eq(self.code.as_bytes(), code.as_bytes()) {
            self.status = ChallengeStatus::Verified;
            Ok(VerificationResult::Verified)
        } else {
            Ok(VerificationResult::Mismatch)
        }
    }

    /// Expire a sent challenge past its window. Returns whether it is expired.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == ChallengeStatus::Sent && now >= self.expires_at {
            self.status = ChallengeStatus::Expired;
        }
        self.status == ChallengeStatus::Expired
    }

    fn require(&self, expected: ChallengeStatus, to: &str) -> Result<()> {
        if self.status != expected {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }
}

fn generate_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length.max(1))
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent() -> SignatureChallenge {
        let mut challenge = SignatureChallenge::new(Channel::Sms, &ChallengeConfig::default());
        challenge.mark_sent("sms-a", "msg-1").unwrap();
        challenge
    }

    #[test]
    fn test_code_shape() {
        let challenge = SignatureChallenge::new(
            Channel::Sms,
            &ChallengeConfig {
                ttl_seconds: 60,
                code_length: 8,
            },
        );
        assert_eq!(challenge.code.len(), 8);
        assert!(challenge.code.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(challenge.status, ChallengeStatus::Pending);
        assert_eq!((challenge.expires_at - challenge.created_at).num_seconds(), 60);
    }

    #[test]
    fn test_verify() {
        let mut challenge = sent();
        let code = challenge.code.clone();
        assert_eq!(challenge.verify("x", Utc::now()).unwrap(), VerificationResult::Mismatch);
        assert_eq!(challenge.verify(&code, Utc::now()).unwrap(), VerificationResult::Verified);
        assert!(challenge.status.is_terminal());
        assert!(challenge.verify(&code, Utc::now()).is_err());
    }

    #[test]
    fn test_verify_after_expiry() {
        let mut challenge = sent();
        let code = challenge.code.clone();
        let later = challenge.expires_at + Duration::seconds(1);
        assert_eq!(challenge.verify(&code, later).unwrap(), VerificationResult::Expired);
        assert_eq!(challenge.status, ChallengeStatus::Expired);
    }

    #[test]
    fn test_guarded_transitions() {
        let mut challenge = sent();
        assert!(challenge.mark_failed().is_err());
        assert!(challenge.switch_channel(Channel::Voice).is_err());
        assert!(challenge.mark_sent("p", "m").is_err());

        let mut pending = SignatureChallenge::new(Channel::Sms, &ChallengeConfig::default());
        pending.switch_channel(Channel::Push).unwrap();
        pending.mark_failed().unwrap();
        assert!(matches!(pending.mark_sent("p", "m"), Err(Error::InvalidTransition { .. })));
    }

    #[test]
    fn test_code_not_serialized() {
        let json = serde_json::to_value(sent()).unwrap();
        assert!(json.get("code").is_none());
        assert_eq!(json["status"], "SENT");
    }
}
