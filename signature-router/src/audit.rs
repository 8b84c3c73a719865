//! Audit events (fire-and-forget)
//!
//! Sinks may fail; [`emit`] logs the failure and moves on so the dispatch
//! outcome never depends on audit delivery.

use crate::admission::AdmissionScope;
use crate::dispatch::ChannelAttempt;
use crate::fallback::FailureReason;
use crate::types::Channel;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Audit event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    /// Channel hop
    FallbackTriggered {
        /// Challenge
        challenge_id: Uuid,
        /// Abandoned channel
        from: Channel,
        /// Next channel
        to: Channel,
        /// Why
        reason: FailureReason,
        /// When
        at: DateTime<Utc>,
    },
    /// Provider accepted the challenge
    DispatchSucceeded {
        /// Challenge
        challenge_id: Uuid,
        /// Delivering channel
        channel: Channel,
        /// Delivering provider
        provider: String,
        /// Provider message id
        provider_message_id: String,
        /// Provider calls across all channels
        attempts: u32,
        /// When
        at: DateTime<Utc>,
    },
    /// Every channel failed
    DispatchExhausted {
        /// Challenge
        challenge_id: Uuid,
        /// Channels tried
        attempts: Vec<ChannelAttempt>,
        /// When
        at: DateTime<Utc>,
    },
    /// Rate limited
    AdmissionRejected {
        /// Caller
        caller_id: String,
        /// Limiter
        scope: AdmissionScope,
        /// When
        at: DateTime<Utc>,
    },
    /// Cached response returned
    IdempotentReplay {
        /// Key
        idempotency_key: String,
        /// Replayed status
        status_code: u16,
        /// When
        at: DateTime<Utc>,
    },
    /// No rule matched
    NoRoute {
        /// Order being signed
        order_id: String,
        /// When
        at: DateTime<Utc>,
    },
}

/// Audit event consumer
pub trait AuditSink: Send + Sync {
    /// Record one event
    fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Hand an event to the sink, swallowing failures
pub fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.record(&event) {
        warn!("Audit event dropped: {}", e);
    }
}

/// Writes events to the `audit` tracing target as JSON
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        info!(target: "audit", "{}", json);
        Ok(())
    }
}

/// Forwards events to a bounded channel without waiting
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    sender: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    /// Create sink and its receiving end
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        self.sender
            .try_send(event.clone())
            .map_err(|e| Error::Storage(format!("audit channel: {}", e)))
    }
}
