//! Scripted providers and recording sinks for tests and the demo binary

use crate::audit::{AuditEvent, AuditSink};
use crate::challenge::SignatureChallenge;
use crate::provider::{ProviderClient, ProviderError, ProviderHealth, ProviderResponse};
use crate::types::Channel;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// What a scripted send does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// Accept the challenge
    Succeed,
    /// Fail with the error
    Fail(ProviderError),
    /// Never answer
    Hang,
}

/// Provider that replays a script, then repeats a default behaviour
pub struct ScriptedProvider {
    channel: Channel,
    code: String,
    script: Mutex<VecDeque<Behavior>>,
    default: Behavior,
    latency: Option<Duration>,
    health: Mutex<ProviderHealth>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    /// Provider that always applies `behavior`
    pub fn new(channel: Channel, code: impl Into<String>, behavior: Behavior) -> Self {
        Self {
            channel,
            code: code.into(),
            script: Mutex::new(VecDeque::new()),
            default: behavior,
            latency: None,
            health: Mutex::new(ProviderHealth::Up),
            calls: AtomicU32::new(0),
        }
    }

    /// Always succeeds
    pub fn succeeding(channel: Channel, code: impl Into<String>) -> Self {
        Self::new(channel, code, Behavior::Succeed)
    }

    /// Always fails with `error`
    pub fn failing(channel: Channel, code: impl Into<String>, error: ProviderError) -> Self {
        Self::new(channel, code, Behavior::Fail(error))
    }

    /// Play `script` first
    pub fn with_script(mut self, script: Vec<Behavior>) -> Self {
        self.script = Mutex::new(script.into());
        self
    }

    /// Delay every answer
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Health reported by `health_check`
    pub fn set_health(&self, health: ProviderHealth) {
        *self.health.lock() = health;
    }

    /// Sends received so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(
        &self,
        challenge: &SignatureChallenge,
        _recipient: &str,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let behavior = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match behavior {
            Behavior::Succeed => Ok(ProviderResponse {
                provider_message_id: format!("{}-{}-{}", self.code, challenge.id.simple(), n),
            }),
            Behavior::Fail(error) => Err(error),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Err(ProviderError::Transport("connection dropped".to_string()))
            }
        }
    }

    async fn health_check(&self) -> ProviderHealth {
        self.health.lock().clone()
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events, in order
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Rejects every event
#[derive(Debug, Default)]
pub struct FailingAuditSink;

impl AuditSink for FailingAuditSink {
    fn record(&self, _event: &AuditEvent) -> Result<()> {
        Err(Error::Storage("audit backend down".to_string()))
    }
}
