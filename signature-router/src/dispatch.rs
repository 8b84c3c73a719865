//! Dispatch orchestration
//!
//! One request runs through a small state machine:
//!
//! ```text
//! SELECTING ─► ADMITTING ─► SENDING ─► SUCCEEDED
//!     │            │          │  ▲
//!     ▼            ▼          ▼  │
//!  NO_ROUTE     REJECTED   RETRYING / FALLING_BACK ─► EXHAUSTED
//! ```
//!
//! Every provider call is wrapped in the same layers, outermost first:
//! admission (once per request), circuit breaker, retry with backoff,
//! timeout. A channel that fails hands over to the fallback policy; admission
//! is not re-checked on a hop.

use crate::admission::AdmissionController;
use crate::audit::{self, AuditEvent, AuditSink};
use crate::challenge::{ChallengeConfig, SignatureChallenge};
use crate::circuit_breaker::CircuitBreakerManager;
use crate::condition::ConditionEvaluator;
use crate::config::Config;
use crate::fallback::{FailureReason, FallbackEvent, FallbackPolicy};
use crate::metrics::{FALLBACK_EVENTS, PROVIDER_CALLS, PROVIDER_CALL_DURATION, ROUTING_DECISIONS};
use crate::provider::{ProviderClient, ProviderError, ProviderRegistry, ProviderResponse, ProviderSnapshot};
use crate::repository::ChallengeRepository;
use crate::retry::RetryStrategy;
use crate::routing::{RoutingDecision, RoutingEngine};
use crate::rule::RoutingRule;
use crate::types::{Channel, IdentityContext, SignatureRequest};
use crate::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Dispatch state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchState {
    /// Evaluating rules
    Selecting,
    /// Checking rate limits
    Admitting,
    /// Calling a provider
    Sending,
    /// Waiting before another call to the same provider
    Retrying,
    /// Choosing the next channel
    FallingBack,
    /// Provider accepted the challenge
    Succeeded,
    /// No rule matched
    NoRoute,
    /// Rate limited
    Rejected,
    /// Every channel failed
    Exhausted,
}

impl DispatchState {
    /// No transition leaves a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchState::Succeeded | DispatchState::NoRoute | DispatchState::Rejected | DispatchState::Exhausted
        )
    }

    fn can_advance_to(&self, next: DispatchState) -> bool {
        use DispatchState::*;
        matches!(
            (self, next),
            (Selecting, Admitting)
                | (Selecting, NoRoute)
                | (Admitting, Sending)
                | (Admitting, Rejected)
                | (Sending, Succeeded)
                | (Sending, Retrying)
                | (Sending, FallingBack)
                | (Retrying, Sending)
                | (FallingBack, Sending)
                | (FallingBack, Exhausted)
        )
    }

    /// Wire name
    pub fn code(&self) -> &'static str {
        match self {
            DispatchState::Selecting => "SELECTING",
            DispatchState::Admitting => "ADMITTING",
            DispatchState::Sending => "SENDING",
            DispatchState::Retrying => "RETRYING",
            DispatchState::FallingBack => "FALLING_BACK",
            DispatchState::Succeeded => "SUCCEEDED",
            DispatchState::NoRoute => "NO_ROUTE",
            DispatchState::Rejected => "REJECTED",
            DispatchState::Exhausted => "EXHAUSTED",
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Guards state transitions for one dispatch
#[derive(Debug, Clone)]
pub struct DispatchTracker {
    state: DispatchState,
    history: Vec<DispatchState>,
}

impl Default for DispatchTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchTracker {
    /// Start in `SELECTING`
    pub fn new() -> Self {
        Self {
            state: DispatchState::Selecting,
            history: vec![DispatchState::Selecting],
        }
    }

    /// Current state
    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// States visited, in order
    pub fn history(&self) -> &[DispatchState] {
        &self.history
    }

    /// Move to `next`, refusing anything out of a terminal state
    pub fn advance(&mut self, next: DispatchState) -> Result<()> {
        if self.state.is_terminal() || !self.state.can_advance_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    fn retry(&mut self) -> Result<()> {
        self.advance(DispatchState::Retrying)?;
        self.advance(DispatchState::Sending)
    }
}

/// One abandoned channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAttempt {
    /// Channel
    pub channel: Channel,
    /// Provider tried, if one was resolved
    pub provider: Option<String>,
    /// Provider calls made
    pub attempts: u32,
    /// Why the channel was abandoned
    pub reason: FailureReason,
    /// Last error
    pub detail: String,
}

impl ChannelAttempt {
    fn new(
        channel: Channel,
        provider: Option<&str>,
        attempts: u32,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            provider: provider.map(str::to_string),
            attempts,
            reason,
            detail: detail.into(),
        }
    }
}

/// Successful dispatch
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    /// Challenge in `SENT`
    pub challenge: SignatureChallenge,
    /// Rule that picked the first channel
    pub decision: RoutingDecision,
    /// Delivering provider
    pub provider: String,
    /// Provider message id
    pub provider_message_id: String,
    /// Channel hops, in order
    pub fallbacks: Vec<FallbackEvent>,
    /// Channels abandoned before delivery
    pub failed_channels: Vec<ChannelAttempt>,
    /// States visited
    pub states: Vec<DispatchState>,
}

enum ChannelOutcome {
    Delivered {
        provider: String,
        response: ProviderResponse,
    },
    Failed(ChannelAttempt),
}

/// Routes, admits and delivers one challenge per request
pub struct DispatchOrchestrator {
    routing: RoutingEngine,
    admission: Arc<AdmissionController>,
    breakers: Arc<CircuitBreakerManager>,
    registry: Arc<ProviderRegistry>,
    retry: RetryStrategy,
    fallback: FallbackPolicy,
    challenges: Arc<dyn ChallengeRepository>,
    audit: Arc<dyn AuditSink>,
    challenge_config: ChallengeConfig,
}

impl DispatchOrchestrator {
    /// Create orchestrator
    pub fn new(
        config: &Config,
        evaluator: Arc<dyn ConditionEvaluator>,
        registry: Arc<ProviderRegistry>,
        challenges: Arc<dyn ChallengeRepository>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            routing: RoutingEngine::new(evaluator),
            admission: Arc::new(AdmissionController::new(config.admission.clone())),
            breakers: Arc::new(CircuitBreakerManager::new(config.circuit_breaker.clone())),
            registry,
            retry: RetryStrategy::new(config.retry.clone()),
            fallback: FallbackPolicy::new(config.fallback.clone()),
            challenges,
            audit,
            challenge_config: config.challenge.clone(),
        }
    }

    /// Rate limiter
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Circuit breakers
    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    /// Provider registry
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Select a channel, admit the caller and deliver, falling back across channels
    pub async fn dispatch(
        &self,
        request: &SignatureRequest,
        identity: &IdentityContext,
        rules: &[RoutingRule],
    ) -> Result<DeliveryReceipt> {
        let mut tracker = DispatchTracker::new();

        let decision = match self.routing.select(&request.context, rules) {
            Ok(decision) => decision,
            Err(e) => {
                tracker.advance(DispatchState::NoRoute)?;
                info!("No route for order {}", request.context.order_id);
                audit::emit(
                    self.audit.as_ref(),
                    AuditEvent::NoRoute {
                        order_id: request.context.order_id.clone(),
                        at: Utc::now(),
                    },
                );
                return Err(e);
            }
        };
        ROUTING_DECISIONS.with_label_values(&[decision.channel.code()]).inc();

        tracker.advance(DispatchState::Admitting)?;
        if let Err(e) = self.admission.admit(&identity.caller_id) {
            tracker.advance(DispatchState::Rejected)?;
            if let Error::AdmissionRejected { scope } = &e {
                audit::emit(
                    self.audit.as_ref(),
                    AuditEvent::AdmissionRejected {
                        caller_id: identity.caller_id.clone(),
                        scope: *scope,
                        at: Utc::now(),
                    },
                );
            }
            return Err(e);
        }

        // one snapshot for the whole dispatch, reloads do not affect it
        let snapshot = self.registry.snapshot();
        let mut challenge = SignatureChallenge::new(decision.channel, &self.challenge_config);
        self.challenges.save(&challenge).await?;

        let mut channel = decision.channel;
        let mut tried: Vec<Channel> = Vec::new();
        let mut failed_channels: Vec<ChannelAttempt> = Vec::new();
        let mut fallbacks: Vec<FallbackEvent> = Vec::new();
        tracker.advance(DispatchState::Sending)?;

        loop {
            tried.push(channel);
            let outcome = self
                .try_channel(&snapshot, channel, &mut challenge, &request.recipient, &mut tracker)
                .await?;

            let failure = match outcome {
                ChannelOutcome::Delivered { provider, response } => {
                    tracker.advance(DispatchState::Succeeded)?;
                    challenge.mark_sent(&provider, &response.provider_message_id)?;
                    self.persist_terminal(&challenge).await;
                    info!(
                        "Challenge {} sent via {} ({}) after {} calls",
                        challenge.id, channel, provider, challenge.attempt_count
                    );
                    audit::emit(
                        self.audit.as_ref(),
                        AuditEvent::DispatchSucceeded {
                            challenge_id: challenge.id,
                            channel,
                            provider: provider.clone(),
                            provider_message_id: response.provider_message_id.clone(),
                            attempts: challenge.attempt_count,
                            at: Utc::now(),
                        },
                    );
                    return Ok(DeliveryReceipt {
                        challenge,
                        decision,
                        provider,
                        provider_message_id: response.provider_message_id,
                        fallbacks,
                        failed_channels,
                        states: tracker.history().to_vec(),
                    });
                }
                ChannelOutcome::Failed(failure) => failure,
            };

            let reason = failure.reason;
            failed_channels.push(failure);
            tracker.advance(DispatchState::FallingBack)?;

            match self.fallback.next(channel, reason, &tried) {
                Some(next) => {
                    let event = FallbackEvent {
                        from: channel,
                        to: next,
                        reason,
                        at: Utc::now(),
                    };
                    warn!("Falling back from {} to {} ({}) for challenge {}", channel, next, reason, challenge.id);
                    FALLBACK_EVENTS
                        .with_label_values(&[channel.code(), next.code(), reason.code()])
                        .inc();
                    audit::emit(
                        self.audit.as_ref(),
                        AuditEvent::FallbackTriggered {
                            challenge_id: challenge.id,
                            from: channel,
                            to: next,
                            reason,
                            at: event.at,
                        },
                    );
                    fallbacks.push(event);
                    challenge.switch_channel(next)?;
                    channel = next;
                    tracker.advance(DispatchState::Sending)?;
                }
                None => {
                    tracker.advance(DispatchState::Exhausted)?;
                    challenge.mark_failed()?;
                    self.persist_terminal(&challenge).await;
                    error!(
                        "Challenge {} exhausted after {} channels",
                        challenge.id,
                        failed_channels.len()
                    );
                    audit::emit(
                        self.audit.as_ref(),
                        AuditEvent::DispatchExhausted {
                            challenge_id: challenge.id,
                            attempts: failed_channels.clone(),
                            at: Utc::now(),
                        },
                    );
                    return Err(Error::FallbackExhausted {
                        attempts: failed_channels,
                    });
                }
            }
        }
    }

    async fn try_channel(
        &self,
        snapshot: &ProviderSnapshot,
        channel: Channel,
        challenge: &mut SignatureChallenge,
        recipient: &str,
        tracker: &mut DispatchTracker,
    ) -> Result<ChannelOutcome> {
        let provider = match snapshot.resolve(channel) {
            Some(provider) => provider,
            None => {
                let detail = if snapshot.is_configured(channel) {
                    "provider disabled"
                } else {
                    "no provider configured"
                };
                return Ok(ChannelOutcome::Failed(ChannelAttempt::new(
                    channel,
                    None,
                    0,
                    FailureReason::ProviderDown,
                    detail,
                )));
            }
        };
        let code = provider.code.as_str();

        let client = match self.registry.client_for(code) {
            Some(client) => client,
            None => {
                return Ok(ChannelOutcome::Failed(ChannelAttempt::new(
                    channel,
                    Some(code),
                    0,
                    FailureReason::ProviderDown,
                    "no client registered",
                )));
            }
        };

        // held across the send; dropping it mid-trial re-opens the breaker
        let permit = match self.breakers.acquire(code) {
            Ok(permit) => permit,
            Err(retry_in) => {
                debug!("Circuit open for {}, retry in {:?}", code, retry_in);
                PROVIDER_CALLS
                    .with_label_values(&[code, channel.code(), "short_circuited"])
                    .inc();
                return Ok(ChannelOutcome::Failed(ChannelAttempt::new(
                    channel,
                    Some(code),
                    0,
                    FailureReason::CircuitOpen,
                    format!("circuit open, retry in {}ms", retry_in.as_millis()),
                )));
            }
        };
        // a trial is a single call
        let max_attempts = if permit.is_trial() { 1 } else { provider.max_attempts() };

        let timeout = provider.timeout();
        let operation = format!("{} send via {}", channel, code);
        let outcome = {
            let tracker = &mut *tracker;
            let client = client.as_ref();
            let sending: &SignatureChallenge = challenge;
            self.retry
                .execute(max_attempts, &operation, move |attempt| {
                    let state = if attempt > 1 { tracker.retry() } else { Ok(()) };
                    async move {
                        state.map_err(|e| ProviderError::Rejected {
                            code: "DISPATCH_STATE".to_string(),
                            message: e.to_string(),
                        })?;
                        timed_send(client, sending, recipient, code, channel, timeout).await
                    }
                })
                .await
        };
        challenge.record_attempts(code, outcome.attempts);

        match outcome.result {
            Ok(response) => {
                permit.record_success();
                Ok(ChannelOutcome::Delivered {
                    provider: code.to_string(),
                    response,
                })
            }
            Err(e) => {
                permit.record_failure();
                let reason = match &e {
                    ProviderError::Timeout { .. } => FailureReason::Timeout,
                    ProviderError::Unavailable(_) => FailureReason::ProviderDown,
                    ProviderError::Transport(_) | ProviderError::Rejected { .. } => FailureReason::Error,
                };
                let unavailable = Error::ProviderUnavailable {
                    provider: code.to_string(),
                    reason,
                };
                warn!("{} after {} attempts on {}: {}", unavailable, outcome.attempts, channel, e);
                Ok(ChannelOutcome::Failed(ChannelAttempt::new(
                    channel,
                    Some(code),
                    outcome.attempts,
                    reason,
                    e.to_string(),
                )))
            }
        }
    }

    async fn persist_terminal(&self, challenge: &SignatureChallenge) {
        // the provider outcome stands even if storage is down
        if let Err(e) = self.challenges.save(challenge).await {
            error!("Failed to persist challenge {} in {}: {}", challenge.id, challenge.status, e);
        }
    }
}

async fn timed_send(
    client: &dyn ProviderClient,
    challenge: &SignatureChallenge,
    recipient: &str,
    code: &str,
    channel: Channel,
    timeout: Duration,
) -> std::result::Result<ProviderResponse, ProviderError> {
    let start = Instant::now();
    let result = match tokio::time::timeout(timeout, client.send(challenge, recipient)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout {
            ms: timeout.as_millis() as u64,
        }),
    };

    PROVIDER_CALL_DURATION
        .with_label_values(&[code, channel.code()])
        .observe(start.elapsed().as_secs_f64());
    let status = match &result {
        Ok(_) => "success",
        Err(ProviderError::Timeout { .. }) => "timeout",
        Err(ProviderError::Rejected { .. }) => "rejected",
        Err(_) => "error",
    };
    PROVIDER_CALLS.with_label_values(&[code, channel.code(), status]).inc();
    result
}
