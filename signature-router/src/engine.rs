//! Signature router entry point
//!
//! [`SignatureRouter::route_and_dispatch`] never returns a raw error: every
//! outcome is a status code plus a JSON body. Successful responses are cached
//! under the caller's idempotency key and replayed byte for byte.

use crate::admission::AdmissionScope;
use crate::audit::{self, AuditEvent, AuditSink};
use crate::challenge::{ChallengeStatus, VerificationResult};
use crate::circuit_breaker::{CircuitSnapshot, CircuitState};
use crate::condition::{ConditionEvaluator, ExpressionEvaluator};
use crate::config::Config;
use crate::dispatch::{ChannelAttempt, DeliveryReceipt, DispatchOrchestrator};
use crate::fallback::FallbackEvent;
use crate::idempotency::{
    request_fingerprint, start_purge_task, ClaimOutcome, ClaimToken, IdempotencyRecord, IdempotencyStore,
};
use crate::metrics::{DISPATCH_OUTCOMES, IDEMPOTENCY_EVENTS};
use crate::provider::{ProviderHealth, ProviderRegistry};
use crate::repository::{ChallengeRepository, ProviderConfigSource, RuleRepository};
use crate::types::{Channel, IdentityContext, SignatureRequest};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Response body, tagged by outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseBody {
    /// Challenge delivered
    #[serde(rename_all = "camelCase")]
    Sent {
        /// Challenge id
        challenge_id: Uuid,
        /// Delivering channel
        channel: Channel,
        /// Delivering provider
        provider: String,
        /// Provider message id
        provider_message_id: String,
        /// Challenge status
        status: ChallengeStatus,
        /// Challenge expiry
        expires_at: DateTime<Utc>,
        /// Channel hops before delivery
        fallbacks: Vec<FallbackEvent>,
    },
    /// Rate limited
    Throttled {
        /// Limiter
        scope: AdmissionScope,
    },
    /// No rule matched
    NoRoute,
    /// Every channel failed
    Exhausted {
        /// Channels tried
        attempts: Vec<ChannelAttempt>,
    },
    /// Missing idempotency key
    MissingIdempotencyKey,
    /// Key reused with another payload
    IdempotencyKeyReused,
    /// Key held by a request still running
    RequestInProgress,
    /// Unexpected failure
    InternalError {
        /// Error message
        message: String,
    },
}

impl ResponseBody {
    /// HTTP-style status code
    pub fn status_code(&self) -> u16 {
        match self {
            ResponseBody::Sent { .. } => 201,
            ResponseBody::Throttled { .. } => 429,
            ResponseBody::NoRoute | ResponseBody::IdempotencyKeyReused => 422,
            ResponseBody::Exhausted { .. } => 503,
            ResponseBody::MissingIdempotencyKey => 400,
            ResponseBody::RequestInProgress => 409,
            ResponseBody::InternalError { .. } => 500,
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            ResponseBody::Sent { .. } => "sent",
            ResponseBody::Throttled { .. } => "throttled",
            ResponseBody::NoRoute => "no_route",
            ResponseBody::Exhausted { .. } => "exhausted",
            ResponseBody::MissingIdempotencyKey => "missing_key",
            ResponseBody::IdempotencyKeyReused => "key_reused",
            ResponseBody::RequestInProgress => "in_progress",
            ResponseBody::InternalError { .. } => "internal_error",
        }
    }

    fn sent(receipt: &DeliveryReceipt) -> Self {
        ResponseBody::Sent {
            challenge_id: receipt.challenge.id,
            channel: receipt.challenge.channel,
            provider: receipt.provider.clone(),
            provider_message_id: receipt.provider_message_id.clone(),
            status: receipt.challenge.status,
            expires_at: receipt.challenge.expires_at,
            fallbacks: receipt.fallbacks.clone(),
        }
    }
}

/// Result handed back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterResponse {
    /// Status code
    pub status_code: u16,
    /// JSON body
    pub body: String,
    /// Served from the idempotency store
    pub replayed: bool,
}

impl RouterResponse {
    fn from_body(body: &ResponseBody) -> Self {
        match serde_json::to_string(body) {
            Ok(json) => Self {
                status_code: body.status_code(),
                body: json,
                replayed: false,
            },
            Err(e) => {
                error!("Failed to serialize response: {}", e);
                Self {
                    status_code: 500,
                    body: r#"{"outcome":"INTERNAL_ERROR","message":"response serialization failed"}"#.to_string(),
                    replayed: false,
                }
            }
        }
    }

    fn replay(record: IdempotencyRecord) -> Self {
        Self {
            status_code: record.status_code,
            body: record.body,
            replayed: true,
        }
    }

    /// Whether the status is in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Parse the body back into a typed outcome
    pub fn outcome(&self) -> Result<ResponseBody> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Health of one configured provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealthReport {
    /// Provider code
    pub code: String,
    /// Channel served
    pub channel: Channel,
    /// Enabled in the current snapshot
    pub enabled: bool,
    /// Client health check
    pub health: ProviderHealth,
    /// Breaker state
    pub circuit: CircuitState,
    /// Breaker window, if the provider was ever called
    pub window: Option<CircuitSnapshot>,
}

/// External collaborators
pub struct Collaborators {
    /// Rule storage
    pub rules: Arc<dyn RuleRepository>,
    /// Provider snapshot and clients
    pub providers: Arc<ProviderRegistry>,
    /// Challenge storage
    pub challenges: Arc<dyn ChallengeRepository>,
    /// Idempotency storage
    pub idempotency: Arc<dyn IdempotencyStore>,
    /// Audit sink
    pub audit: Arc<dyn AuditSink>,
}

/// Routing and delivery engine
pub struct SignatureRouter {
    config: Config,
    rules: Arc<dyn RuleRepository>,
    challenges: Arc<dyn ChallengeRepository>,
    idempotency: Arc<dyn IdempotencyStore>,
    audit: Arc<dyn AuditSink>,
    orchestrator: DispatchOrchestrator,
}

impl SignatureRouter {
    /// Create router with the default condition evaluator
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        Self::with_evaluator(config, collaborators, Arc::new(ExpressionEvaluator::new()))
    }

    /// Create router with a custom condition evaluator
    pub fn with_evaluator(
        config: Config,
        collaborators: Collaborators,
        evaluator: Arc<dyn ConditionEvaluator>,
    ) -> Self {
        let orchestrator = DispatchOrchestrator::new(
            &config,
            evaluator,
            collaborators.providers,
            collaborators.challenges.clone(),
            collaborators.audit.clone(),
        );
        Self {
            config,
            rules: collaborators.rules,
            challenges: collaborators.challenges,
            idempotency: collaborators.idempotency,
            audit: collaborators.audit,
            orchestrator,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Underlying orchestrator
    pub fn orchestrator(&self) -> &DispatchOrchestrator {
        &self.orchestrator
    }

    /// Route the request to a channel and deliver a challenge, at most once per key
    pub async fn route_and_dispatch(
        &self,
        request: &SignatureRequest,
        identity: &IdentityContext,
        idempotency_key: &str,
    ) -> RouterResponse {
        let key = idempotency_key.trim();
        if key.is_empty() {
            return self.respond(ResponseBody::MissingIdempotencyKey);
        }

        let fingerprint = match request_fingerprint(request) {
            Ok(fingerprint) => fingerprint,
            Err(e) => return self.internal_error(e),
        };

        match self.idempotency.lookup(key).await {
            Ok(Some(record)) => return self.replay(record, &fingerprint),
            Ok(None) => {}
            Err(e) => return self.internal_error(e),
        }

        let token = match self.idempotency.claim(key, &fingerprint).await {
            Ok(ClaimOutcome::Acquired(token)) => token,
            Ok(ClaimOutcome::Completed(record)) => return self.replay(record, &fingerprint),
            Ok(ClaimOutcome::InFlight) => {
                IDEMPOTENCY_EVENTS.with_label_values(&["in_flight"]).inc();
                warn!("Idempotency key {} already in flight", key);
                return self.respond(ResponseBody::RequestInProgress);
            }
            Err(e) => return self.internal_error(e),
        };

        let response = self.execute_holding_claim(request, identity, key, &token).await;

        if !response.is_success() {
            if let Err(e) = self.idempotency.release(key, &token).await {
                warn!("Failed to release idempotency key {}: {}", key, e);
            }
            return response;
        }

        let record = IdempotencyRecord::new(
            key,
            fingerprint,
            response.status_code,
            response.body.clone(),
            self.config.idempotency_retention(),
        );
        match self.idempotency.store(record, &token).await {
            Ok(winner) if winner.body != response.body => {
                warn!("Idempotency key {} was completed concurrently, returning stored response", key);
                RouterResponse::replay(winner)
            }
            Ok(_) => response,
            Err(e) => {
                error!("Failed to store idempotency record {}: {}", key, e);
                if let Err(e) = self.idempotency.release(key, &token).await {
                    warn!("Failed to release idempotency key {}: {}", key, e);
                }
                response
            }
        }
    }

    /// Run the dispatch while refreshing the claim on `key`
    async fn execute_holding_claim(
        &self,
        request: &SignatureRequest,
        identity: &IdentityContext,
        key: &str,
        token: &ClaimToken,
    ) -> RouterResponse {
        let every = self.config.idempotency.claim_refresh_interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let execution = self.execute(request, identity);
        tokio::pin!(execution);
        loop {
            tokio::select! {
                response = &mut execution => return response,
                _ = heartbeat.tick() => match self.idempotency.refresh(key, token).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Idempotency key {} no longer held by claim {}", key, token),
                    Err(e) => warn!("Failed to refresh idempotency key {}: {}", key, e),
                },
            }
        }
    }

    async fn execute(&self, request: &SignatureRequest, identity: &IdentityContext) -> RouterResponse {
        let rules = match self.rules.list_active_ordered_by_priority().await {
            Ok(rules) => rules,
            Err(e) => return self.internal_error(e),
        };

        match self.orchestrator.dispatch(request, identity, &rules).await {
            Ok(receipt) => self.respond(ResponseBody::sent(&receipt)),
            Err(Error::NoMatchingRule) => self.respond(ResponseBody::NoRoute),
            Err(Error::AdmissionRejected { scope }) => self.respond(ResponseBody::Throttled { scope }),
            Err(Error::FallbackExhausted { attempts }) => self.respond(ResponseBody::Exhausted { attempts }),
            Err(e) => self.internal_error(e),
        }
    }

    fn replay(&self, record: IdempotencyRecord, fingerprint: &str) -> RouterResponse {
        if record.request_fingerprint != fingerprint {
            IDEMPOTENCY_EVENTS.with_label_values(&["key_reused"]).inc();
            warn!("Idempotency key {} reused with a different payload", record.key);
            return self.respond(ResponseBody::IdempotencyKeyReused);
        }

        IDEMPOTENCY_EVENTS.with_label_values(&["replayed"]).inc();
        info!("Replaying response for idempotency key {}", record.key);
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::IdempotentReplay {
                idempotency_key: record.key.clone(),
                status_code: record.status_code,
                at: Utc::now(),
            },
        );
        RouterResponse::replay(record)
    }

    fn respond(&self, body: ResponseBody) -> RouterResponse {
        DISPATCH_OUTCOMES.with_label_values(&[body.metric_label()]).inc();
        RouterResponse::from_body(&body)
    }

    fn internal_error(&self, e: Error) -> RouterResponse {
        error!("Routing failed: {}", e);
        self.respond(ResponseBody::InternalError { message: e.to_string() })
    }

    /// Verify a code submitted for a delivered challenge
    pub async fn verify_challenge(&self, challenge_id: Uuid, code: &str) -> Result<VerificationResult> {
        let mut challenge = self
            .challenges
            .find(challenge_id)
            .await?
            .ok_or_else(|| Error::Storage(format!("challenge {} not found", challenge_id)))?;
        let result = challenge.verify(code, Utc::now())?;
        if result != VerificationResult::Mismatch {
            self.challenges.save(&challenge).await?;
        }
        Ok(result)
    }

    /// Probe every configured provider and attach its breaker state
    pub async fn provider_health(&self) -> Vec<ProviderHealthReport> {
        let registry = self.orchestrator.registry();
        let breakers = self.orchestrator.breakers();
        let snapshot = registry.snapshot();

        let mut reports = Vec::with_capacity(snapshot.providers.len());
        for provider in &snapshot.providers {
            let health = match registry.client_for(&provider.code) {
                Some(client) => client.health_check().await,
                None => ProviderHealth::Down {
                    reason: "no client registered".to_string(),
                },
            };
            reports.push(ProviderHealthReport {
                code: provider.code.clone(),
                channel: provider.provider_type,
                enabled: provider.enabled,
                health,
                circuit: breakers.state(&provider.code),
                window: breakers.snapshot(&provider.code),
            });
        }
        reports
    }

    /// Reload providers from the source and swap the snapshot
    pub async fn reload_providers(&self, source: &dyn ProviderConfigSource) -> Result<u64> {
        self.orchestrator.registry().reload(source).await
    }

    /// Start idle caller eviction and idempotency purge
    pub fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.orchestrator.admission().clone().start_cleanup_task(),
            start_purge_task(
                self.idempotency.clone(),
                Duration::from_secs(self.config.idempotency.purge_interval_secs),
            ),
        ]
    }
}
