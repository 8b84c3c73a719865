//! Signature router demo binary
//!
//! Wires the engine to in-memory collaborators and scripted providers, routes
//! a few requests and prints the outcomes. Pass a TOML file to override the
//! defaults; `SIGNATURE_ROUTER_*` variables apply otherwise.

use anyhow::Context;
use rust_decimal::Decimal;
use signature_router::audit::TracingAuditSink;
use signature_router::idempotency::InMemoryIdempotencyStore;
use signature_router::mock::ScriptedProvider;
use signature_router::provider::{ProviderConfig, ProviderError, ProviderRegistry};
use signature_router::repository::{InMemoryChallengeRepository, InMemoryRuleRepository};
use signature_router::{
    ActiveRule, Channel, Collaborators, Config, IdentityContext, Money, SignatureRequest, SignatureRouter,
    TransactionContext,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => Config::from_env().context("reading environment overrides")?,
    };
    tracing::info!("Starting {}", config.service_name);

    // SMS provider is down, voice answers
    let registry = Arc::new(ProviderRegistry::new());
    registry.register_client(
        "sms-primary",
        Arc::new(ScriptedProvider::failing(
            Channel::Sms,
            "sms-primary",
            ProviderError::Unavailable("gateway returned 503".to_string()),
        )),
    );
    registry.register_client("voice-primary", Arc::new(ScriptedProvider::succeeding(Channel::Voice, "voice-primary")));
    registry.register_client("push-primary", Arc::new(ScriptedProvider::succeeding(Channel::Push, "push-primary")));
    registry.apply_snapshot(vec![
        ProviderConfig::new(Channel::Sms, "sms-primary"),
        ProviderConfig::new(Channel::Voice, "voice-primary"),
        ProviderConfig::new(Channel::Push, "push-primary"),
    ])?;

    let rules = InMemoryRuleRepository::new(vec![
        ActiveRule::new("large amounts", "amount.value > 1000", Channel::Voice, 10, "bootstrap").into(),
        ActiveRule::new("default", "true", Channel::Sms, 100, "bootstrap").into(),
    ]);

    let router = SignatureRouter::new(
        config.clone(),
        Collaborators {
            rules: Arc::new(rules),
            providers: registry,
            challenges: Arc::new(InMemoryChallengeRepository::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::from_config(&config.idempotency)),
            audit: Arc::new(TracingAuditSink),
        },
    );
    let tasks = router.start_background_tasks();

    let identity = IdentityContext::new("demo-caller", vec!["signer".to_string()]);
    let requests = [
        ("order-1", Decimal::new(4_999, 2)),
        ("order-2", Decimal::new(1_500, 0)),
    ];

    for (order_id, amount) in requests {
        let request = SignatureRequest::new(
            TransactionContext::new(Money::new(amount, "EUR"), "merchant-1", order_id),
            "+34600000000",
        );
        let key = format!("demo-{}", order_id);

        let first = router.route_and_dispatch(&request, &identity, &key).await;
        tracing::info!("{} -> {} {}", order_id, first.status_code, first.body);

        let replay = router.route_and_dispatch(&request, &identity, &key).await;
        tracing::info!("{} replayed={} identical={}", order_id, replay.replayed, replay.body == first.body);
    }

    for report in router.provider_health().await {
        tracing::info!("{}", serde_json::to_string(&report)?);
    }
    println!("{}", signature_router::metrics::gather_text());

    for task in tasks {
        task.abort();
    }
    tracing::info!("Shutting down {}", config.service_name);
    Ok(())
}
