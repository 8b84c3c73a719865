//! Signature Router
//!
//! Routes signature challenges to a delivery channel (SMS, push, voice,
//! biometric) chosen by per-transaction rules, and delivers them through
//! provider clients guarded by rate limits, circuit breakers, retries and an
//! ordered channel fallback.
//!
//! # Architecture
//!
//! - **Routing**: rules evaluated by ascending priority, ties broken by id
//! - **Admission**: global and per-caller token buckets, never blocking
//! - **Dispatch**: admission → circuit breaker → retry → timeout → provider
//! - **Fallback**: failed channels hand over to the next channel in the chain
//! - **Idempotency**: one effective execution per key, responses replayed
//!
//! # Invariants
//!
//! - A deleted rule is never evaluated
//! - An open breaker never lets a call through before its cool-down
//! - A rate limiter never holds more permits than its capacity
//! - Nothing runs after a dispatch reaches a terminal state

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod admission;
pub mod audit;
pub mod challenge;
pub mod circuit_breaker;
pub mod condition;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod idempotency;
pub mod metrics;
pub mod mock;
pub mod provider;
pub mod repository;
pub mod retry;
pub mod routing;
pub mod rule;
pub mod types;

// Re-exports
pub use config::Config;
pub use engine::{Collaborators, ResponseBody, RouterResponse, SignatureRouter};
pub use error::{Error, Result};
pub use rule::{ActiveRule, DeletedRule, RoutingRule, RuleId};
pub use types::{Channel, IdentityContext, Money, SignatureRequest, TransactionContext};
