//! Shared types for routing and dispatch

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Delivery channel for a signature challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    /// Text message
    Sms,
    /// Push notification to a registered device
    Push,
    /// Voice call reading out the code
    Voice,
    /// Biometric prompt on a registered device
    Biometric,
}

impl Channel {
    /// All channels, in declaration order
    pub const ALL: [Channel; 4] = [Channel::Sms, Channel::Push, Channel::Voice, Channel::Biometric];

    /// Wire name
    pub fn code(&self) -> &'static str {
        match self {
            Channel::Sms => "SMS",
            Channel::Push => "PUSH",
            Channel::Voice => "VOICE",
            Channel::Biometric => "BIOMETRIC",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for Channel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SMS" => Ok(Channel::Sms),
            "PUSH" => Ok(Channel::Push),
            "VOICE" => Ok(Channel::Voice),
            "BIOMETRIC" => Ok(Channel::Biometric),
            other => Err(crate::Error::Config(format!("unknown channel: {}", other))),
        }
    }
}

/// Monetary amount (exact decimal + ISO 4217 code)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// Amount
    pub value: Decimal,
    /// Currency code
    pub currency: String,
}

impl Money {
    /// Create new amount
    pub fn new(value: Decimal, currency: impl Into<String>) -> Self {
        Self {
            value,
            currency: currency.into(),
        }
    }
}

/// Transaction being signed, as seen by rule conditions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionContext {
    /// Transaction amount
    pub amount: Money,
    /// Merchant identifier
    pub merchant_id: String,
    /// Order identifier
    pub order_id: String,
    /// Free-text description
    pub description: Option<String>,
}

impl TransactionContext {
    /// Create a context without description
    pub fn new(amount: Money, merchant_id: impl Into<String>, order_id: impl Into<String>) -> Self {
        Self {
            amount,
            merchant_id: merchant_id.into(),
            order_id: order_id.into(),
            description: None,
        }
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Inbound request to route a challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRequest {
    /// Transaction to sign
    pub context: TransactionContext,
    /// Where the challenge goes (phone number, device token, customer id)
    pub recipient: String,
}

impl SignatureRequest {
    /// Create new request
    pub fn new(context: TransactionContext, recipient: impl Into<String>) -> Self {
        Self {
            context,
            recipient: recipient.into(),
        }
    }
}

/// Already-authenticated caller identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityContext {
    /// Caller identifier, keys the per-caller rate limiter
    pub caller_id: String,
    /// Roles granted upstream
    pub roles: Vec<String>,
}

impl IdentityContext {
    /// Create identity
    pub fn new(caller_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            roles,
        }
    }

    /// Check role membership
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}
