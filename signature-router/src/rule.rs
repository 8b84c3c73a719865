//! Routing rule aggregate
//!
//! A rule is either [`ActiveRule`] or [`DeletedRule`]. Only active rules carry
//! mutators; soft deletion consumes the active rule, so a deleted rule cannot be
//! updated or re-enabled through its own type. [`RoutingRule`] wraps both for
//! storage and exposes fallible mutators for callers holding the enum.

use crate::{types::Channel, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Rule identifier (UUIDv7, ordered by creation time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(Uuid);

impl RuleId {
    /// Generate a new time-ordered id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who touched a rule, and when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleAudit {
    /// Creator
    pub created_by: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modifier
    pub modified_by: Option<String>,
    /// Last modification time
    pub modified_at: Option<DateTime<Utc>>,
}

/// Field changes for [`ActiveRule::update`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleChanges {
    /// New name
    pub name: Option<String>,
    /// New condition expression
    pub condition: Option<String>,
    /// New target channel
    pub channel: Option<Channel>,
    /// New priority
    pub priority: Option<i32>,
}

/// Rule that can be evaluated (when enabled) and mutated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRule {
    /// Identity
    pub id: RuleId,
    /// Display name
    pub name: String,
    /// Boolean expression over the transaction context
    pub condition: String,
    /// Channel selected when the condition matches
    pub channel: Channel,
    /// Lower evaluates first
    pub priority: i32,
    /// Disabled rules are skipped
    pub enabled: bool,
    /// Audit stamps
    pub audit: RuleAudit,
}

impl ActiveRule {
    /// Create a new enabled rule
    pub fn new(
        name: impl Into<String>,
        condition: impl Into<String>,
        channel: Channel,
        priority: i32,
        created_by: impl Into<String>,
    ) -> Self {
        Self::with_id(RuleId::new(), name, condition, channel, priority, created_by)
    }

    /// Create a new enabled rule with a known id
    pub fn with_id(
        id: RuleId,
        name: impl Into<String>,
        condition: impl Into<String>,
        channel: Channel,
        priority: i32,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            condition: condition.into(),
            channel,
            priority,
            enabled: true,
            audit: RuleAudit {
                created_by: created_by.into(),
                created_at: Utc::now(),
                modified_by: None,
                modified_at: None,
            },
        }
    }

    /// Apply field changes
    pub fn update(&mut self, changes: RuleChanges, actor: &str) {
        if let Some(name) = changes.name {
            self.name = name;
        }
        if let Some(condition) = changes.condition {
            self.condition = condition;
        }
        if let Some(channel) = changes.channel {
            self.channel = channel;
        }
        if let Some(priority) = changes.priority {
            self.priority = priority;
        }
        self.touch(actor);
    }

    /// Enable the rule
    pub fn enable(&mut self, actor: &str) {
        self.enabled = true;
        self.touch(actor);
    }

    /// Disable the rule
    pub fn disable(&mut self, actor: &str) {
        self.enabled = false;
        self.touch(actor);
    }

    /// Soft-delete the rule
    pub fn mark_as_deleted(self, actor: &str) -> DeletedRule {
        DeletedRule {
            id: self.id,
            name: self.name,
            condition: self.condition,
            channel: self.channel,
            priority: self.priority,
            audit: self.audit,
            deleted_by: actor.to_string(),
            deleted_at: Utc::now(),
        }
    }

    fn touch(&mut self, actor: &str) {
        self.audit.modified_by = Some(actor.to_string());
        self.audit.modified_at = Some(Utc::now());
    }
}

/// Soft-deleted rule, kept for audit only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRule {
    /// Identity
    pub id: RuleId,
    /// Display name
    pub name: String,
    /// Condition at deletion time
    pub condition: String,
    /// Channel at deletion time
    pub channel: Channel,
    /// Priority at deletion time
    pub priority: i32,
    /// Audit stamps prior to deletion
    pub audit: RuleAudit,
    /// Deleter
    pub deleted_by: String,
    /// Deletion time
    pub deleted_at: DateTime<Utc>,
}

/// Stored routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "lifecycle", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingRule {
    /// Live rule
    Active(ActiveRule),
    /// Soft-deleted rule
    Deleted(DeletedRule),
}

impl RoutingRule {
    /// Rule id
    pub fn id(&self) -> RuleId {
        match self {
            RoutingRule::Active(rule) => rule.id,
            RoutingRule::Deleted(rule) => rule.id,
        }
    }

    /// Rule priority
    pub fn priority(&self) -> i32 {
        match self {
            RoutingRule::Active(rule) => rule.priority,
            RoutingRule::Deleted(rule) => rule.priority,
        }
    }

    /// Deleted rules always report disabled
    pub fn is_enabled(&self) -> bool {
        matches!(self, RoutingRule::Active(rule) if rule.enabled)
    }

    /// Whether the rule is soft-deleted
    pub fn is_deleted(&self) -> bool {
        matches!(self, RoutingRule::Deleted(_))
    }

    /// Active and enabled view of the rule, if any
    pub fn as_selectable(&self) -> Option<&ActiveRule> {
        match self {
            RoutingRule::Active(rule) if rule.enabled => Some(rule),
            _ => None,
        }
    }

    /// Apply field changes
    pub fn update(&mut self, changes: RuleChanges, actor: &str) -> Result<()> {
        self.active_mut()?.update(changes, actor);
        Ok(())
    }

    /// Enable the rule, fails for deleted rules
    pub fn enable(&mut self, actor: &str) -> Result<()> {
        self.active_mut()?.enable(actor);
        Ok(())
    }

    /// Disable the rule
    pub fn disable(&mut self, actor: &str) -> Result<()> {
        self.active_mut()?.disable(actor);
        Ok(())
    }

    /// Soft-delete the rule
    pub fn mark_as_deleted(&mut self, actor: &str) -> Result<()> {
        let active = self.active_mut()?.clone();
        *self = RoutingRule::Deleted(active.mark_as_deleted(actor));
        Ok(())
    }

    fn active_mut(&mut self) -> Result<&mut ActiveRule> {
        match self {
            RoutingRule::Active(rule) => Ok(rule),
            RoutingRule::Deleted(rule) => Err(Error::RuleDeleted(rule.id.to_string())),
        }
    }
}

impl From<ActiveRule> for RoutingRule {
    fn from(rule: ActiveRule) -> Self {
        RoutingRule::Active(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> ActiveRule {
        ActiveRule::new("high value", "amount > 1000", Channel::Voice, 1, "admin")
    }

    #[test]
    fn test_update_stamps_modifier() {
        let mut rule = rule();
        rule.update(
            RuleChanges {
                priority: Some(5),
                ..Default::default()
            },
            "ops",
        );
        assert_eq!(rule.priority, 5);
        assert_eq!(rule.audit.modified_by.as_deref(), Some("ops"));
        assert!(rule.audit.modified_at.is_some());
    }

    #[test]
    fn test_deleted_rule_is_disabled() {
        let mut stored = RoutingRule::from(rule());
        assert!(stored.is_enabled());

        stored.mark_as_deleted("admin").unwrap();
        assert!(stored.is_deleted());
        assert!(!stored.is_enabled());
        assert!(stored.as_selectable().is_none());
    }

    #[test]
    fn test_enabling_deleted_rule_fails() {
        let mut stored = RoutingRule::from(rule());
        stored.mark_as_deleted("admin").unwrap();

        assert!(matches!(stored.enable("admin"), Err(Error::RuleDeleted(_))));
        assert!(stored.update(RuleChanges::default(), "admin").is_err());
        assert!(stored.mark_as_deleted("admin").is_err());
    }

    #[test]
    fn test_deleted_rule_keeps_deleter() {
        let deleted = rule().mark_as_deleted("auditor");
        assert_eq!(deleted.deleted_by, "auditor");
        assert_eq!(deleted.channel, Channel::Voice);
    }

    #[test]
    fn test_rule_ids_order_by_creation() {
        let first = RuleId::from_uuid(Uuid::from_u128(1));
        let second = RuleId::from_uuid(Uuid::from_u128(2));
        assert!(first < second);
    }

    #[test]
    fn test_disabled_rule_not_selectable() {
        let mut stored = RoutingRule::from(rule());
        stored.disable("ops").unwrap();
        assert!(stored.as_selectable().is_none());
        stored.enable("ops").unwrap();
        assert!(stored.as_selectable().is_some());
    }
}
