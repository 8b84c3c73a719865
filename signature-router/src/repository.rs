//! Storage collaborators and in-memory implementations

use crate::challenge::SignatureChallenge;
use crate::provider::ProviderConfig;
use crate::rule::RoutingRule;
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

/// Rule storage
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Non-deleted rules, ascending priority then id
    async fn list_active_ordered_by_priority(&self) -> Result<Vec<RoutingRule>>;
}

/// Challenge storage
#[async_trait]
pub trait ChallengeRepository: Send + Sync {
    /// Insert or replace
    async fn save(&self, challenge: &SignatureChallenge) -> Result<()>;

    /// Load by id
    async fn find(&self, id: Uuid) -> Result<Option<SignatureChallenge>>;
}

/// Provider configuration storage
#[async_trait]
pub trait ProviderConfigSource: Send + Sync {
    /// Every provider, enabled or not
    async fn load_providers(&self) -> Result<Vec<ProviderConfig>>;
}

/// Rules held in memory
#[derive(Default)]
pub struct InMemoryRuleRepository {
    rules: RwLock<Vec<RoutingRule>>,
}

impl InMemoryRuleRepository {
    /// Repository seeded with rules
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Insert or replace by id
    pub fn upsert(&self, rule: RoutingRule) {
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|r| r.id() == rule.id()) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
    }
}

#[async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn list_active_ordered_by_priority(&self) -> Result<Vec<RoutingRule>> {
        let mut rules: Vec<RoutingRule> = self
            .rules
            .read()
            .iter()
            .filter(|r| !r.is_deleted())
            .cloned()
            .collect();
        rules.sort_by_key(|r| (r.priority(), r.id()));
        Ok(rules)
    }
}

/// Challenges held in memory
#[derive(Default)]
pub struct InMemoryChallengeRepository {
    challenges: DashMap<Uuid, SignatureChallenge>,
}

impl InMemoryChallengeRepository {
    /// Empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored challenge count
    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }
}

#[async_trait]
impl ChallengeRepository for InMemoryChallengeRepository {
    async fn save(&self, challenge: &SignatureChallenge) -> Result<()> {
        self.challenges.insert(challenge.id, challenge.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<SignatureChallenge>> {
        Ok(self.challenges.get(&id).map(|c| c.value().clone()))
    }
}

/// Fixed provider list
#[derive(Default)]
pub struct StaticProviderSource {
    providers: RwLock<Vec<ProviderConfig>>,
}

impl StaticProviderSource {
    /// Source returning `providers`
    pub fn new(providers: Vec<ProviderConfig>) -> Self {
        Self {
            providers: RwLock::new(providers),
        }
    }

    /// Replace the list returned by the next load
    pub fn replace(&self, providers: Vec<ProviderConfig>) {
        *self.providers.write() = providers;
    }
}

#[async_trait]
impl ProviderConfigSource for StaticProviderSource {
    async fn load_providers(&self) -> Result<Vec<ProviderConfig>> {
        Ok(self.providers.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{ActiveRule, RuleId};
    use crate::types::Channel;

    fn rule(id: u128, priority: i32) -> RoutingRule {
        ActiveRule::with_id(
            RuleId::from_uuid(Uuid::from_u128(id)),
            "r",
            "true",
            Channel::Sms,
            priority,
            "admin",
        )
        .into()
    }

    #[tokio::test]
    async fn test_rules_ordered_without_deleted() {
        let mut deleted = rule(4, 0);
        deleted.mark_as_deleted("admin").unwrap();
        let repo = InMemoryRuleRepository::new(vec![rule(3, 5), rule(1, 5), deleted, rule(2, 1)]);

        let ids: Vec<u128> = repo
            .list_active_ordered_by_priority()
            .await
            .unwrap()
            .iter()
            .map(|r| r.id().as_uuid().as_u128())
            .collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let repo = InMemoryRuleRepository::default();
        repo.upsert(rule(1, 5));
        repo.upsert(rule(1, 7));
        let rules = repo.list_active_ordered_by_priority().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].priority(), 7);
    }

    #[tokio::test]
    async fn test_provider_source_replace() {
        let source = StaticProviderSource::new(vec![ProviderConfig::new(Channel::Sms, "a")]);
        source.replace(vec![]);
        assert!(source.load_providers().await.unwrap().is_empty());
    }
}
