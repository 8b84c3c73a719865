//! Rule-based channel selection

use crate::condition::ConditionEvaluator;
use crate::metrics::RULE_EVALUATION_ERRORS;
use crate::rule::{ActiveRule, RoutingRule, RuleId};
use crate::types::{Channel, TransactionContext};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of rule selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Matched rule
    pub rule_id: RuleId,
    /// Matched rule name
    pub rule_name: String,
    /// Channel the rule routes to
    pub channel: Channel,
}

/// Selects a channel by evaluating rules in priority order
pub struct RoutingEngine {
    evaluator: Arc<dyn ConditionEvaluator>,
}

impl RoutingEngine {
    /// Create engine
    pub fn new(evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        Self { evaluator }
    }

    /// Select the first enabled, non-deleted rule whose condition holds.
    ///
    /// Rules are ordered by ascending priority, ties broken by ascending id.
    /// The caller's slice order is irrelevant. A rule whose condition fails to
    /// evaluate is logged and treated as a non-match.
    pub fn select(&self, context: &TransactionContext, rules: &[RoutingRule]) -> Result<RoutingDecision> {
        let mut candidates: Vec<&ActiveRule> = rules.iter().filter_map(RoutingRule::as_selectable).collect();
        candidates.sort_by_key(|rule| (rule.priority, rule.id));

        for rule in candidates {
            match self.evaluator.evaluate(&rule.condition, context) {
                Ok(true) => {
                    debug!("Rule {} ({}) matched, channel {}", rule.id, rule.name, rule.channel);
                    return Ok(RoutingDecision {
                        rule_id: rule.id,
                        rule_name: rule.name.clone(),
                        channel: rule.channel,
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    let error = Error::from(e);
                    warn!("Rule {} ({}) skipped, condition `{}`: {}", rule.id, rule.name, rule.condition, error);
                    RULE_EVALUATION_ERRORS.with_label_values(&[rule.channel.code()]).inc();
                }
            }
        }

        Err(Error::NoMatchingRule)
    }
}
