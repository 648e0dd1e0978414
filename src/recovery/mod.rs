//! Error recovery: pattern analysis, rules, AI fallback and learning
//!
//! The executor consults [`RecoveryManager`] when a node fails. The
//! analyzer decides whether the failure pattern warrants intervention;
//! if so, the rules engine (priority order, first match) or the optional
//! AI backend produces a [`Solution`]. The executor applies its actions
//! and retries the node exactly once, then reports the outcome back so
//! the learning engine can update rule metrics and promote consistently
//! successful AI solutions into rules.
//!
//! Recovery mutates execution-scoped settings and browser state only;
//! queue rows stay under the executor's control.

mod actions;
mod analyzer;
mod ai;
mod learning;
mod rules;

pub use actions::apply_actions;
pub use ai::{HttpSolutionProvider, ProposedSolution, SolutionProvider};
pub use analyzer::{OutcomeSample, PatternAnalyzer, is_critical};
pub use learning::{LearningEngine, fingerprint};
pub use rules::{
    Action, Condition, ConditionField, ConditionOperator, DynamicVariable, FailureContext,
    RecoveryRule, ResolvedAction, RuleContext, glob_matches, resolve_action,
    substitute_parameters,
};

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::storage::RulesRepo;

/// What to apply before the single retry, and where it came from
#[derive(Debug, Clone)]
pub struct Solution {
    pub actions: Vec<ResolvedAction>,
    pub attribution: SolutionAttribution,
}

#[derive(Debug, Clone)]
pub enum SolutionAttribution {
    Rule {
        rule_id: String,
        name: String,
        confidence: f64,
    },
    Ai {
        solution_fingerprint: String,
        reasoning: String,
        confidence: f64,
        /// Declared form, kept for promotion into a learned rule
        declared_actions: Vec<Action>,
    },
}

impl Solution {
    /// One-line attribution for logs and `error_message` fields
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.attribution {
            SolutionAttribution::Rule { name, confidence, .. } => {
                format!("recovery rule '{name}' (confidence {confidence:.2})")
            }
            SolutionAttribution::Ai { reasoning, confidence, .. } => {
                format!("AI solution (confidence {confidence:.2}): {reasoning}")
            }
        }
    }
}

pub struct RecoveryManager {
    analyzer: PatternAnalyzer,
    /// Priority-sorted; read per attempt, replaced briefly on updates
    rules: RwLock<Vec<RecoveryRule>>,
    repo: RulesRepo,
    provider: Option<Arc<dyn SolutionProvider>>,
    learning: LearningEngine,
    enabled: bool,
}

impl RecoveryManager {
    pub async fn new(
        repo: RulesRepo,
        provider: Option<Arc<dyn SolutionProvider>>,
        enabled: bool,
    ) -> Result<Arc<Self>> {
        let mut loaded = repo.list_rules().await?;
        loaded.sort_by(|a, b| b.priority.cmp(&a.priority));
        info!("Recovery manager loaded {} rules", loaded.len());

        let mut learning = LearningEngine::new(repo.clone());
        learning.load_thresholds().await;

        Ok(Arc::new(Self {
            analyzer: PatternAnalyzer::new(),
            rules: RwLock::new(loaded),
            repo,
            provider,
            learning,
            enabled,
        }))
    }

    /// Feed one request outcome into the pattern window
    pub fn observe(&self, execution_id: &str, sample: OutcomeSample) {
        self.analyzer.record(execution_id, sample);
    }

    /// Drop analyzer state when an execution ends
    pub fn forget_execution(&self, execution_id: &str) {
        self.analyzer.forget(execution_id);
    }

    /// Install a new rule (operator CRUD surface)
    pub async fn add_rule(&self, rule: RecoveryRule) -> Result<()> {
        self.repo.create(&rule).await?;
        let mut rules = self.rules.write().await;
        rules.push(rule);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(())
    }

    pub async fn delete_rule(&self, rule_id: &str) -> Result<bool> {
        let deleted = self.repo.delete(rule_id).await?;
        if deleted {
            self.rules.write().await.retain(|r| r.id != rule_id);
        }
        Ok(deleted)
    }

    pub async fn list_rules(&self) -> Vec<RecoveryRule> {
        self.rules.read().await.clone()
    }

    /// Decide whether and how to intervene for a failure.
    ///
    /// `None` means the failure propagates to the ordinary retry policy.
    pub async fn propose(&self, ctx: &FailureContext) -> Option<Solution> {
        if !self.enabled || !self.analyzer.should_recover(ctx) {
            return None;
        }

        // First matching rule wins; the list is priority-sorted
        {
            let rules = self.rules.read().await;
            for rule in rules.iter() {
                if !rule.matches(ctx) {
                    continue;
                }
                match rule.resolve_actions(ctx) {
                    Ok(actions) if !actions.is_empty() => {
                        info!(
                            "Recovery rule '{}' matched {} on {} (priority {}, confidence {:.2})",
                            rule.name, ctx.error_type, ctx.domain, rule.priority, rule.confidence
                        );
                        return Some(Solution {
                            actions,
                            attribution: SolutionAttribution::Rule {
                                rule_id: rule.id.clone(),
                                name: rule.name.clone(),
                                confidence: rule.confidence,
                            },
                        });
                    }
                    Ok(_) => {
                        debug!("Rule '{}' matched but resolved no actions", rule.name);
                    }
                    Err(e) => {
                        warn!("Rule '{}' failed to resolve actions: {e}", rule.name);
                    }
                }
            }
        }

        // No rule matched; ask the AI backend if one is configured
        let provider = self.provider.as_ref()?;
        match provider.propose(ctx).await {
            Ok(proposal) => {
                let mut resolved = Vec::new();
                for action in &proposal.actions {
                    match resolve_action(action) {
                        Ok(action) => resolved.push(action),
                        Err(e) => warn!("AI proposed unusable action: {e}"),
                    }
                }
                if resolved.is_empty() {
                    warn!("AI proposal contained no usable actions");
                    return None;
                }
                let solution_fingerprint = fingerprint(&resolved);
                info!(
                    "AI proposed {} actions for {} on {} (confidence {:.2})",
                    resolved.len(),
                    ctx.error_type,
                    ctx.domain,
                    proposal.confidence
                );
                Some(Solution {
                    actions: resolved,
                    attribution: SolutionAttribution::Ai {
                        solution_fingerprint,
                        reasoning: proposal.reasoning,
                        confidence: proposal.confidence,
                        declared_actions: proposal.actions,
                    },
                })
            }
            Err(e) => {
                warn!("AI fallback failed: {e}");
                None
            }
        }
    }

    /// Feed back the retry outcome after a solution was applied
    pub async fn report_outcome(&self, solution: &Solution, ctx: &FailureContext, success: bool) {
        match &solution.attribution {
            SolutionAttribution::Rule { rule_id, name, .. } => {
                if let Err(e) = self.repo.record_outcome(rule_id, success).await {
                    warn!("Failed to persist outcome for rule '{name}': {e}");
                }
                let mut rules = self.rules.write().await;
                if let Some(rule) = rules.iter_mut().find(|r| r.id == *rule_id) {
                    rule.usage_count += 1;
                    if success {
                        rule.success_count += 1;
                    } else {
                        rule.fail_count += 1;
                    }
                }
            }
            SolutionAttribution::Ai { solution_fingerprint, declared_actions, .. } => {
                match self
                    .learning
                    .record(solution_fingerprint, declared_actions, ctx, success)
                    .await
                {
                    Ok(Some(promoted)) => {
                        let mut rules = self.rules.write().await;
                        rules.push(promoted);
                        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Learning engine failed to record outcome: {e}"),
                }
            }
        }
    }
}
