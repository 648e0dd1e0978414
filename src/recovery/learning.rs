//! Learning from applied solutions
//!
//! Every AI-proposed solution is fingerprinted by its action sequence.
//! A fingerprint that keeps succeeding graduates into a learned rule so
//! future matches skip the AI round-trip entirely. Promotion is
//! eventually consistent: the in-memory rule list picks the new rule up
//! when the caller inserts it, concurrent matchers just miss it once.

use dashmap::DashMap;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::info;
use uuid::Uuid;

use super::rules::{
    Action, Condition, ConditionField, ConditionOperator, FailureContext, RecoveryRule,
    ResolvedAction, RuleContext,
};
use crate::storage::RulesRepo;

/// Default promotion gates; overridable through `error_recovery_config`
const DEFAULT_MIN_USAGE: u64 = 5;
const DEFAULT_MIN_SUCCESS_RATE: f64 = 0.7;

/// Stable fingerprint of an action sequence
#[must_use]
pub fn fingerprint(actions: &[ResolvedAction]) -> String {
    actions
        .iter()
        .map(ResolvedAction::fingerprint_token)
        .collect::<Vec<_>>()
        .join("|")
}

#[derive(Debug, Default)]
struct FingerprintStats {
    actions: Vec<Action>,
    successes: u64,
    failures: u64,
    domains: HashSet<String>,
    error_types: HashMap<String, u64>,
    status_codes: HashMap<u16, u64>,
    promoted: bool,
}

impl FingerprintStats {
    fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            return 0.0;
        }
        self.successes as f64 / total as f64
    }

    fn dominant_error_type(&self) -> Option<&str> {
        self.error_types
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(error_type, _)| error_type.as_str())
    }

    fn dominant_status(&self) -> Option<u16> {
        self.status_codes
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(status, _)| *status)
    }
}

pub struct LearningEngine {
    repo: RulesRepo,
    min_usage: u64,
    min_success_rate: f64,
    stats: DashMap<String, FingerprintStats>,
}

impl LearningEngine {
    #[must_use]
    pub fn new(repo: RulesRepo) -> Self {
        Self {
            repo,
            min_usage: DEFAULT_MIN_USAGE,
            min_success_rate: DEFAULT_MIN_SUCCESS_RATE,
            stats: DashMap::new(),
        }
    }

    /// Read promotion gates from the config table, keeping defaults for
    /// anything unset
    pub async fn load_thresholds(&mut self) {
        if let Ok(Some(raw)) = self.repo.get_config("promotion_min_usage").await
            && let Ok(value) = raw.parse()
        {
            self.min_usage = value;
        }
        if let Ok(Some(raw)) = self.repo.get_config("promotion_min_success_rate").await
            && let Ok(value) = raw.parse()
        {
            self.min_success_rate = value;
        }
    }

    /// Fold one applied-AI-solution outcome in; returns a newly promoted
    /// rule when this outcome crossed the gates.
    pub async fn record(
        &self,
        solution_fingerprint: &str,
        declared_actions: &[Action],
        ctx: &FailureContext,
        success: bool,
    ) -> anyhow::Result<Option<RecoveryRule>> {
        let promoted = {
            let mut stats = self
                .stats
                .entry(solution_fingerprint.to_string())
                .or_default();
            if stats.actions.is_empty() {
                stats.actions = declared_actions.to_vec();
            }
            if success {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
            stats.domains.insert(ctx.domain.clone());
            *stats.error_types.entry(ctx.error_type.clone()).or_default() += 1;
            if let Some(status) = ctx.status_code {
                *stats.status_codes.entry(status).or_default() += 1;
            }

            let eligible = !stats.promoted
                && stats.successes >= self.min_usage
                && stats.success_rate() >= self.min_success_rate;
            if eligible {
                stats.promoted = true;
                Some(self.build_rule(solution_fingerprint, &stats))
            } else {
                None
            }
        };

        if let Some(rule) = promoted {
            info!(
                "Promoting AI solution {} into learned rule '{}' (success rate {:.0}%)",
                solution_fingerprint,
                rule.name,
                rule.confidence * 100.0
            );
            self.repo.create(&rule).await?;
            return Ok(Some(rule));
        }
        Ok(None)
    }

    fn build_rule(&self, solution_fingerprint: &str, stats: &FingerprintStats) -> RecoveryRule {
        let mut conditions = Vec::new();
        if let Some(error_type) = stats.dominant_error_type() {
            conditions.push(Condition::error_type_equals(error_type));
        }
        if let Some(status) = stats.dominant_status() {
            conditions.push(Condition {
                field: ConditionField::StatusCode,
                operator: ConditionOperator::Equals,
                value: json!(status),
            });
        }

        let domain_pattern = if stats.domains.len() == 1 {
            stats.domains.iter().next().cloned().unwrap_or_else(|| "*".to_string())
        } else {
            "*".to_string()
        };

        let short = &solution_fingerprint[..solution_fingerprint.len().min(24)];
        RecoveryRule {
            id: Uuid::new_v4().to_string(),
            name: format!("learned:{short}"),
            priority: 5,
            conditions,
            context: RuleContext { domain_pattern, ..Default::default() },
            actions: stats.actions.clone(),
            confidence: stats.success_rate(),
            usage_count: stats.successes + stats.failures,
            success_count: stats.successes,
            fail_count: stats.failures,
            learned: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::StealthLevel;
    use crate::storage::Database;
    use tempfile::TempDir;

    fn ctx(domain: &str, status: u16) -> FailureContext {
        FailureContext {
            execution_id: "ex".into(),
            url: format!("https://{domain}/p"),
            domain: domain.to_string(),
            error_type: "navigation".into(),
            error_message: "HTTP error".into(),
            status_code: Some(status),
            response_body: None,
            response_headers: HashMap::new(),
            node_id: "nav".into(),
            is_seed: false,
        }
    }

    #[test]
    fn fingerprints_are_order_sensitive() {
        let a = fingerprint(&[
            ResolvedAction::Wait { duration_s: 30.0 },
            ResolvedAction::RotateProxy,
        ]);
        let b = fingerprint(&[
            ResolvedAction::RotateProxy,
            ResolvedAction::Wait { duration_s: 30.0 },
        ]);
        assert_ne!(a, b);
        assert_eq!(a, "wait:30|rotate_proxy");

        let stealth = fingerprint(&[ResolvedAction::EnableStealth { level: StealthLevel::High }]);
        assert!(stealth.contains("High"));
    }

    #[tokio::test]
    async fn promotion_after_enough_successes() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let db = Database::open(&dir.path().join("l.sqlite")).await?;
        let engine = LearningEngine::new(db.rules());

        let declared = vec![Action::with_param("wait", "duration_s", json!(20))];
        let fp = "wait:20";

        // Four successes: not yet at the usage gate
        for _ in 0..4 {
            let promoted = engine.record(fp, &declared, &ctx("a.com", 429), true).await?;
            assert!(promoted.is_none());
        }

        // Fifth success crosses the gate
        let rule = engine
            .record(fp, &declared, &ctx("a.com", 429), true)
            .await?
            .expect("rule should be promoted");
        assert!(rule.learned);
        assert_eq!(rule.priority, 5);
        assert_eq!(rule.context.domain_pattern, "a.com");
        assert!(rule.conditions.iter().any(|c| c.value == json!(429)));
        assert!((rule.confidence - 1.0).abs() < 1e-9);

        // Only persisted once; later outcomes do not re-promote
        let again = engine.record(fp, &declared, &ctx("a.com", 429), true).await?;
        assert!(again.is_none());
        let stored = db.rules().list_rules().await?;
        assert_eq!(stored.iter().filter(|r| r.learned).count(), 1);

        db.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn multi_domain_solutions_promote_with_wildcard() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let db = Database::open(&dir.path().join("l2.sqlite")).await?;
        let engine = LearningEngine::new(db.rules());

        let declared = vec![Action::bare("rotate_proxy")];
        for i in 0..5 {
            engine
                .record("rotate_proxy", &declared, &ctx(&format!("d{i}.com", ), 403), true)
                .await?;
        }

        let stored = db.rules().list_rules().await?;
        let learned = stored.iter().find(|r| r.learned).expect("promoted");
        assert_eq!(learned.context.domain_pattern, "*");

        db.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn poor_success_rate_never_promotes() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let db = Database::open(&dir.path().join("l3.sqlite")).await?;
        let engine = LearningEngine::new(db.rules());

        let declared = vec![Action::bare("rotate_proxy")];
        // 5 successes but 6 failures: 45% success rate
        for i in 0..11 {
            let promoted = engine
                .record("rotate_proxy", &declared, &ctx("a.com", 403), i % 2 == 0)
                .await?;
            assert!(promoted.is_none());
        }

        assert!(db.rules().list_rules().await?.is_empty());
        db.close().await;
        Ok(())
    }
}
