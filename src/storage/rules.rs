//! Recovery rule persistence
//!
//! Rules are stored with their conditions, context and actions as JSON
//! columns; the learning counters live in their own columns so metric
//! updates don't rewrite the rule body.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::now_ms;
use crate::recovery::RecoveryRule;

#[derive(Clone)]
pub struct RulesRepo {
    pool: SqlitePool,
}

impl RulesRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// All rules ordered by priority (highest first)
    pub async fn list_rules(&self) -> Result<Vec<RecoveryRule>> {
        #[allow(clippy::type_complexity)]
        let rows: Vec<(String, String, i64, String, String, String, f64, i64, i64, i64, i64)> =
            sqlx::query_as(
                r#"
                SELECT id, name, priority, conditions, context, actions,
                       confidence, usage_count, success_count, fail_count, learned
                FROM error_recovery_rules
                ORDER BY priority DESC, created_at ASC
                "#,
            )
            .fetch_all(&self.pool)
            .await
            .context("Failed to list recovery rules")?;

        let mut rules = Vec::with_capacity(rows.len());
        for (
            id,
            name,
            priority,
            conditions,
            context,
            actions,
            confidence,
            usage_count,
            success_count,
            fail_count,
            learned,
        ) in rows
        {
            rules.push(RecoveryRule {
                id,
                name,
                priority: priority as i32,
                conditions: serde_json::from_str(&conditions)
                    .context("Corrupt rule conditions JSON")?,
                context: serde_json::from_str(&context).context("Corrupt rule context JSON")?,
                actions: serde_json::from_str(&actions).context("Corrupt rule actions JSON")?,
                confidence,
                usage_count: usage_count.max(0) as u64,
                success_count: success_count.max(0) as u64,
                fail_count: fail_count.max(0) as u64,
                learned: learned != 0,
            });
        }
        Ok(rules)
    }

    pub async fn create(&self, rule: &RecoveryRule) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            r#"
            INSERT INTO error_recovery_rules
                (id, name, priority, conditions, context, actions, confidence,
                 usage_count, success_count, fail_count, learned, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(i64::from(rule.priority))
        .bind(serde_json::to_string(&rule.conditions)?)
        .bind(serde_json::to_string(&rule.context)?)
        .bind(serde_json::to_string(&rule.actions)?)
        .bind(rule.confidence)
        .bind(rule.usage_count as i64)
        .bind(rule.success_count as i64)
        .bind(rule.fail_count as i64)
        .bind(i64::from(rule.learned))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create recovery rule")?;
        Ok(())
    }

    /// Replace a rule's definition (body, priority, confidence)
    pub async fn update(&self, rule: &RecoveryRule) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE error_recovery_rules
            SET name = ?, priority = ?, conditions = ?, context = ?, actions = ?,
                confidence = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&rule.name)
        .bind(i64::from(rule.priority))
        .bind(serde_json::to_string(&rule.conditions)?)
        .bind(serde_json::to_string(&rule.context)?)
        .bind(serde_json::to_string(&rule.actions)?)
        .bind(rule.confidence)
        .bind(now_ms())
        .bind(&rule.id)
        .execute(&self.pool)
        .await
        .context("Failed to update recovery rule")?;
        Ok(())
    }

    /// Fold one application outcome into the rule's learning counters
    pub async fn record_outcome(&self, rule_id: &str, success: bool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE error_recovery_rules
            SET usage_count = usage_count + 1,
                success_count = success_count + ?,
                fail_count = fail_count + ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(i64::from(success))
        .bind(i64::from(!success))
        .bind(now_ms())
        .bind(rule_id)
        .execute(&self.pool)
        .await
        .context("Failed to record rule outcome")?;
        Ok(())
    }

    pub async fn delete(&self, rule_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM error_recovery_rules WHERE id = ?")
            .bind(rule_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete recovery rule")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM error_recovery_config WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO error_recovery_config (key, value) VALUES (?, ?)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
