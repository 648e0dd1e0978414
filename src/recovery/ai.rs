//! AI fallback for unmatched failures
//!
//! When no rule matches, an optional backend is asked to propose a
//! solution in a strict JSON schema. The backend sits behind the
//! [`SolutionProvider`] trait so the engine never depends on a specific
//! provider; the HTTP implementation carries a fixed timeout and rotates
//! API keys when the backend reports quota exhaustion.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::rules::{Action, FailureContext};
use crate::config::AiBackendConfig;

/// Bound the response-body excerpt shipped to the backend
fn truncate_body(body: &str) -> &str {
    if body.len() <= 2048 {
        return body;
    }
    let mut end = 2048;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// A proposal in the backend's declared schema
#[derive(Debug, Clone, Deserialize)]
pub struct ProposedSolution {
    pub actions: Vec<Action>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub confidence: f64,
}

/// External reasoning capability behind a pure function signature
#[async_trait]
pub trait SolutionProvider: Send + Sync {
    async fn propose(&self, ctx: &FailureContext) -> Result<ProposedSolution>;
}

/// HTTP-backed provider for any endpoint implementing the
/// solution-proposal API
pub struct HttpSolutionProvider {
    client: reqwest::Client,
    config: AiBackendConfig,
    key_index: AtomicUsize,
}

impl HttpSolutionProvider {
    pub fn new(config: AiBackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("Failed to build HTTP client for AI backend")?;
        Ok(Self { client, config, key_index: AtomicUsize::new(0) })
    }

    fn current_key(&self) -> Option<&str> {
        if self.config.api_keys.is_empty() {
            return None;
        }
        let idx = self.key_index.load(Ordering::Relaxed) % self.config.api_keys.len();
        Some(self.config.api_keys[idx].as_str())
    }

    fn rotate_key(&self) {
        if self.config.api_keys.len() > 1 {
            let next = self.key_index.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                "Rotated AI backend key to index {}",
                next % self.config.api_keys.len()
            );
        }
    }

    fn build_request_body(&self, ctx: &FailureContext) -> serde_json::Value {
        json!({
            "model": self.config.model,
            "context": {
                "error_type": ctx.error_type,
                "error_message": ctx.error_message,
                "url": ctx.url,
                "domain": ctx.domain,
                "status_code": ctx.status_code,
                "response_body": ctx.response_body.as_deref().map(truncate_body),
                "response_headers": ctx.response_headers,
            },
            "instruction": "Propose mitigation actions for this crawl failure. \
                Respond with JSON only: {\"actions\": [{\"type\": \"wait|enable_stealth|\
                rotate_proxy|adjust_timeout|reduce_workers|add_delay|pause_execution|\
                resume_execution\", \"parameters\": {}}], \"reasoning\": \"...\", \
                \"confidence\": 0.0}",
        })
    }
}

#[async_trait]
impl SolutionProvider for HttpSolutionProvider {
    async fn propose(&self, ctx: &FailureContext) -> Result<ProposedSolution> {
        let body = self.build_request_body(ctx);
        let attempts = self.config.api_keys.len().max(1);

        for attempt in 0..attempts {
            let mut request = self.client.post(&self.config.endpoint).json(&body);
            if let Some(key) = self.current_key() {
                request = request.bearer_auth(key);
            }

            let response = request.send().await.context("AI backend request failed")?;
            let status = response.status();

            if status.as_u16() == 429 || status.as_u16() == 402 {
                warn!(
                    "AI backend quota exhausted (HTTP {}), rotating key ({}/{})",
                    status,
                    attempt + 1,
                    attempts
                );
                self.rotate_key();
                continue;
            }
            if !status.is_success() {
                bail!("AI backend returned HTTP {status}");
            }

            let proposal: ProposedSolution = response
                .json()
                .await
                .context("AI backend response did not match the solution schema")?;
            if proposal.actions.is_empty() {
                bail!("AI backend proposed no actions");
            }
            return Ok(proposal);
        }

        Err(anyhow!("AI backend quota exhausted on every configured key"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx() -> FailureContext {
        FailureContext {
            execution_id: "ex".into(),
            url: "https://x.dev/p".into(),
            domain: "x.dev".into(),
            error_type: "navigation".into(),
            error_message: "HTTP 429".into(),
            status_code: Some(429),
            response_body: None,
            response_headers: HashMap::new(),
            node_id: "nav".into(),
            is_seed: false,
        }
    }

    #[test]
    fn request_body_carries_failure_context() {
        let provider = HttpSolutionProvider::new(AiBackendConfig::new(
            "https://ai.internal/propose",
            "recovery-v2",
        ))
        .unwrap();
        let body = provider.build_request_body(&ctx());
        assert_eq!(body["model"], "recovery-v2");
        assert_eq!(body["context"]["status_code"], 429);
        assert_eq!(body["context"]["domain"], "x.dev");
        assert!(body["instruction"].as_str().unwrap().contains("JSON only"));
    }

    #[test]
    fn proposal_schema_is_strict() {
        let parsed: ProposedSolution = serde_json::from_value(json!({
            "actions": [
                { "type": "wait", "parameters": { "duration_s": 20 } },
                { "type": "rotate_proxy" }
            ],
            "reasoning": "Server is rate limiting; back off and change exit IP.",
            "confidence": 0.7
        }))
        .unwrap();
        assert_eq!(parsed.actions.len(), 2);
        assert!((parsed.confidence - 0.7).abs() < 1e-9);

        assert!(serde_json::from_value::<ProposedSolution>(json!({ "reasoning": "no actions key" }))
            .is_err());
    }

    #[test]
    fn key_rotation_wraps() {
        let mut config = AiBackendConfig::new("https://ai.internal/propose", "m");
        config.api_keys = vec!["k1".into(), "k2".into()];
        let provider = HttpSolutionProvider::new(config).unwrap();

        assert_eq!(provider.current_key(), Some("k1"));
        provider.rotate_key();
        assert_eq!(provider.current_key(), Some("k2"));
        provider.rotate_key();
        assert_eq!(provider.current_key(), Some("k1"));
    }
}
