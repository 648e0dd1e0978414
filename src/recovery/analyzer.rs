//! Failure pattern analysis
//!
//! Keeps a sliding window of the most recent request outcomes per
//! execution and decides when observed failures cross the line from
//! "normal noise" into "recovery should step in". Below threshold,
//! failures propagate to the ordinary retry policy untouched.

use dashmap::DashMap;
use std::collections::VecDeque;
use tracing::debug;

use super::rules::FailureContext;

/// Window length per execution
const WINDOW: usize = 100;

/// Window-wide error rate that activates recovery
const ERROR_RATE_THRESHOLD: f64 = 0.10;

/// Consecutive errors that activate recovery
const CONSECUTIVE_ERROR_THRESHOLD: u32 = 5;

/// Repetitions of one (status, error_type) pair that activate recovery
const REPEATED_PAIR_THRESHOLD: usize = 10;

/// Per-domain error rate that activates recovery
const DOMAIN_ERROR_RATE_THRESHOLD: f64 = 0.20;

/// Minimum per-domain samples before the domain rate is meaningful
const DOMAIN_MIN_SAMPLES: usize = 5;

/// One observed request outcome
#[derive(Debug, Clone)]
pub struct OutcomeSample {
    pub domain: String,
    pub status_code: Option<u16>,
    /// Error label for failures, `None` for successes
    pub error_type: Option<String>,
    pub ok: bool,
}

#[derive(Default)]
struct ExecutionWindow {
    samples: VecDeque<OutcomeSample>,
    consecutive_errors: u32,
}

impl ExecutionWindow {
    fn push(&mut self, sample: OutcomeSample) {
        if sample.ok {
            self.consecutive_errors = 0;
        } else {
            self.consecutive_errors += 1;
        }
        self.samples.push_back(sample);
        while self.samples.len() > WINDOW {
            self.samples.pop_front();
        }
    }

    fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let errors = self.samples.iter().filter(|s| !s.ok).count();
        errors as f64 / self.samples.len() as f64
    }

    fn pair_count(&self, status_code: Option<u16>, error_type: &str) -> usize {
        self.samples
            .iter()
            .filter(|s| {
                !s.ok
                    && s.status_code == status_code
                    && s.error_type.as_deref() == Some(error_type)
            })
            .count()
    }

    fn domain_error_rate(&self, domain: &str) -> (usize, f64) {
        let samples: Vec<&OutcomeSample> =
            self.samples.iter().filter(|s| s.domain == domain).collect();
        if samples.is_empty() {
            return (0, 0.0);
        }
        let errors = samples.iter().filter(|s| !s.ok).count();
        (samples.len(), errors as f64 / samples.len() as f64)
    }
}

/// Failures the analyzer always treats as recovery-worthy
#[must_use]
pub fn is_critical(ctx: &FailureContext) -> bool {
    let message = ctx.error_message.to_lowercase();
    (ctx.is_seed && ctx.error_type == "timeout")
        || message.contains("captcha")
        || message.contains("blocked")
}

pub struct PatternAnalyzer {
    executions: DashMap<String, ExecutionWindow>,
}

impl Default for PatternAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternAnalyzer {
    #[must_use]
    pub fn new() -> Self {
        Self { executions: DashMap::new() }
    }

    /// Record one request outcome for its execution's window
    pub fn record(&self, execution_id: &str, sample: OutcomeSample) {
        self.executions
            .entry(execution_id.to_string())
            .or_default()
            .push(sample);
    }

    /// Whether recovery should engage for this failure
    #[must_use]
    pub fn should_recover(&self, ctx: &FailureContext) -> bool {
        if is_critical(ctx) {
            debug!("recovery activated: critical failure ({})", ctx.error_message);
            return true;
        }

        let Some(window) = self.executions.get(&ctx.execution_id) else {
            return false;
        };

        if window.consecutive_errors >= CONSECUTIVE_ERROR_THRESHOLD {
            debug!(
                "recovery activated: {} consecutive errors",
                window.consecutive_errors
            );
            return true;
        }

        let error_rate = window.error_rate();
        if error_rate >= ERROR_RATE_THRESHOLD {
            debug!("recovery activated: window error rate {:.0}%", error_rate * 100.0);
            return true;
        }

        let pair_count = window.pair_count(ctx.status_code, &ctx.error_type);
        if pair_count >= REPEATED_PAIR_THRESHOLD {
            debug!(
                "recovery activated: ({:?}, {}) repeated {} times",
                ctx.status_code, ctx.error_type, pair_count
            );
            return true;
        }

        let (domain_samples, domain_rate) = window.domain_error_rate(&ctx.domain);
        if domain_samples >= DOMAIN_MIN_SAMPLES && domain_rate >= DOMAIN_ERROR_RATE_THRESHOLD {
            debug!(
                "recovery activated: domain {} error rate {:.0}%",
                ctx.domain,
                domain_rate * 100.0
            );
            return true;
        }

        false
    }

    /// Drop an execution's window when the execution ends
    pub fn forget(&self, execution_id: &str) {
        self.executions.remove(execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ok_sample(domain: &str) -> OutcomeSample {
        OutcomeSample {
            domain: domain.to_string(),
            status_code: Some(200),
            error_type: None,
            ok: true,
        }
    }

    fn err_sample(domain: &str, status: u16, error_type: &str) -> OutcomeSample {
        OutcomeSample {
            domain: domain.to_string(),
            status_code: Some(status),
            error_type: Some(error_type.to_string()),
            ok: false,
        }
    }

    fn ctx(execution_id: &str, domain: &str, status: Option<u16>, error_type: &str) -> FailureContext {
        FailureContext {
            execution_id: execution_id.to_string(),
            url: format!("https://{domain}/p"),
            domain: domain.to_string(),
            error_type: error_type.to_string(),
            error_message: "request failed".to_string(),
            status_code: status,
            response_body: None,
            response_headers: HashMap::new(),
            node_id: "nav".to_string(),
            is_seed: false,
        }
    }

    #[test]
    fn quiet_window_does_not_recover() {
        let analyzer = PatternAnalyzer::new();
        for _ in 0..50 {
            analyzer.record("ex", ok_sample("a.com"));
        }
        analyzer.record("ex", err_sample("a.com", 500, "navigation"));
        assert!(!analyzer.should_recover(&ctx("ex", "a.com", Some(500), "navigation")));
    }

    #[test]
    fn consecutive_errors_activate() {
        let analyzer = PatternAnalyzer::new();
        for _ in 0..60 {
            analyzer.record("ex", ok_sample("a.com"));
        }
        for _ in 0..5 {
            analyzer.record("ex", err_sample("a.com", 502, "navigation"));
        }
        // 5/65 is under the 10% window rate; consecutive count triggers
        assert!(analyzer.should_recover(&ctx("ex", "a.com", Some(502), "navigation")));
    }

    #[test]
    fn window_error_rate_activates() {
        let analyzer = PatternAnalyzer::new();
        for i in 0..40 {
            analyzer.record("ex", ok_sample("a.com"));
            if i % 8 == 0 {
                analyzer.record("ex", err_sample("b.com", 500, "navigation"));
            }
        }
        // 5 errors / 45 samples ≈ 11%
        assert!(analyzer.should_recover(&ctx("ex", "c.com", Some(500), "navigation")));
    }

    #[test]
    fn repeated_pair_activates() {
        let analyzer = PatternAnalyzer::new();
        // Interleave successes so the consecutive-error streak never forms
        for _ in 0..10 {
            for _ in 0..9 {
                analyzer.record("ex", ok_sample("a.com"));
            }
            analyzer.record("ex", err_sample("ex.com", 429, "navigation"));
        }
        // Window holds the last 100: 10 (429, navigation) failures
        assert!(analyzer.should_recover(&ctx("ex", "a.com", Some(429), "navigation")));

        // A sparser execution with the same pair stays quiet
        let calm = PatternAnalyzer::new();
        for _ in 0..19 {
            calm.record("ex2", ok_sample("a.com"));
        }
        calm.record("ex2", err_sample("a.com", 429, "navigation"));
        assert!(!calm.should_recover(&ctx("ex2", "a.com", Some(429), "navigation")));
    }

    #[test]
    fn domain_rate_activates() {
        let analyzer = PatternAnalyzer::new();
        for _ in 0..90 {
            analyzer.record("ex", ok_sample("healthy.com"));
        }
        for i in 0..8 {
            analyzer.record(
                "ex",
                if i % 2 == 0 {
                    err_sample("flaky.com", 500, "navigation")
                } else {
                    ok_sample("flaky.com")
                },
            );
        }
        // flaky.com: 4/8 errors; window-wide 4/98 stays quiet
        assert!(analyzer.should_recover(&ctx("ex", "flaky.com", Some(500), "navigation")));
        assert!(!analyzer.should_recover(&ctx("ex", "healthy.com", Some(500), "navigation")));
    }

    #[test]
    fn critical_failures_bypass_thresholds() {
        let analyzer = PatternAnalyzer::new();

        let mut seed_timeout = ctx("ex", "a.com", None, "timeout");
        seed_timeout.is_seed = true;
        assert!(analyzer.should_recover(&seed_timeout));

        let mut captcha = ctx("ex", "a.com", Some(200), "navigation");
        captcha.error_message = "Captcha challenge presented".to_string();
        assert!(analyzer.should_recover(&captcha));
    }

    #[test]
    fn windows_are_per_execution() {
        let analyzer = PatternAnalyzer::new();
        for _ in 0..10 {
            analyzer.record("noisy", err_sample("a.com", 500, "navigation"));
        }
        assert!(analyzer.should_recover(&ctx("noisy", "a.com", Some(500), "navigation")));
        assert!(!analyzer.should_recover(&ctx("calm", "a.com", Some(500), "navigation")));

        analyzer.forget("noisy");
        assert!(!analyzer.should_recover(&ctx("noisy", "a.com", Some(500), "navigation")));
    }
}
