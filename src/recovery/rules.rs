//! Recovery rules: conditions, dynamic variables and actions
//!
//! A rule matches when every condition holds against the observed
//! failure AND its context's domain glob matches the failing URL's
//! domain. Matching resolves the context's dynamic variables, then
//! substitutes them into action parameters (`{{var}}` placeholders)
//! before the actions are parsed into their typed form.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};

use crate::browser::StealthLevel;

/// Observed failure, the input to rule matching and the AI fallback
#[derive(Debug, Clone, Serialize)]
pub struct FailureContext {
    pub execution_id: String,
    pub url: String,
    pub domain: String,
    /// Coarse error label (`navigation`, `timeout`, `selector`, ...)
    pub error_type: String,
    pub error_message: String,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub response_headers: HashMap<String, String>,
    pub node_id: String,
    /// Whether the failing URL is a seed (drives critical classification)
    pub is_seed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionField {
    ErrorType,
    StatusCode,
    Domain,
    ResponseBody,
    ResponseHeaders,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    Regex,
    Gt,
    Lt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: ConditionField,
    pub operator: ConditionOperator,
    pub value: Value,
}

impl Condition {
    #[must_use]
    pub fn status_code_equals(code: u16) -> Self {
        Self {
            field: ConditionField::StatusCode,
            operator: ConditionOperator::Equals,
            value: json!(code),
        }
    }

    #[must_use]
    pub fn error_type_equals(error_type: &str) -> Self {
        Self {
            field: ConditionField::ErrorType,
            operator: ConditionOperator::Equals,
            value: json!(error_type),
        }
    }

    fn observed(&self, ctx: &FailureContext) -> Option<String> {
        match self.field {
            ConditionField::ErrorType => Some(ctx.error_type.clone()),
            ConditionField::StatusCode => ctx.status_code.map(|s| s.to_string()),
            ConditionField::Domain => Some(ctx.domain.clone()),
            ConditionField::ResponseBody => ctx.response_body.clone(),
            ConditionField::ResponseHeaders => {
                Some(serde_json::to_string(&ctx.response_headers).unwrap_or_default())
            }
        }
    }

    #[must_use]
    pub fn matches(&self, ctx: &FailureContext) -> bool {
        let Some(observed) = self.observed(ctx) else {
            return false;
        };
        let expected = match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        match self.operator {
            ConditionOperator::Equals => observed.eq_ignore_ascii_case(&expected),
            ConditionOperator::Contains => {
                observed.to_lowercase().contains(&expected.to_lowercase())
            }
            ConditionOperator::Regex => {
                Regex::new(&expected).is_ok_and(|re| re.is_match(&observed))
            }
            ConditionOperator::Gt => match (observed.parse::<f64>(), expected.parse::<f64>()) {
                (Ok(o), Ok(e)) => o > e,
                _ => false,
            },
            ConditionOperator::Lt => match (observed.parse::<f64>(), expected.parse::<f64>()) {
                (Ok(o), Ok(e)) => o < e,
                _ => false,
            },
        }
    }
}

/// Glob match with `*` wildcards, case-insensitive (domains)
#[must_use]
pub fn glob_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("(?i)^{escaped}$")).is_ok_and(|re| re.is_match(value))
}

fn default_domain_pattern() -> String {
    "*".to_string()
}

fn one() -> f64 {
    1.0
}

fn default_max_retries() -> u32 {
    1
}

/// Variables resolved at match time against the failure context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DynamicVariable {
    /// Pick a value by substring of the error message / response body
    Conditional {
        if_contains: String,
        then: Value,
        #[serde(default)]
        else_if_contains: Option<String>,
        #[serde(default)]
        else_then: Option<Value>,
        #[serde(default, rename = "else")]
        otherwise: Option<Value>,
    },
    /// Derive a number from a response header
    Calculated {
        /// `response_header:<name>`
        source: String,
        #[serde(default = "one")]
        multiplier: f64,
        fallback: Value,
    },
    /// Pick a value by domain glob
    DomainBased {
        mapping: BTreeMap<String, Value>,
        #[serde(default)]
        default: Option<Value>,
    },
}

impl DynamicVariable {
    #[must_use]
    pub fn resolve(&self, ctx: &FailureContext) -> Value {
        match self {
            Self::Conditional {
                if_contains,
                then,
                else_if_contains,
                else_then,
                otherwise,
            } => {
                let haystack = format!(
                    "{} {}",
                    ctx.error_message,
                    ctx.response_body.as_deref().unwrap_or_default()
                )
                .to_lowercase();
                if haystack.contains(&if_contains.to_lowercase()) {
                    then.clone()
                } else if else_if_contains
                    .as_ref()
                    .is_some_and(|needle| haystack.contains(&needle.to_lowercase()))
                {
                    else_then.clone().unwrap_or(Value::Null)
                } else {
                    otherwise.clone().unwrap_or(Value::Null)
                }
            }
            Self::Calculated { source, multiplier, fallback } => {
                let header = source.strip_prefix("response_header:");
                let parsed = header
                    .and_then(|name| ctx.response_headers.get(&name.to_lowercase()))
                    .and_then(|raw| raw.trim().parse::<f64>().ok());
                match parsed {
                    Some(value) => json!(value * multiplier),
                    None => fallback.clone(),
                }
            }
            Self::DomainBased { mapping, default } => mapping
                .iter()
                .find(|(pattern, _)| glob_matches(pattern, &ctx.domain))
                .map(|(_, value)| value.clone())
                .or_else(|| default.clone())
                .unwrap_or(Value::Null),
        }
    }
}

/// Match-scoped settings attached to a rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleContext {
    #[serde(default = "default_domain_pattern")]
    pub domain_pattern: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "one")]
    pub timeout_multiplier: f64,
    #[serde(default)]
    pub variables: BTreeMap<String, DynamicVariable>,
}

impl Default for RuleContext {
    fn default() -> Self {
        Self {
            domain_pattern: default_domain_pattern(),
            max_retries: default_max_retries(),
            timeout_multiplier: one(),
            variables: BTreeMap::new(),
        }
    }
}

/// An action as declared in a rule (parameters may hold `{{var}}`
/// placeholders until substitution)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl Action {
    #[must_use]
    pub fn bare(kind: &str) -> Self {
        Self { kind: kind.to_string(), parameters: Map::new() }
    }

    #[must_use]
    pub fn with_param(kind: &str, key: &str, value: Value) -> Self {
        let mut parameters = Map::new();
        parameters.insert(key.to_string(), value);
        Self { kind: kind.to_string(), parameters }
    }
}

/// Typed, substituted form of an [`Action`]
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedAction {
    Wait { duration_s: f64 },
    EnableStealth { level: StealthLevel },
    RotateProxy,
    AdjustTimeout { multiplier: f64 },
    ReduceWorkers { count: usize },
    AddDelay { ms: u64 },
    PauseExecution,
    ResumeExecution,
}

impl ResolvedAction {
    /// Stable label used for AI-solution fingerprints
    #[must_use]
    pub fn fingerprint_token(&self) -> String {
        match self {
            Self::Wait { duration_s } => format!("wait:{duration_s}"),
            Self::EnableStealth { level } => format!("stealth:{level:?}"),
            Self::RotateProxy => "rotate_proxy".to_string(),
            Self::AdjustTimeout { multiplier } => format!("timeout:{multiplier}"),
            Self::ReduceWorkers { count } => format!("workers:{count}"),
            Self::AddDelay { ms } => format!("delay:{ms}"),
            Self::PauseExecution => "pause".to_string(),
            Self::ResumeExecution => "resume".to_string(),
        }
    }
}

fn param_f64(parameters: &Map<String, Value>, key: &str) -> Option<f64> {
    match parameters.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse one declared action into its typed form; unknown verbs and
/// missing parameters are reported by name.
pub fn resolve_action(action: &Action) -> Result<ResolvedAction, String> {
    let p = &action.parameters;
    match action.kind.as_str() {
        "wait" => param_f64(p, "duration_s")
            .or_else(|| param_f64(p, "duration"))
            .map(|duration_s| ResolvedAction::Wait { duration_s })
            .ok_or_else(|| "wait needs duration_s".to_string()),
        "enable_stealth" => {
            let raw = p.get("level").and_then(Value::as_str).unwrap_or("med");
            StealthLevel::parse(raw)
                .map(|level| ResolvedAction::EnableStealth { level })
                .ok_or_else(|| format!("unknown stealth level '{raw}'"))
        }
        "rotate_proxy" => Ok(ResolvedAction::RotateProxy),
        "adjust_timeout" => param_f64(p, "multiplier")
            .map(|multiplier| ResolvedAction::AdjustTimeout { multiplier })
            .ok_or_else(|| "adjust_timeout needs multiplier".to_string()),
        "reduce_workers" => param_f64(p, "count")
            .map(|count| ResolvedAction::ReduceWorkers { count: (count.max(1.0)) as usize })
            .ok_or_else(|| "reduce_workers needs count".to_string()),
        "add_delay" => param_f64(p, "ms")
            .or_else(|| param_f64(p, "delay_ms"))
            .map(|ms| ResolvedAction::AddDelay { ms: ms.max(0.0) as u64 })
            .ok_or_else(|| "add_delay needs ms".to_string()),
        "pause_execution" | "pause" => Ok(ResolvedAction::PauseExecution),
        "resume_execution" | "resume" => Ok(ResolvedAction::ResumeExecution),
        other => Err(format!("unknown action '{other}'")),
    }
}

/// Substitute `{{var}}` placeholders in action parameters.
///
/// A parameter that is exactly one placeholder takes the variable's
/// value with its type preserved; embedded placeholders render as text.
#[must_use]
pub fn substitute_parameters(action: &Action, vars: &BTreeMap<String, Value>) -> Action {
    fn render(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    let parameters = action
        .parameters
        .iter()
        .map(|(key, value)| {
            let substituted = match value {
                Value::String(raw) => {
                    let trimmed = raw.trim();
                    let exact = trimmed.strip_prefix("{{").and_then(|s| s.strip_suffix("}}"));
                    match exact {
                        Some(name) if vars.contains_key(name.trim()) => {
                            vars[name.trim()].clone()
                        }
                        _ => {
                            let mut rendered = raw.clone();
                            for (name, var_value) in vars {
                                rendered = rendered
                                    .replace(&format!("{{{{{name}}}}}"), &render(var_value));
                            }
                            Value::String(rendered)
                        }
                    }
                }
                other => other.clone(),
            };
            (key.clone(), substituted)
        })
        .collect();

    Action { kind: action.kind.clone(), parameters }
}

/// A prioritized failure-pattern-to-actions mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRule {
    pub id: String,
    pub name: String,
    pub priority: i32,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub context: RuleContext,
    pub actions: Vec<Action>,
    pub confidence: f64,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub fail_count: u64,
    /// Promoted from AI-solution learning rather than operator-defined
    #[serde(default)]
    pub learned: bool,
}

impl RecoveryRule {
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let resolved = self.success_count + self.fail_count;
        if resolved == 0 {
            return 0.0;
        }
        self.success_count as f64 / resolved as f64
    }

    /// Whether this rule applies to the failure; all conditions AND the
    /// domain glob must hold.
    #[must_use]
    pub fn matches(&self, ctx: &FailureContext) -> bool {
        glob_matches(&self.context.domain_pattern, &ctx.domain)
            && self.conditions.iter().all(|c| c.matches(ctx))
    }

    /// Resolve dynamic variables and produce the typed action list
    pub fn resolve_actions(&self, ctx: &FailureContext) -> Result<Vec<ResolvedAction>, String> {
        let vars: BTreeMap<String, Value> = self
            .context
            .variables
            .iter()
            .map(|(name, var)| (name.clone(), var.resolve(ctx)))
            .collect();

        self.actions
            .iter()
            .map(|action| resolve_action(&substitute_parameters(action, &vars)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure_429() -> FailureContext {
        FailureContext {
            execution_id: "ex".into(),
            url: "https://shop.example.com/p/1".into(),
            domain: "shop.example.com".into(),
            error_type: "navigation".into(),
            error_message: "https://shop.example.com/p/1 returned HTTP 429".into(),
            status_code: Some(429),
            response_body: Some("rate limit exceeded, slow down".into()),
            response_headers: HashMap::from([("retry-after".to_string(), "30".to_string())]),
            node_id: "nav".into(),
            is_seed: false,
        }
    }

    #[test]
    fn condition_operators() {
        let ctx = failure_429();
        assert!(Condition::status_code_equals(429).matches(&ctx));
        assert!(!Condition::status_code_equals(503).matches(&ctx));

        let gt = Condition {
            field: ConditionField::StatusCode,
            operator: ConditionOperator::Gt,
            value: json!(399),
        };
        assert!(gt.matches(&ctx));

        let contains = Condition {
            field: ConditionField::ResponseBody,
            operator: ConditionOperator::Contains,
            value: json!("Rate Limit"),
        };
        assert!(contains.matches(&ctx));

        let re = Condition {
            field: ConditionField::Domain,
            operator: ConditionOperator::Regex,
            value: json!(r"^shop\..+"),
        };
        assert!(re.matches(&ctx));
    }

    #[test]
    fn domain_globs() {
        assert!(glob_matches("*", "anything.example.com"));
        assert!(glob_matches("*.example.com", "shop.example.com"));
        assert!(glob_matches("shop.example.com", "SHOP.example.com"));
        assert!(!glob_matches("*.example.com", "example.org"));
    }

    #[test]
    fn conditional_variable_branches() {
        let var: DynamicVariable = serde_json::from_value(json!({
            "kind": "conditional",
            "if_contains": "rate limit",
            "then": 60,
            "else_if_contains": "captcha",
            "else_then": 300,
            "else": 10
        }))
        .unwrap();
        assert_eq!(var.resolve(&failure_429()), json!(60));

        let mut captcha = failure_429();
        captcha.error_message = "captcha challenge presented".into();
        captcha.response_body = None;
        assert_eq!(var.resolve(&captcha), json!(300));

        let mut other = failure_429();
        other.error_message = "connection reset".into();
        other.response_body = None;
        assert_eq!(var.resolve(&other), json!(10));
    }

    #[test]
    fn calculated_variable_reads_headers() {
        let var: DynamicVariable = serde_json::from_value(json!({
            "kind": "calculated",
            "source": "response_header:retry-after",
            "multiplier": 2.0,
            "fallback": 15
        }))
        .unwrap();
        assert_eq!(var.resolve(&failure_429()), json!(60.0));

        let mut headerless = failure_429();
        headerless.response_headers.clear();
        assert_eq!(var.resolve(&headerless), json!(15));
    }

    #[test]
    fn domain_based_variable() {
        let var: DynamicVariable = serde_json::from_value(json!({
            "kind": "domain_based",
            "mapping": { "*.example.com": "gentle", "api.fast.dev": "aggressive" },
            "default": "normal"
        }))
        .unwrap();
        assert_eq!(var.resolve(&failure_429()), json!("gentle"));

        let mut other = failure_429();
        other.domain = "somewhere.org".into();
        assert_eq!(var.resolve(&other), json!("normal"));
    }

    #[test]
    fn substitution_preserves_types_for_exact_placeholders() {
        let action = Action::with_param("wait", "duration_s", json!("{{backoff}}"));
        let vars = BTreeMap::from([("backoff".to_string(), json!(30))]);
        let substituted = substitute_parameters(&action, &vars);
        assert_eq!(substituted.parameters["duration_s"], json!(30));

        let embedded = Action::with_param("wait", "note", json!("sleeping {{backoff}}s"));
        let substituted = substitute_parameters(&embedded, &vars);
        assert_eq!(substituted.parameters["note"], json!("sleeping 30s"));
    }

    #[test]
    fn resolve_action_verbs() {
        assert_eq!(
            resolve_action(&Action::with_param("wait", "duration_s", json!(30))).unwrap(),
            ResolvedAction::Wait { duration_s: 30.0 }
        );
        assert_eq!(
            resolve_action(&Action::with_param("enable_stealth", "level", json!("high"))).unwrap(),
            ResolvedAction::EnableStealth { level: StealthLevel::High }
        );
        assert_eq!(
            resolve_action(&Action::with_param("reduce_workers", "count", json!(1))).unwrap(),
            ResolvedAction::ReduceWorkers { count: 1 }
        );
        assert!(resolve_action(&Action::bare("wait")).is_err());
        assert!(resolve_action(&Action::bare("self_destruct")).is_err());
    }

    #[test]
    fn rule_matching_and_resolution() {
        let rule: RecoveryRule = serde_json::from_value(json!({
            "id": "throttle-429",
            "name": "Throttle on 429",
            "priority": 7,
            "conditions": [
                { "field": "status_code", "operator": "equals", "value": 429 }
            ],
            "context": {
                "domain_pattern": "*",
                "variables": {
                    "backoff": {
                        "kind": "calculated",
                        "source": "response_header:retry-after",
                        "fallback": 30
                    }
                }
            },
            "actions": [
                { "type": "pause_execution" },
                { "type": "wait", "parameters": { "duration_s": "{{backoff}}" } },
                { "type": "reduce_workers", "parameters": { "count": 1 } },
                { "type": "add_delay", "parameters": { "ms": 1000 } },
                { "type": "resume_execution" }
            ],
            "confidence": 0.9
        }))
        .unwrap();

        let ctx = failure_429();
        assert!(rule.matches(&ctx));

        let actions = rule.resolve_actions(&ctx).unwrap();
        assert_eq!(actions.len(), 5);
        assert_eq!(actions[1], ResolvedAction::Wait { duration_s: 30.0 });
        assert_eq!(actions[2], ResolvedAction::ReduceWorkers { count: 1 });
        assert_eq!(actions[3], ResolvedAction::AddDelay { ms: 1000 });

        let mut wrong_status = ctx;
        wrong_status.status_code = Some(500);
        assert!(!rule.matches(&wrong_status));
    }
}
