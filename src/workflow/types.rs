//! Workflow document types

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::nodes::NodeType;

fn default_max_depth() -> u32 {
    3
}

fn default_workers() -> usize {
    5
}

/// How `max_pages` bounds an execution.
///
/// `Dequeue` (the default) caps how many URLs reach a terminal state:
/// workers stop claiming once the cap is hit, in-flight URLs finish.
/// `Enqueue` caps how many URLs the queue accepts; rows beyond the cap
/// are inserted as `skipped` so discovery breadth stays observable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxPagesMode {
    #[default]
    Dequeue,
    Enqueue,
}

/// A workflow: ordered phases executed against discovered URLs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub phases: Vec<Phase>,
    pub start_urls: Vec<String>,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default)]
    pub max_pages: Option<u64>,
    #[serde(default)]
    pub max_pages_mode: MaxPagesMode,
    #[serde(default)]
    pub rate_limit_delay_ms: u64,
    #[serde(default = "default_workers")]
    pub concurrent_workers: usize,
    #[serde(default)]
    pub default_headers: HashMap<String, String>,
    #[serde(default)]
    pub default_cookies: HashMap<String, String>,
}

impl Workflow {
    /// Find a phase by id
    #[must_use]
    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// First phase whose filter accepts the URL, in declaration order
    #[must_use]
    pub fn select_phase(&self, url: &str, url_type: &str, depth: u32) -> Option<&Phase> {
        self.phases
            .iter()
            .find(|p| p.url_filter.matches(url, url_type, depth))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Discovery,
    Extraction,
    Processing,
    Custom,
}

/// One phase: a URL filter plus a node DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub kind: PhaseKind,
    #[serde(default)]
    pub url_filter: UrlFilter,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub transition: Option<PhaseTransition>,
}

impl Phase {
    /// Find a node by id
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Which URLs a phase processes.
///
/// All present criteria must hold: `url_types` matches the row's type,
/// `depth` is an exact match, `markers` are substrings the URL must
/// contain, `patterns` are regexes at least one of which must match.
/// An empty filter matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UrlFilter {
    #[serde(default)]
    pub markers: Option<HashSet<String>>,
    #[serde(default)]
    pub patterns: Option<Vec<String>>,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub url_types: Option<HashSet<String>>,

    /// Compiled form of `patterns`, populated during validation
    #[serde(skip)]
    pub compiled_patterns: Vec<Regex>,
}

impl UrlFilter {
    #[must_use]
    pub fn matches(&self, url: &str, url_type: &str, depth: u32) -> bool {
        if let Some(types) = &self.url_types
            && !types.contains(url_type)
        {
            return false;
        }

        if let Some(required_depth) = self.depth
            && depth != required_depth
        {
            return false;
        }

        if let Some(markers) = &self.markers
            && !markers.iter().all(|m| url.contains(m.as_str()))
        {
            return false;
        }

        match &self.patterns {
            None => true,
            Some(patterns) if patterns.is_empty() => true,
            Some(patterns) => {
                if !self.compiled_patterns.is_empty() {
                    self.compiled_patterns.iter().any(|re| re.is_match(url))
                } else {
                    // Filter not validated yet; compile on the fly
                    patterns
                        .iter()
                        .any(|p| Regex::new(p).is_ok_and(|re| re.is_match(url)))
                }
            }
        }
    }
}

/// Explicit follow-on phase for a URL after the current phase completes.
///
/// The target phase's own filter is not re-checked; the transition is an
/// explicit edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub next_phase_id: String,
    #[serde(default)]
    pub condition: Option<Condition>,
}

/// Conditions shared by phase transitions and the `conditional` node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    ElementExists { selector: String },
    VarEquals { name: String, value: serde_json::Value },
    ResponseStatusIn { statuses: Vec<u16> },
}

/// A typed unit of work within a phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub output_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Linear,
    Exponential,
}

/// Per-node retry policy applied after recovery's single retry is spent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Delay before the given retry attempt (1-based)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let ms = match self.backoff {
            Backoff::Linear => self.delay_ms.saturating_mul(u64::from(attempt)),
            Backoff::Exponential => self
                .delay_ms
                .saturating_mul(1u64 << attempt.min(16).saturating_sub(1)),
        };
        std::time::Duration::from_millis(ms)
    }
}
