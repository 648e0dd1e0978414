//! Core configuration types for the crawler engine

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the optional AI recovery backend.
///
/// When present, the rules engine falls back to the configured endpoint
/// for failures no rule matches. Keys are rotated on quota errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiBackendConfig {
    /// HTTPS endpoint implementing the solution-proposal API
    pub endpoint: String,
    /// Model identifier passed through to the backend
    pub model: String,
    /// API keys, rotated round-robin when the backend reports quota exhaustion
    pub api_keys: Vec<String>,
    /// Hard timeout for a single proposal call
    pub timeout_secs: u64,
}

impl AiBackendConfig {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_keys: Vec::new(),
            timeout_secs: 20,
        }
    }
}

/// Process-level configuration for the crawler engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database file backing the queue and all audit tables.
    ///
    /// **INVARIANT:** Always an absolute path (normalized in builder).
    pub(crate) database_path: PathBuf,

    /// Maximum rendering contexts alive at once
    pub(crate) pool_size: usize,

    /// Run pooled browsers headless. Headed sessions for the interactive
    /// selector tool bypass the pool regardless of this flag.
    pub(crate) headless: bool,

    /// How long `acquire` blocks before reporting pool exhaustion
    pub(crate) acquire_timeout_secs: u64,

    /// Idle time after which a dedicated headed session auto-releases
    pub(crate) headed_idle_timeout_secs: u64,

    /// Worker count used when a workflow does not specify its own
    pub(crate) default_concurrent_workers: usize,

    /// Lease duration stamped on dequeued URLs
    pub(crate) lease_ms: u64,

    /// Base sleep between polls of an empty queue (jittered)
    pub(crate) dequeue_backoff_ms: u64,

    /// Base timeout for `page.goto` + load, before the recovery multiplier
    pub(crate) navigation_timeout_secs: u64,

    /// Base per-node timeout, before the recovery multiplier
    pub(crate) node_timeout_secs: u64,

    /// HTTP statuses classified as navigation errors (inclusive range).
    /// Redirects are followed transparently; only the final status is
    /// checked against this range.
    pub(crate) error_status_from: u16,
    pub(crate) error_status_to: u16,

    /// Proxy rotation list consumed by the `rotate_proxy` recovery action
    pub(crate) proxies: Vec<String>,

    /// Whether failures are routed through the recovery subsystem at all
    pub(crate) recovery_enabled: bool,

    /// Optional AI fallback for the rules engine
    pub(crate) ai_backend: Option<AiBackendConfig>,

    /// Explicit Chrome/Chromium executable, overriding discovery
    pub(crate) chrome_executable: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./crawlflow.sqlite"),
            pool_size: 5,
            headless: true,
            acquire_timeout_secs: 30,
            headed_idle_timeout_secs: 120,
            default_concurrent_workers: 5,
            lease_ms: 60_000,
            dequeue_backoff_ms: 500,
            navigation_timeout_secs: 30,
            node_timeout_secs: 30,
            error_status_from: 400,
            error_status_to: 599,
            proxies: Vec::new(),
            recovery_enabled: true,
            ai_backend: None,
            chrome_executable: None,
        }
    }
}

impl EngineConfig {
    /// Start building a config; the database path is required.
    #[must_use]
    pub fn builder() -> super::builder::EngineConfigBuilder {
        super::builder::EngineConfigBuilder::new()
    }

    #[must_use]
    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    #[must_use]
    pub fn headless(&self) -> bool {
        self.headless
    }

    #[must_use]
    pub fn acquire_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.acquire_timeout_secs)
    }

    #[must_use]
    pub fn headed_idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.headed_idle_timeout_secs)
    }

    #[must_use]
    pub fn default_concurrent_workers(&self) -> usize {
        self.default_concurrent_workers
    }

    #[must_use]
    pub fn lease_ms(&self) -> u64 {
        self.lease_ms
    }

    #[must_use]
    pub fn dequeue_backoff_ms(&self) -> u64 {
        self.dequeue_backoff_ms
    }

    #[must_use]
    pub fn navigation_timeout_secs(&self) -> u64 {
        self.navigation_timeout_secs
    }

    #[must_use]
    pub fn node_timeout_secs(&self) -> u64 {
        self.node_timeout_secs
    }

    /// Whether a final HTTP status counts as a navigation error
    #[must_use]
    pub fn is_error_status(&self, status: u16) -> bool {
        status >= self.error_status_from && status <= self.error_status_to
    }

    #[must_use]
    pub fn proxies(&self) -> &[String] {
        &self.proxies
    }

    #[must_use]
    pub fn recovery_enabled(&self) -> bool {
        self.recovery_enabled
    }

    #[must_use]
    pub fn ai_backend(&self) -> Option<&AiBackendConfig> {
        self.ai_backend.as_ref()
    }

    #[must_use]
    pub fn chrome_executable(&self) -> Option<&PathBuf> {
        self.chrome_executable.as_ref()
    }
}
