//! Fluent builder for `EngineConfig`
//!
//! Validation happens once at build time so the hot paths never re-check
//! ranges: worker and pool counts are clamped to sane minimums, the
//! database path is made absolute, and the error-status range is ordered.

use anyhow::{Result, anyhow};
use std::path::PathBuf;

use super::types::{AiBackendConfig, EngineConfig};

#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    database_path: Option<PathBuf>,
    pool_size: Option<usize>,
    headless: Option<bool>,
    acquire_timeout_secs: Option<u64>,
    headed_idle_timeout_secs: Option<u64>,
    default_concurrent_workers: Option<usize>,
    lease_ms: Option<u64>,
    dequeue_backoff_ms: Option<u64>,
    navigation_timeout_secs: Option<u64>,
    node_timeout_secs: Option<u64>,
    error_status_range: Option<(u16, u16)>,
    proxies: Vec<String>,
    recovery_enabled: Option<bool>,
    ai_backend: Option<AiBackendConfig>,
    chrome_executable: Option<PathBuf>,
}

impl EngineConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    #[must_use]
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = Some(headless);
        self
    }

    #[must_use]
    pub fn acquire_timeout_secs(mut self, secs: u64) -> Self {
        self.acquire_timeout_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn headed_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.headed_idle_timeout_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn default_concurrent_workers(mut self, workers: usize) -> Self {
        self.default_concurrent_workers = Some(workers);
        self
    }

    #[must_use]
    pub fn lease_ms(mut self, ms: u64) -> Self {
        self.lease_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn dequeue_backoff_ms(mut self, ms: u64) -> Self {
        self.dequeue_backoff_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn navigation_timeout_secs(mut self, secs: u64) -> Self {
        self.navigation_timeout_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn node_timeout_secs(mut self, secs: u64) -> Self {
        self.node_timeout_secs = Some(secs);
        self
    }

    /// Inclusive range of final HTTP statuses treated as navigation errors
    #[must_use]
    pub fn error_status_range(mut self, from: u16, to: u16) -> Self {
        self.error_status_range = Some((from, to));
        self
    }

    #[must_use]
    pub fn proxies(mut self, proxies: Vec<String>) -> Self {
        self.proxies = proxies;
        self
    }

    #[must_use]
    pub fn recovery_enabled(mut self, enabled: bool) -> Self {
        self.recovery_enabled = Some(enabled);
        self
    }

    #[must_use]
    pub fn ai_backend(mut self, backend: AiBackendConfig) -> Self {
        self.ai_backend = Some(backend);
        self
    }

    #[must_use]
    pub fn chrome_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.chrome_executable = Some(path.into());
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        let defaults = EngineConfig::default();

        let database_path = self
            .database_path
            .ok_or_else(|| anyhow!("database_path is required"))?;
        let database_path = if database_path.is_absolute() {
            database_path
        } else {
            std::env::current_dir()
                .map_err(|e| anyhow!("Failed to resolve current directory: {e}"))?
                .join(database_path)
        };

        let (error_status_from, error_status_to) = self
            .error_status_range
            .unwrap_or((defaults.error_status_from, defaults.error_status_to));
        if error_status_from > error_status_to {
            return Err(anyhow!(
                "error status range is inverted: {error_status_from}..={error_status_to}"
            ));
        }

        if let Some(backend) = &self.ai_backend
            && backend.endpoint.is_empty()
        {
            return Err(anyhow!("AI backend endpoint must not be empty"));
        }

        Ok(EngineConfig {
            database_path,
            pool_size: self.pool_size.unwrap_or(defaults.pool_size).max(1),
            headless: self.headless.unwrap_or(defaults.headless),
            acquire_timeout_secs: self
                .acquire_timeout_secs
                .unwrap_or(defaults.acquire_timeout_secs),
            headed_idle_timeout_secs: self
                .headed_idle_timeout_secs
                .unwrap_or(defaults.headed_idle_timeout_secs),
            default_concurrent_workers: self
                .default_concurrent_workers
                .unwrap_or(defaults.default_concurrent_workers)
                .max(1),
            lease_ms: self.lease_ms.unwrap_or(defaults.lease_ms).max(1_000),
            dequeue_backoff_ms: self
                .dequeue_backoff_ms
                .unwrap_or(defaults.dequeue_backoff_ms)
                .max(10),
            navigation_timeout_secs: self
                .navigation_timeout_secs
                .unwrap_or(defaults.navigation_timeout_secs)
                .max(1),
            node_timeout_secs: self
                .node_timeout_secs
                .unwrap_or(defaults.node_timeout_secs)
                .max(1),
            error_status_from,
            error_status_to,
            proxies: self.proxies,
            recovery_enabled: self
                .recovery_enabled
                .unwrap_or(defaults.recovery_enabled),
            ai_backend: self.ai_backend,
            chrome_executable: self.chrome_executable,
        })
    }
}
