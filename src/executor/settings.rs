//! Per-execution mutable settings
//!
//! Workers read a consistent snapshot at the top of each iteration;
//! recovery actions are the only writers, through the handle. The lock
//! is held only for field reads/writes, never across awaits.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

use crate::nodes::{CancelToken, NodeError};

/// The mutable record itself
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// Worker cap; lowering it makes surplus workers exit at their next
    /// iteration
    pub concurrent_workers: usize,
    /// Per-request pacing delay
    pub rate_limit_delay_ms: u64,
    /// Scales navigation and node timeouts
    pub timeout_multiplier: f64,
    /// Quiesced by a `pause_execution` action
    pub paused: bool,
}

impl ExecutionSettings {
    #[must_use]
    pub fn new(concurrent_workers: usize, rate_limit_delay_ms: u64) -> Self {
        Self {
            concurrent_workers: concurrent_workers.max(1),
            rate_limit_delay_ms,
            timeout_multiplier: 1.0,
            paused: false,
        }
    }
}

/// Immutable view a worker holds for one iteration
#[derive(Debug, Clone, Copy)]
pub struct SettingsSnapshot {
    pub concurrent_workers: usize,
    pub rate_limit_delay_ms: u64,
    pub timeout_multiplier: f64,
    pub paused: bool,
}

impl SettingsSnapshot {
    /// Base duration scaled by the current multiplier
    #[must_use]
    pub fn effective_timeout(&self, base: Duration) -> Duration {
        base.mul_f64(self.timeout_multiplier.max(0.1))
    }
}

/// Guarded handle shared by workers and the recovery applier
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<ExecutionSettings>>,
    resumed: Arc<Notify>,
}

impl SettingsHandle {
    #[must_use]
    pub fn new(settings: ExecutionSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
            resumed: Arc::new(Notify::new()),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SettingsSnapshot {
        let guard = self.inner.read();
        SettingsSnapshot {
            concurrent_workers: guard.concurrent_workers,
            rate_limit_delay_ms: guard.rate_limit_delay_ms,
            timeout_multiplier: guard.timeout_multiplier,
            paused: guard.paused,
        }
    }

    pub fn set_worker_cap(&self, count: usize) {
        let mut guard = self.inner.write();
        let count = count.max(1);
        if guard.concurrent_workers != count {
            info!("Worker cap {} -> {}", guard.concurrent_workers, count);
            guard.concurrent_workers = count;
        }
    }

    pub fn add_rate_delay(&self, ms: u64) {
        let mut guard = self.inner.write();
        guard.rate_limit_delay_ms = guard.rate_limit_delay_ms.saturating_add(ms);
        info!("Rate delay raised to {}ms", guard.rate_limit_delay_ms);
    }

    /// Multiply the timeout multiplier (recovery `adjust_timeout`)
    pub fn scale_timeout(&self, multiplier: f64) {
        let mut guard = self.inner.write();
        guard.timeout_multiplier = (guard.timeout_multiplier * multiplier).clamp(0.1, 20.0);
        info!("Timeout multiplier now {:.2}", guard.timeout_multiplier);
    }

    pub fn pause(&self) {
        let mut guard = self.inner.write();
        if !guard.paused {
            info!("Execution paused");
            guard.paused = true;
        }
    }

    pub fn resume(&self) {
        {
            let mut guard = self.inner.write();
            if !guard.paused {
                return;
            }
            info!("Execution resumed");
            guard.paused = false;
        }
        self.resumed.notify_waiters();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.read().paused
    }

    /// Block while paused, observing cancellation
    pub async fn wait_if_paused(&self, cancel: &CancelToken) -> Result<(), NodeError> {
        while self.is_paused() {
            cancel.check()?;
            tokio::select! {
                () = self.resumed.notified() => {}
                () = cancel.canceled() => return Err(NodeError::Canceled),
                // Re-check periodically in case resume raced the notify
                () = tokio::time::sleep(Duration::from_millis(250)) => {}
            }
        }
        Ok(())
    }
}
