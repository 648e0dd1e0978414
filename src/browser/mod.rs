//! Browser layer: launching, pooling and page-scoped primitives
//!
//! [`BrowserPool`] bounds the number of live rendering contexts and hands
//! them out behind an RAII guard; [`BrowserContext`] wraps one page and
//! exposes the primitives node executors run against (navigate, click,
//! type, scroll, wait, extract HTML, screenshot). Headed sessions for the
//! interactive selector tool bypass the pool and auto-release on idle.

mod context;
mod pool;
mod setup;
mod stealth;

pub use context::{BrowserContext, ResponseInfo, ScrollTarget, WaitState};
pub use pool::{BrowserPool, BrowserPoolConfig, PooledContextGuard};
pub use setup::{find_browser_executable, launch_browser};
pub use stealth::StealthLevel;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("browser pool exhausted: no context became available within {0:?}")]
    Exhausted(std::time::Duration),

    #[error("browser pool is closed")]
    Closed,

    #[error("acquire canceled")]
    Canceled,

    #[error("failed to launch browser: {0}")]
    Launch(String),
}

/// Page-level failures surfaced by [`BrowserContext`] primitives
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("selector '{0}' matched no element")]
    SelectorNotFound(String),

    #[error("browser engine error: {0}")]
    Engine(String),
}

impl From<chromiumoxide::error::CdpError> for BrowserError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        Self::Engine(e.to_string())
    }
}
