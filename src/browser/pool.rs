//! Bounded pool of rendering contexts
//!
//! Each pooled slot is a full browser process with its own profile
//! directory, so leases are isolated from one another. `acquire` blocks
//! on a semaphore until a slot frees up or the deadline passes; released
//! contexts are reset (blank page, cleared cookies, auxiliary tabs
//! closed) before they are handed out again, and a context that fails
//! its reset or health check is destroyed and replaced lazily.
//!
//! Headed sessions for the interactive selector tool bypass the pool:
//! they get a dedicated short-lived browser that auto-closes after an
//! idle period.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::BrowserContext;
use super::setup::launch_browser;
use super::{BrowserError, PoolError};

#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    /// Maximum concurrently leased contexts
    pub pool_size: usize,
    /// Pooled browsers run headless; headed sessions ignore this
    pub headless: bool,
    /// Default deadline for `acquire`
    pub acquire_timeout: Duration,
    /// Idle time after which a headed session auto-closes
    pub headed_idle_timeout: Duration,
    /// Explicit executable, overriding discovery
    pub chrome_executable: Option<PathBuf>,
    /// Proxy rotation list; the active index is advanced by recovery
    pub proxies: Vec<String>,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            headless: true,
            acquire_timeout: Duration::from_secs(30),
            headed_idle_timeout: Duration::from_secs(120),
            chrome_executable: None,
            proxies: Vec::new(),
        }
    }
}

impl BrowserPoolConfig {
    #[must_use]
    pub fn from_engine(config: &crate::config::EngineConfig) -> Self {
        Self {
            pool_size: config.pool_size(),
            headless: config.headless(),
            acquire_timeout: config.acquire_timeout(),
            headed_idle_timeout: config.headed_idle_timeout(),
            chrome_executable: config.chrome_executable().cloned(),
            proxies: config.proxies().to_vec(),
        }
    }
}

/// One pooled browser process with its page-scoped context
struct PooledSlot {
    id: u64,
    browser: chromiumoxide::Browser,
    handler: JoinHandle<()>,
    context: BrowserContext,
    // Held for its Drop: removes the profile directory
    _profile_dir: TempDir,
}

impl PooledSlot {
    async fn health_check(&self) -> bool {
        self.browser.version().await.is_ok()
    }

    async fn teardown(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Failed to close browser {}: {}", self.id, e);
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
    }
}

pub struct BrowserPool {
    config: BrowserPoolConfig,
    permits: Arc<Semaphore>,
    available: Mutex<VecDeque<PooledSlot>>,
    next_id: AtomicU64,
    /// Index into `config.proxies` used for newly launched browsers
    proxy_index: AtomicUsize,
    closed: AtomicBool,
}

impl BrowserPool {
    #[must_use]
    pub fn new(config: BrowserPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.pool_size)),
            available: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(0),
            proxy_index: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Advance to the next proxy in the rotation.
    ///
    /// Only newly launched browsers pick up the change; leased contexts
    /// keep their proxy until recycled.
    pub fn rotate_proxy(&self) -> Option<String> {
        if self.config.proxies.is_empty() {
            return None;
        }
        let next = self.proxy_index.fetch_add(1, Ordering::Relaxed) + 1;
        let proxy = self.config.proxies[next % self.config.proxies.len()].clone();
        info!("Proxy rotation advanced to {proxy}");
        Some(proxy)
    }

    fn current_proxy(&self) -> Option<String> {
        if self.config.proxies.is_empty() {
            return None;
        }
        let idx = self.proxy_index.load(Ordering::Relaxed) % self.config.proxies.len();
        Some(self.config.proxies[idx].clone())
    }

    /// Acquire a context, waiting up to `timeout` for a free slot.
    ///
    /// Uses the configured acquire timeout when `timeout` is `None`.
    pub async fn acquire(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> Result<PooledContextGuard, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let deadline = timeout.unwrap_or(self.config.acquire_timeout);

        let permit = tokio::time::timeout(deadline, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| PoolError::Exhausted(deadline))?
            .map_err(|_| PoolError::Closed)?;

        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        // Reuse a healthy idle slot if one exists
        loop {
            let slot = self.available.lock().await.pop_front();
            match slot {
                Some(slot) => {
                    if slot.health_check().await {
                        debug!("Acquired pooled browser {}", slot.id);
                        return Ok(PooledContextGuard {
                            slot: Some(slot),
                            pool: Arc::clone(self),
                            _permit: permit,
                        });
                    }
                    warn!("Browser {} failed health check, destroying", slot.id);
                    slot.teardown().await;
                }
                None => break,
            }
        }

        let slot = self.launch_slot(self.config.headless).await?;
        debug!("Launched pooled browser {}", slot.id);
        Ok(PooledContextGuard {
            slot: Some(slot),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    async fn launch_slot(&self, headless: bool) -> Result<PooledSlot, PoolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let profile_dir = tempfile::Builder::new()
            .prefix("crawlflow_profile_")
            .tempdir()
            .map_err(|e| PoolError::Launch(format!("profile dir: {e}")))?;

        let proxy = self.current_proxy();
        let (browser, handler) = launch_browser(
            headless,
            self.config.chrome_executable.clone(),
            profile_dir.path().to_path_buf(),
            proxy.as_deref(),
        )
        .await
        .map_err(|e| PoolError::Launch(e.to_string()))?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| PoolError::Launch(format!("initial page: {e}")))?;

        Ok(PooledSlot {
            id,
            browser,
            handler,
            context: BrowserContext::new(page),
            _profile_dir: profile_dir,
        })
    }

    /// Dedicated headed browser for an interactive selector session.
    ///
    /// Not pooled: closes itself after the configured idle period unless
    /// `touch`ed, and immediately on `close`.
    pub async fn headed_session(self: &Arc<Self>) -> Result<HeadedSession, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let slot = self.launch_slot(false).await?;
        let last_used = Arc::new(parking_lot::Mutex::new(Instant::now()));
        let closed = Arc::new(AtomicBool::new(false));

        let session = HeadedSession {
            slot: Arc::new(Mutex::new(Some(slot))),
            last_used: Arc::clone(&last_used),
            closed: Arc::clone(&closed),
        };

        let idle_timeout = self.config.headed_idle_timeout;
        let watchdog_session = session.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                if watchdog_session.closed.load(Ordering::Acquire) {
                    break;
                }
                let idle_for = watchdog_session.last_used.lock().elapsed();
                if idle_for >= idle_timeout {
                    info!("Headed session idle for {idle_for:?}, auto-releasing");
                    watchdog_session.close().await;
                    break;
                }
            }
        });

        Ok(session)
    }

    fn release(self: &Arc<Self>, slot: PooledSlot) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            if pool.closed.load(Ordering::Acquire) {
                slot.teardown().await;
                return;
            }
            match pool.reset_slot(&slot).await {
                Ok(()) => {
                    debug!("Browser {} reset and returned to pool", slot.id);
                    pool.available.lock().await.push_back(slot);
                }
                Err(e) => {
                    warn!("Browser {} failed reset ({e}), destroying", slot.id);
                    slot.teardown().await;
                }
            }
        });
    }

    async fn reset_slot(&self, slot: &PooledSlot) -> Result<(), BrowserError> {
        slot.context.reset().await?;

        // Close any auxiliary tabs opened during the lease
        if let Ok(pages) = slot.browser.pages().await {
            // First page is the context's own
            for extra in pages.into_iter().skip(1) {
                let _ = extra.close().await;
            }
        }
        Ok(())
    }

    /// Tear the pool down; subsequent acquires fail with `PoolClosed`.
    pub async fn shutdown(&self) {
        info!("Shutting down browser pool");
        self.closed.store(true, Ordering::Release);
        self.permits.close();

        let mut available = self.available.lock().await;
        while let Some(slot) = available.pop_front() {
            slot.teardown().await;
        }
        info!("Browser pool shutdown complete");
    }
}

/// RAII lease over a pooled context; releases (with reset) on drop
pub struct PooledContextGuard {
    slot: Option<PooledSlot>,
    pool: Arc<BrowserPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledContextGuard {
    #[must_use]
    pub fn context(&self) -> &BrowserContext {
        &self
            .slot
            .as_ref()
            .expect("slot present until drop")
            .context
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.slot.as_ref().expect("slot present until drop").id
    }
}

impl Drop for PooledContextGuard {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}

/// Dedicated headed browser for interactive selector work
#[derive(Clone)]
pub struct HeadedSession {
    slot: Arc<Mutex<Option<PooledSlot>>>,
    last_used: Arc<parking_lot::Mutex<Instant>>,
    closed: Arc<AtomicBool>,
}

impl HeadedSession {
    /// Mark the session active, deferring the idle auto-release
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Run an operation against the session's context
    pub async fn with_context<F, T>(&self, f: F) -> Result<T, PoolError>
    where
        F: for<'a> FnOnce(&'a BrowserContext) -> futures::future::BoxFuture<'a, T>,
    {
        self.touch();
        let guard = self.slot.lock().await;
        let slot = guard.as_ref().ok_or(PoolError::Closed)?;
        Ok(f(&slot.context).await)
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(slot) = self.slot.lock().await.take() {
            slot.teardown().await;
        }
    }
}
