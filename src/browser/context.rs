//! Page-scoped browser primitives
//!
//! A [`BrowserContext`] wraps one page of a pooled browser and exposes
//! exactly the operations node executors need. Navigation captures the
//! final HTTP status and headers through a CDP response listener, so
//! redirects are followed transparently and only the final response is
//! reported.

use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::network::{
    ClearBrowserCookiesParams, CookieParam, EventResponseReceived, ResourceType,
    SetCookiesParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams,
};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use url::Url;

use super::BrowserError;
use super::stealth::{self, StealthLevel};

/// Final response metadata for a navigation
#[derive(Debug, Clone, Serialize)]
pub struct ResponseInfo {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub final_url: String,
    pub timing_ms: u64,
}

/// Element states a wait can target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Visible,
    Hidden,
    Attached,
}

/// Scroll destinations
#[derive(Debug, Clone, Copy)]
pub enum ScrollTarget {
    Position { x: i64, y: i64 },
    Bottom,
}

/// How long to keep draining buffered response events after load
const RESPONSE_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Poll interval for selector waits
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct BrowserContext {
    page: Page,
    last_response: parking_lot::Mutex<Option<ResponseInfo>>,
    stealth: parking_lot::Mutex<StealthLevel>,
}

impl BrowserContext {
    pub(crate) fn new(page: Page) -> Self {
        Self {
            page,
            last_response: parking_lot::Mutex::new(None),
            stealth: parking_lot::Mutex::new(StealthLevel::Off),
        }
    }

    /// Navigate and wait for the load to settle.
    ///
    /// The returned [`ResponseInfo`] describes the final document
    /// response after redirects. A missing response event (rare: some
    /// cached loads) is reported as status 200 with empty headers rather
    /// than an error.
    pub async fn navigate(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<ResponseInfo, BrowserError> {
        let started = Instant::now();

        let mut responses = self
            .page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| BrowserError::Engine(e.to_string()))?;

        tokio::time::timeout(timeout, self.page.goto(url))
            .await
            .map_err(|_| BrowserError::Timeout {
                operation: format!("navigation to {url}"),
                seconds: timeout.as_secs(),
            })?
            .map_err(|e| BrowserError::Navigation(e.to_string()))?;

        tokio::time::timeout(timeout, self.page.wait_for_navigation())
            .await
            .map_err(|_| BrowserError::Timeout {
                operation: format!("load of {url}"),
                seconds: timeout.as_secs(),
            })?
            .map_err(|e| BrowserError::Navigation(e.to_string()))?;

        let final_url = self
            .page
            .url()
            .await
            .map_err(|e| BrowserError::Engine(e.to_string()))?
            .unwrap_or_else(|| url.to_string());

        // Buffered Document responses are already queued on the listener;
        // drain briefly and keep the one matching the final URL.
        let mut document_response: Option<ResponseInfo> = None;
        let drain_deadline = Instant::now() + RESPONSE_DRAIN_TIMEOUT;
        loop {
            let remaining = drain_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, responses.next()).await {
                Ok(Some(event)) => {
                    if event.r#type != ResourceType::Document {
                        continue;
                    }
                    let info = ResponseInfo {
                        status_code: u16::try_from(event.response.status).unwrap_or(0),
                        headers: headers_to_map(event.response.headers.inner()),
                        final_url: event.response.url.clone(),
                        timing_ms: started.elapsed().as_millis() as u64,
                    };
                    let matches_final = urls_equivalent(&event.response.url, &final_url);
                    let replace = matches_final || document_response.is_none();
                    if replace {
                        document_response = Some(info);
                    }
                    if matches_final {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        let info = document_response.unwrap_or_else(|| {
            trace!("No document response event captured for {url}, assuming 200");
            ResponseInfo {
                status_code: 200,
                headers: HashMap::new(),
                final_url: final_url.clone(),
                timing_ms: started.elapsed().as_millis() as u64,
            }
        });

        debug!(
            "Navigated to {} -> {} ({} in {}ms)",
            url, info.final_url, info.status_code, info.timing_ms
        );
        *self.last_response.lock() = Some(info.clone());
        Ok(info)
    }

    /// Final status of the most recent navigation in this context
    #[must_use]
    pub fn last_http_status(&self) -> Option<u16> {
        self.last_response.lock().as_ref().map(|r| r.status_code)
    }

    /// Response metadata of the most recent navigation
    #[must_use]
    pub fn last_response(&self) -> Option<ResponseInfo> {
        self.last_response.lock().clone()
    }

    /// Current page URL as reported by the browser
    pub async fn current_url(&self) -> Result<Option<String>, BrowserError> {
        Ok(self.page.url().await?)
    }

    /// Full serialized DOM
    pub async fn html(&self) -> Result<String, BrowserError> {
        Ok(self.page.content().await?)
    }

    /// Snapshot of the live DOM for the selector tool
    pub async fn dom_snapshot(&self) -> Result<String, BrowserError> {
        self.html().await
    }

    pub async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::SelectorNotFound(selector.to_string()))?;
        element.click().await?;
        Ok(())
    }

    pub async fn hover(&self, selector: &str) -> Result<(), BrowserError> {
        if !self.element_exists(selector).await? {
            return Err(BrowserError::SelectorNotFound(selector.to_string()));
        }
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({selector});
                if (!el) return false;
                el.scrollIntoView({{ block: 'center' }});
                el.dispatchEvent(new MouseEvent('mouseover', {{ bubbles: true }}));
                el.dispatchEvent(new MouseEvent('mouseenter', {{ bubbles: true }}));
                return true;
            }})()"#,
            selector = serde_json::to_string(selector).unwrap_or_default()
        );
        self.page.evaluate(script).await?;
        Ok(())
    }

    /// Type into an element, optionally pausing between characters
    pub async fn type_text(
        &self,
        selector: &str,
        text: &str,
        delay_per_char: Duration,
    ) -> Result<(), BrowserError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::SelectorNotFound(selector.to_string()))?;
        element.click().await?;

        if delay_per_char.is_zero() {
            element.type_str(text).await?;
            return Ok(());
        }

        let mut buf = [0u8; 4];
        for ch in text.chars() {
            element.type_str(ch.encode_utf8(&mut buf)).await?;
            tokio::time::sleep(delay_per_char).await;
        }
        Ok(())
    }

    /// Scroll to a position or step toward the page bottom
    pub async fn scroll(
        &self,
        target: ScrollTarget,
        step_delay: Duration,
    ) -> Result<(), BrowserError> {
        match target {
            ScrollTarget::Position { x, y } => {
                self.page
                    .evaluate(format!("window.scrollTo({x}, {y})"))
                    .await?;
            }
            ScrollTarget::Bottom => {
                // Step down a viewport at a time so lazy content loads
                loop {
                    let done = self
                        .page
                        .evaluate(
                            "(() => { \
                                const before = window.scrollY; \
                                window.scrollBy(0, window.innerHeight); \
                                return window.scrollY === before; \
                            })()",
                        )
                        .await?
                        .into_value::<bool>()
                        .unwrap_or(true);
                    if done {
                        break;
                    }
                    tokio::time::sleep(step_delay).await;
                }
            }
        }
        Ok(())
    }

    pub async fn element_exists(&self, selector: &str) -> Result<bool, BrowserError> {
        Ok(self.page.find_element(selector).await.is_ok())
    }

    /// Wait until a selector reaches the requested state
    pub async fn wait_for_selector(
        &self,
        selector: &str,
        state: WaitState,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            let satisfied = match state {
                WaitState::Attached => self.element_exists(selector).await?,
                WaitState::Visible => self.element_visibility(selector).await?.unwrap_or(false),
                WaitState::Hidden => {
                    // Missing counts as hidden
                    !self.element_visibility(selector).await?.unwrap_or(false)
                }
            };
            if satisfied {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout {
                    operation: format!("wait for '{selector}' to become {state:?}"),
                    seconds: timeout.as_secs(),
                });
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// `None` when the element is not attached at all
    async fn element_visibility(&self, selector: &str) -> Result<Option<bool>, BrowserError> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({selector});
                if (!el) return null;
                const style = window.getComputedStyle(el);
                const rect = el.getBoundingClientRect();
                return style.display !== 'none'
                    && style.visibility !== 'hidden'
                    && rect.width > 0 && rect.height > 0;
            }})()"#,
            selector = serde_json::to_string(selector).unwrap_or_default()
        );
        let result = self.page.evaluate(script).await?;
        Ok(result.into_value::<Option<bool>>().unwrap_or(None))
    }

    pub async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, BrowserError> {
        let params = CaptureScreenshotParams {
            format: Some(CaptureScreenshotFormat::Png),
            capture_beyond_viewport: Some(full_page),
            ..Default::default()
        };
        Ok(self.page.screenshot(params).await?)
    }

    /// Apply an anti-detection profile; levels only escalate within one
    /// lease (re-applying a lower level is a no-op).
    pub async fn apply_stealth(&self, level: StealthLevel) -> Result<(), BrowserError> {
        {
            let current = self.stealth.lock();
            if *current >= level {
                return Ok(());
            }
        }
        stealth::inject(&self.page, level)
            .await
            .map_err(|e| BrowserError::Engine(e.to_string()))?;
        *self.stealth.lock() = level;
        Ok(())
    }

    /// Install headers sent with every subsequent request
    pub async fn set_extra_headers(
        &self,
        headers: &HashMap<String, String>,
    ) -> Result<(), BrowserError> {
        if headers.is_empty() {
            return Ok(());
        }
        use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
        let json = serde_json::to_value(headers)
            .map_err(|e| BrowserError::Engine(e.to_string()))?;
        self.page
            .execute(SetExtraHttpHeadersParams::new(Headers::new(json)))
            .await?;
        Ok(())
    }

    /// Install cookies scoped to the given URL
    pub async fn set_cookies(
        &self,
        url: &str,
        cookies: &HashMap<String, String>,
    ) -> Result<(), BrowserError> {
        if cookies.is_empty() {
            return Ok(());
        }
        let params: Vec<CookieParam> = cookies
            .iter()
            .map(|(name, value)| {
                let mut cookie = CookieParam::new(name.clone(), value.clone());
                cookie.url = Some(url.to_string());
                cookie
            })
            .collect();
        self.page.execute(SetCookiesParams::new(params)).await?;
        Ok(())
    }

    /// Reset for reuse by the next lease: blank page, cleared cookies.
    ///
    /// Failure here means the context should be destroyed, not reused.
    pub(crate) async fn reset(&self) -> Result<(), BrowserError> {
        self.page.goto("about:blank").await?;
        self.page
            .execute(ClearBrowserCookiesParams::default())
            .await?;
        *self.last_response.lock() = None;
        *self.stealth.lock() = StealthLevel::Off;
        Ok(())
    }

    pub async fn close(self) {
        if let Err(e) = self.page.close().await {
            warn!("Failed to close page: {e}");
        }
    }
}

fn headers_to_map(raw: &serde_json::Value) -> HashMap<String, String> {
    raw.as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.to_lowercase(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Loose equality for matching a response event to the landed URL:
/// fragments and trailing slashes differ between the two sources.
fn urls_equivalent(a: &str, b: &str) -> bool {
    fn strip(u: &str) -> String {
        match Url::parse(u) {
            Ok(mut parsed) => {
                parsed.set_fragment(None);
                parsed.to_string().trim_end_matches('/').to_string()
            }
            Err(_) => u.trim_end_matches('/').to_string(),
        }
    }
    strip(a) == strip(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_map_lowercases_keys() {
        let raw = serde_json::json!({ "Content-Type": "text/html", "ETag": "abc" });
        let map = headers_to_map(&raw);
        assert_eq!(map.get("content-type").map(String::as_str), Some("text/html"));
        assert_eq!(map.get("etag").map(String::as_str), Some("abc"));
    }

    #[test]
    fn url_equivalence_ignores_fragment_and_trailing_slash() {
        assert!(urls_equivalent(
            "https://example.com/page/",
            "https://example.com/page#top"
        ));
        assert!(!urls_equivalent(
            "https://example.com/a",
            "https://example.com/b"
        ));
    }
}
