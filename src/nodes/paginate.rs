//! `paginate` operator
//!
//! A bounded loop over a listing: on each page the item links are
//! collected for enqueueing, then the loop advances through a "next"
//! control (click), a numbered page link, or whichever of the two is
//! available (`auto`). The loop stops at `max_pages`, when the advance
//! target is missing or disabled, or when navigation fails; items
//! already collected are still surfaced.
//!
//! Cross-page duplicate items are left to the queue's fingerprint dedup.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

use super::extract_links::collect_links;
use super::{DiscoveredUrl, ExecutionInput, ExecutionOutput, NodeError, NodeExecutor, NodeType};

fn default_url_type() -> String {
    "item".to_string()
}

fn default_max_pages() -> u32 {
    10
}

fn default_wait_after_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum AdvanceMode {
    Click,
    Link,
    #[default]
    Auto,
}

#[derive(Debug, Deserialize)]
struct Params {
    /// Element clicked to advance ("next" button)
    #[serde(default)]
    next_selector: Option<String>,
    /// Numbered page links, used when there is no next control
    #[serde(default)]
    link_selector: Option<String>,
    #[serde(default, rename = "type")]
    mode: AdvanceMode,
    /// Links to collect from every page
    item_selector: String,
    #[serde(default = "default_url_type")]
    url_type: String,
    #[serde(default = "default_max_pages")]
    max_pages: u32,
    #[serde(default = "default_wait_after_ms")]
    wait_after_ms: u64,
}

pub struct PaginateExecutor;

/// Whether the advance control in this snapshot is present and enabled
fn advance_control_state(html: &Html, selector: &str) -> Result<ControlState, NodeError> {
    let parsed = Selector::parse(selector)
        .map_err(|_| NodeError::InvalidParams(format!("invalid selector '{selector}'")))?;
    let Some(element) = html.select(&parsed).next() else {
        return Ok(ControlState::Missing);
    };
    let value = element.value();
    let disabled = value.attr("disabled").is_some()
        || value.attr("aria-disabled") == Some("true")
        || value
            .attr("class")
            .is_some_and(|classes| classes.split_whitespace().any(|c| c.contains("disabled")));
    Ok(if disabled { ControlState::Disabled } else { ControlState::Ready })
}

#[derive(Debug, PartialEq, Eq)]
enum ControlState {
    Ready,
    Disabled,
    Missing,
}

/// Find the link for page `target_page` among numbered page links
fn numbered_page_link(
    html: &Html,
    selector: &str,
    base: &url::Url,
    target_page: u32,
) -> Result<Option<String>, NodeError> {
    let parsed = Selector::parse(selector)
        .map_err(|_| NodeError::InvalidParams(format!("invalid selector '{selector}'")))?;
    let wanted = target_page.to_string();
    for element in html.select(&parsed) {
        let text: String = element.text().collect::<String>().trim().to_string();
        if text == wanted
            && let Some(href) = element.value().attr("href")
            && let Ok(absolute) = base.join(href)
        {
            return Ok(Some(absolute.to_string()));
        }
    }
    Ok(None)
}

#[async_trait]
impl NodeExecutor for PaginateExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::Paginate
    }

    fn validate(&self, params: &Value) -> Result<(), NodeError> {
        let params: Params = serde_json::from_value(params.clone())
            .map_err(|e| NodeError::InvalidParams(e.to_string()))?;
        Selector::parse(&params.item_selector).map_err(|_| {
            NodeError::InvalidParams(format!("invalid selector '{}'", params.item_selector))
        })?;
        match params.mode {
            AdvanceMode::Click if params.next_selector.is_none() => {
                return Err(NodeError::InvalidParams(
                    "paginate type \"click\" needs next_selector".to_string(),
                ));
            }
            AdvanceMode::Link if params.link_selector.is_none() => {
                return Err(NodeError::InvalidParams(
                    "paginate type \"link\" needs link_selector".to_string(),
                ));
            }
            AdvanceMode::Auto
                if params.next_selector.is_none() && params.link_selector.is_none() =>
            {
                return Err(NodeError::InvalidParams(
                    "paginate needs next_selector or link_selector".to_string(),
                ));
            }
            _ => {}
        }
        if params.max_pages == 0 {
            return Err(NodeError::InvalidParams("max_pages must be at least 1".to_string()));
        }
        Ok(())
    }

    async fn execute(&self, input: &mut ExecutionInput<'_>) -> Result<ExecutionOutput, NodeError> {
        let params: Params = input.parse_params()?;
        let wait_after = Duration::from_millis(params.wait_after_ms);

        let mut seen = HashSet::new();
        let mut discovered = Vec::new();
        let mut iterations = 0u32;

        'page: loop {
            input.cancel.check()?;

            let base = input.effective_base().await;

            // Scoped so the non-`Send` `Html` document is dropped before any
            // `.await` below (it would otherwise keep the enclosing future
            // non-`Send`).
            let (clickable, link_next_url) = {
                let html = Html::parse_document(&input.browser.html().await?);
                iterations += 1;

                for url in collect_links(&html, &params.item_selector, &base, None)? {
                    if seen.insert(url.clone()) {
                        discovered.push(DiscoveredUrl {
                            url,
                            url_type: params.url_type.clone(),
                        });
                    }
                }
                debug!(
                    "paginate: page {} collected {} links so far",
                    iterations,
                    discovered.len()
                );

                if iterations >= params.max_pages {
                    break 'page;
                }

                let clickable = match &params.next_selector {
                    Some(selector) if params.mode != AdvanceMode::Link => {
                        advance_control_state(&html, selector)?
                    }
                    _ => ControlState::Missing,
                };

                let is_link_branch = params.mode == AdvanceMode::Link
                    || (params.mode == AdvanceMode::Auto && clickable != ControlState::Ready);

                let link_next_url = if is_link_branch {
                    match &params.link_selector {
                        Some(selector) => {
                            numbered_page_link(&html, selector, &base, iterations + 1)?
                        }
                        None => None,
                    }
                } else {
                    None
                };

                (clickable, link_next_url)
            };

            let advanced = match (params.mode, clickable) {
                (AdvanceMode::Click, ControlState::Ready) | (AdvanceMode::Auto, ControlState::Ready) => {
                    let selector = params
                        .next_selector
                        .as_deref()
                        .unwrap_or_default();
                    match input.browser.click(selector).await {
                        Ok(()) => {
                            input.cancel.sleep(wait_after).await?;
                            true
                        }
                        Err(e) => {
                            debug!("paginate: advance click failed ({e}), stopping");
                            false
                        }
                    }
                }
                (AdvanceMode::Click, _) => false,
                _ => {
                    // Link advance: the numbered link for the next page
                    match link_next_url {
                        Some(next_url) => {
                            match input
                                .browser
                                .navigate(&next_url, input.navigation_timeout)
                                .await
                            {
                                Ok(response)
                                    if !input
                                        .error_statuses
                                        .contains(&response.status_code) =>
                                {
                                    input.cancel.sleep(wait_after).await?;
                                    true
                                }
                                Ok(response) => {
                                    debug!(
                                        "paginate: page {} returned {}, stopping",
                                        next_url, response.status_code
                                    );
                                    false
                                }
                                Err(e) => {
                                    debug!("paginate: navigation failed ({e}), stopping");
                                    false
                                }
                            }
                        }
                        None => false,
                    }
                }
            };

            if !advanced {
                break 'page;
            }
        }

        Ok(ExecutionOutput {
            discovered,
            iterations,
            ..Default::default()
        })
    }
}
