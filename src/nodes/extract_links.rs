//! `extract_links` operator
//!
//! Pulls matching anchors out of the current DOM, resolves them against
//! the page's final URL and surfaces them for the executor to enqueue.
//! Page-level de-duplication only keeps the output small; the queue's
//! fingerprint dedup is the real mechanism.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

use super::{DiscoveredUrl, ExecutionInput, ExecutionOutput, NodeError, NodeExecutor, NodeType};
use crate::selector::SelectorError;

fn default_url_type() -> String {
    "page".to_string()
}

#[derive(Debug, Deserialize)]
struct Params {
    selector: String,
    #[serde(default = "default_url_type")]
    url_type: String,
    #[serde(default)]
    limit: Option<usize>,
}

pub struct ExtractLinksExecutor;

/// Shared with `paginate`: collect absolute, http(s), de-duplicated
/// links matched by `selector`.
pub(crate) fn collect_links(
    html: &Html,
    selector: &str,
    base: &url::Url,
    limit: Option<usize>,
) -> Result<Vec<String>, NodeError> {
    let parsed = Selector::parse(selector)
        .map_err(|_| NodeError::Selector(SelectorError::InvalidSelector(selector.to_string())))?;

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for element in html.select(&parsed) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Ok(absolute) = base.join(href) else {
            continue;
        };
        if !matches!(absolute.scheme(), "http" | "https") {
            continue;
        }
        let absolute = absolute.to_string();
        if seen.insert(absolute.clone()) {
            links.push(absolute);
            if limit.is_some_and(|l| links.len() >= l) {
                break;
            }
        }
    }
    Ok(links)
}

#[async_trait]
impl NodeExecutor for ExtractLinksExecutor {
    fn node_type(&self) -> NodeType {
        NodeType::ExtractLinks
    }

    fn validate(&self, params: &Value) -> Result<(), NodeError> {
        let params: Params = serde_json::from_value(params.clone())
            .map_err(|e| NodeError::InvalidParams(e.to_string()))?;
        Selector::parse(&params.selector).map_err(|_| {
            NodeError::InvalidParams(format!("invalid selector '{}'", params.selector))
        })?;
        Ok(())
    }

    async fn execute(&self, input: &mut ExecutionInput<'_>) -> Result<ExecutionOutput, NodeError> {
        let params: Params = input.parse_params()?;
        input.cancel.check()?;

        let base = input.effective_base().await;
        let html = Html::parse_document(&input.browser.html().await?);
        let links = collect_links(&html, &params.selector, &base, params.limit)?;

        debug!(
            "extract_links: {} links via '{}' on {}",
            links.len(),
            params.selector,
            base
        );

        Ok(ExecutionOutput {
            discovered: links
                .into_iter()
                .map(|url| DiscoveredUrl { url, url_type: params.url_type.clone() })
                .collect(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LISTING: &str = r#"
        <html><body>
            <a class="product" href="/p/1">One</a>
            <a class="product" href="/p/2">Two</a>
            <a class="product" href="/p/1#reviews">One again</a>
            <a class="product" href="mailto:x@example.com">Mail</a>
            <a class="other" href="/about">About</a>
        </body></html>
    "#;

    #[test]
    fn validate_checks_selector_syntax() {
        let executor = ExtractLinksExecutor;
        assert!(executor.validate(&json!({ "selector": "a.product" })).is_ok());
        assert!(executor.validate(&json!({ "selector": ":::" })).is_err());
        assert!(executor.validate(&json!({})).is_err());
    }

    #[test]
    fn collect_links_resolves_and_dedups() {
        let html = Html::parse_document(LISTING);
        let base = url::Url::parse("https://shop.example.com/cat/kettles").unwrap();
        let links = collect_links(&html, "a.product", &base, None).unwrap();
        assert_eq!(
            links,
            vec![
                "https://shop.example.com/p/1",
                "https://shop.example.com/p/2",
                "https://shop.example.com/p/1#reviews",
            ]
        );
    }

    #[test]
    fn collect_links_respects_limit() {
        let html = Html::parse_document(LISTING);
        let base = url::Url::parse("https://shop.example.com/").unwrap();
        let links = collect_links(&html, "a.product", &base, Some(1)).unwrap();
        assert_eq!(links.len(), 1);
    }
}
