//! Workflow documents are accepted or rejected before execution starts

use crawlflow::nodes::NodeRegistry;
use crawlflow::workflow::{Workflow, WorkflowError, validate_workflow};
use serde_json::json;

fn shop_workflow() -> serde_json::Value {
    json!({
        "id": "shop-crawl",
        "name": "Category to product crawl",
        "start_urls": ["https://shop.example.com/"],
        "max_depth": 3,
        "max_pages": 500,
        "rate_limit_delay_ms": 250,
        "concurrent_workers": 3,
        "default_headers": { "accept-language": "en-US" },
        "phases": [
            {
                "id": "discover",
                "kind": "discovery",
                "url_filter": { "url_types": ["seed", "category"] },
                "nodes": [
                    { "id": "open", "type": "navigate", "params": {} },
                    {
                        "id": "cookie-banner",
                        "type": "conditional",
                        "dependencies": ["open"],
                        "optional": true,
                        "params": {
                            "condition": { "kind": "element_exists", "selector": "#consent" },
                            "if_true": [
                                { "type": "click", "params": { "selector": "#consent .accept" } }
                            ]
                        }
                    },
                    {
                        "id": "categories",
                        "type": "extract_links",
                        "dependencies": ["open"],
                        "params": { "selector": "nav a.category", "url_type": "category" }
                    },
                    {
                        "id": "products",
                        "type": "paginate",
                        "dependencies": ["categories"],
                        "params": {
                            "item_selector": "a.product",
                            "next_selector": "a.next",
                            "url_type": "product",
                            "max_pages": 5
                        }
                    }
                ]
            },
            {
                "id": "extract",
                "kind": "extraction",
                "url_filter": { "url_types": ["product"], "patterns": ["/p/\\d+"] },
                "nodes": [
                    { "id": "open", "type": "navigate", "params": {} },
                    {
                        "id": "details",
                        "type": "extract",
                        "dependencies": ["open"],
                        "retry": { "max_retries": 2, "delay_ms": 500, "backoff": "exponential" },
                        "params": {
                            "schema_name": "product_v1",
                            "item_type": "product",
                            "fields": {
                                "title": { "selector": "h1#name", "required": true },
                                "price": {
                                    "selector": ".price",
                                    "transform": [
                                        { "op": "regex_replace", "pattern": "[^0-9.]", "replacement": "" },
                                        { "op": "parse_float" }
                                    ]
                                }
                            }
                        }
                    }
                ]
            }
        ]
    })
}

#[test]
fn full_document_parses_and_validates() {
    let mut workflow: Workflow = serde_json::from_value(shop_workflow()).unwrap();
    let registry = NodeRegistry::standard();
    validate_workflow(&mut workflow, &registry).unwrap();

    assert_eq!(workflow.phases.len(), 2);
    assert_eq!(workflow.phases[1].url_filter.compiled_patterns.len(), 1);
    assert!(workflow.select_phase("https://shop.example.com/", "seed", 0).is_some());
    assert_eq!(
        workflow
            .select_phase("https://shop.example.com/p/42", "product", 2)
            .map(|p| p.id.as_str()),
        Some("extract")
    );
}

#[test]
fn unknown_node_types_fail_at_parse_time() {
    let mut doc = shop_workflow();
    doc["phases"][0]["nodes"][0]["type"] = json!("teleport");
    assert!(serde_json::from_value::<Workflow>(doc).is_err());
}

#[test]
fn bad_node_params_fail_validation() {
    let mut doc = shop_workflow();
    // extract with neither fields nor extractions
    doc["phases"][1]["nodes"][1]["params"] = json!({});
    let mut workflow: Workflow = serde_json::from_value(doc).unwrap();
    let err = validate_workflow(&mut workflow, &NodeRegistry::standard()).unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidNodeParams { .. }));
}

#[test]
fn dangling_transition_is_rejected() {
    let mut doc = shop_workflow();
    doc["phases"][0]["transition"] = json!({ "next_phase_id": "nowhere" });
    let mut workflow: Workflow = serde_json::from_value(doc).unwrap();
    let err = validate_workflow(&mut workflow, &NodeRegistry::standard()).unwrap_err();
    assert!(matches!(err, WorkflowError::UnknownTransitionTarget { .. }));
}

#[test]
fn dependency_cycle_is_rejected() {
    let mut doc = shop_workflow();
    doc["phases"][0]["nodes"][0]["dependencies"] = json!(["products"]);
    let mut workflow: Workflow = serde_json::from_value(doc).unwrap();
    let err = validate_workflow(&mut workflow, &NodeRegistry::standard()).unwrap_err();
    assert!(matches!(err, WorkflowError::DependencyCycle { .. }));
}

#[test]
fn seeds_must_be_absolute() {
    let mut doc = shop_workflow();
    doc["start_urls"] = json!(["shop.example.com"]);
    let mut workflow: Workflow = serde_json::from_value(doc).unwrap();
    let err = validate_workflow(&mut workflow, &NodeRegistry::standard()).unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidStartUrl { .. }));
}
