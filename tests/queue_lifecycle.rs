//! Queue invariants exercised end-to-end against a real database file

use std::time::Duration;

use crawlflow::queue::{
    AckOutcome, EnqueueOutcome, EnqueuePolicy, EnqueueRequest, UrlQueue, UrlStatus,
};
use crawlflow::storage::{Database, ExtractedItem, ItemSink};
use tempfile::TempDir;

async fn open_queue() -> (TempDir, Database, UrlQueue) {
    let dir = TempDir::new().unwrap();
    let db = Database::open(&dir.path().join("engine.sqlite")).await.unwrap();
    let queue = UrlQueue::new(db.pool().clone());
    (dir, db, queue)
}

fn child_of(parent_id: &str, url: &str) -> EnqueueRequest {
    EnqueueRequest {
        url: url.to_string(),
        url_type: "product".to_string(),
        depth: 1,
        parent_url_id: Some(parent_id.to_string()),
        discovered_by_node: Some("links".to_string()),
    }
}

#[tokio::test]
async fn dedup_across_parents_keeps_first_discovery() {
    let (_dir, _db, queue) = open_queue().await;
    let policy = EnqueuePolicy::default();

    // Two category pages, both linking to the same product
    let parent_a = match queue
        .enqueue("ex", EnqueueRequest::seed("https://x/cat/a"), policy)
        .await
        .unwrap()
    {
        EnqueueOutcome::Inserted(id) => id,
        other => panic!("unexpected {other:?}"),
    };
    let parent_b = match queue
        .enqueue("ex", EnqueueRequest::seed("https://x/cat/b"), policy)
        .await
        .unwrap()
    {
        EnqueueOutcome::Inserted(id) => id,
        other => panic!("unexpected {other:?}"),
    };

    let first = queue
        .enqueue("ex", child_of(&parent_a, "https://x/p/1"), policy)
        .await
        .unwrap();
    assert!(matches!(first, EnqueueOutcome::Inserted(_)));

    let second = queue
        .enqueue("ex", child_of(&parent_b, "https://x/p/1"), policy)
        .await
        .unwrap();
    assert_eq!(second, EnqueueOutcome::Duplicate);

    // Exactly one row for the product, attributed to the first parent
    let rows = queue.list("ex").await.unwrap();
    let products: Vec<_> = rows.iter().filter(|r| r.url == "https://x/p/1").collect();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].parent_url_id.as_deref(), Some(parent_a.as_str()));
    assert_eq!(products[0].depth, 1);
    assert_eq!(products[0].discovered_by_node.as_deref(), Some("links"));
}

#[tokio::test]
async fn child_depth_is_parent_plus_one() {
    let (_dir, _db, queue) = open_queue().await;
    let policy = EnqueuePolicy { max_depth: Some(5), max_total: None };

    let seed_id = match queue
        .enqueue("ex", EnqueueRequest::seed("https://x/"), policy)
        .await
        .unwrap()
    {
        EnqueueOutcome::Inserted(id) => id,
        other => panic!("unexpected {other:?}"),
    };
    let seed = queue.get(&seed_id).await.unwrap().unwrap();
    assert_eq!(seed.depth, 0);
    assert_eq!(seed.url_type, "seed");

    queue
        .enqueue(
            "ex",
            EnqueueRequest {
                url: "https://x/child".to_string(),
                url_type: "category".to_string(),
                depth: seed.depth + 1,
                parent_url_id: Some(seed.id.clone()),
                discovered_by_node: Some("links".to_string()),
            },
            policy,
        )
        .await
        .unwrap();

    let rows = queue.list("ex").await.unwrap();
    for row in rows.iter().filter(|r| r.parent_url_id.is_some()) {
        let parent_id = row.parent_url_id.as_ref().unwrap();
        let parent = queue.get(parent_id).await.unwrap().unwrap();
        assert_eq!(row.depth, parent.depth + 1);
    }
}

#[tokio::test]
async fn stats_conserve_counts_through_the_lifecycle() {
    let (_dir, _db, queue) = open_queue().await;
    let policy = EnqueuePolicy::default();

    for i in 0..6 {
        queue
            .enqueue("ex", EnqueueRequest::seed(format!("https://x/{i}")), policy)
            .await
            .unwrap();
    }

    let check = |stats: crawlflow::queue::QueueStats| {
        assert_eq!(
            stats.completed + stats.failed + stats.skipped,
            stats.total() - stats.pending - stats.processing
        );
    };

    check(queue.stats("ex").await.unwrap());

    let a = queue.dequeue("ex", "w1", Duration::from_secs(60)).await.unwrap().unwrap();
    let b = queue.dequeue("ex", "w2", Duration::from_secs(60)).await.unwrap().unwrap();
    check(queue.stats("ex").await.unwrap());

    queue.ack(&a.id, AckOutcome::Completed, None).await.unwrap();
    queue.ack(&b.id, AckOutcome::Failed, Some("HTTP 500")).await.unwrap();
    let c = queue.dequeue("ex", "w1", Duration::from_secs(60)).await.unwrap().unwrap();
    queue.ack(&c.id, AckOutcome::Skipped, Some("no phase matched")).await.unwrap();

    let stats = queue.stats("ex").await.unwrap();
    check(stats);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.processing, 0);

    let failed_row = queue.get(&b.id).await.unwrap().unwrap();
    assert_eq!(failed_row.status, UrlStatus::Failed);
    assert_eq!(failed_row.error_message.as_deref(), Some("HTTP 500"));
}

#[tokio::test]
async fn expired_lease_claimed_exactly_once_even_under_contention() {
    let (_dir, _db, queue) = open_queue().await;
    queue
        .enqueue("ex", EnqueueRequest::seed("https://x/"), EnqueuePolicy::default())
        .await
        .unwrap();

    let original = queue
        .dequeue("ex", "dying-worker", Duration::from_millis(0))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Many workers race for the expired lease
    let mut claims = Vec::new();
    for i in 0..8 {
        let queue = queue.clone();
        claims.push(tokio::spawn(async move {
            queue
                .dequeue("ex", &format!("racer-{i}"), Duration::from_secs(60))
                .await
                .unwrap()
        }));
    }
    let mut winners = 0;
    for claim in claims {
        if claim.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "an expired lease must be reclaimed exactly once");

    let row = queue.get(&original.id).await.unwrap().unwrap();
    assert_eq!(row.attempts, 2);
}

#[tokio::test]
async fn items_reconcile_with_node_execution_counts() {
    let (_dir, db, queue) = open_queue().await;
    let url_id = match queue
        .enqueue("ex", EnqueueRequest::seed("https://x/p/1"), EnqueuePolicy::default())
        .await
        .unwrap()
    {
        EnqueueOutcome::Inserted(id) => id,
        other => panic!("unexpected {other:?}"),
    };

    let nodes = db.node_executions();
    let record_id = nodes.start("ex", &url_id, "extract", "extract").await.unwrap();

    let sink = crawlflow::storage::DatabaseItemSink::new(db.pool().clone());
    let item = ExtractedItem::from_record(
        "ex",
        &url_id,
        Some(&record_id),
        "product",
        Some("product_v1"),
        serde_json::json!({ "title": "Kettle", "price": 24.9 })
            .as_object()
            .cloned()
            .unwrap(),
    );
    sink.emit(&item).await.unwrap();
    nodes
        .finish(
            &record_id,
            crawlflow::storage::NodeRunStatus::Completed,
            crawlflow::storage::NodeRunOutcome {
                urls_discovered: 0,
                items_extracted: 1,
                error_message: None,
            },
        )
        .await.unwrap();

    let recorded: u64 = nodes
        .list_for_url(&url_id)
        .await
        .unwrap()
        .iter()
        .map(|r| r.items_extracted)
        .sum();
    assert_eq!(recorded, db.items().count_for_url(&url_id).await.unwrap());
}
