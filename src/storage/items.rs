//! Extracted items and the item sink
//!
//! Items are idempotent on `(execution_id, url_id, schema_name)`: a
//! worker that loses its lease mid-phase can re-emit without creating
//! duplicates, the later write wins. Well-known commerce fields get
//! their own columns; everything else rides in the `attributes` JSON.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::now_ms;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub id: String,
    pub execution_id: String,
    pub url_id: String,
    pub node_execution_id: Option<String>,
    pub item_type: String,
    /// Empty string means "no schema"; part of the idempotency key
    pub schema_name: String,
    pub title: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub availability: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub attributes: Map<String, Value>,
    pub extracted_at: i64,
}

impl ExtractedItem {
    /// Build an item from an extraction record, promoting well-known
    /// fields out of the attribute map.
    #[must_use]
    pub fn from_record(
        execution_id: &str,
        url_id: &str,
        node_execution_id: Option<&str>,
        item_type: &str,
        schema_name: Option<&str>,
        mut attributes: Map<String, Value>,
    ) -> Self {
        fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
            map.remove(key).and_then(|v| match v {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        }
        fn take_number(map: &mut Map<String, Value>, key: &str) -> Option<f64> {
            map.remove(key).and_then(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.parse().ok(),
                _ => None,
            })
        }

        let title = take_string(&mut attributes, "title");
        let price = take_number(&mut attributes, "price");
        let currency = take_string(&mut attributes, "currency");
        let availability = take_string(&mut attributes, "availability");
        let rating = take_number(&mut attributes, "rating");
        let review_count = take_number(&mut attributes, "review_count").map(|n| n as i64);

        Self {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            url_id: url_id.to_string(),
            node_execution_id: node_execution_id.map(str::to_string),
            item_type: item_type.to_string(),
            schema_name: schema_name.unwrap_or_default().to_string(),
            title,
            price,
            currency,
            availability,
            rating,
            review_count,
            attributes,
            extracted_at: now_ms(),
        }
    }
}

/// Destination for extracted items.
///
/// Implementations must be idempotent on
/// `(execution_id, url_id, schema_name)`.
#[async_trait]
pub trait ItemSink: Send + Sync {
    async fn emit(&self, item: &ExtractedItem) -> Result<()>;
}

/// The default sink: upserts into `extracted_items`
#[derive(Clone)]
pub struct DatabaseItemSink {
    repo: ItemsRepo,
}

impl DatabaseItemSink {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { repo: ItemsRepo::new(pool) }
    }
}

#[async_trait]
impl ItemSink for DatabaseItemSink {
    async fn emit(&self, item: &ExtractedItem) -> Result<()> {
        self.repo.upsert(item).await
    }
}

#[derive(Clone)]
pub struct ItemsRepo {
    pool: SqlitePool,
}

impl ItemsRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, item: &ExtractedItem) -> Result<()> {
        let attributes = serde_json::to_string(&item.attributes)
            .context("Failed to serialize item attributes")?;

        sqlx::query(
            r#"
            INSERT INTO extracted_items
                (id, execution_id, url_id, node_execution_id, item_type, schema_name,
                 title, price, currency, availability, rating, review_count,
                 attributes, extracted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (execution_id, url_id, schema_name) DO UPDATE SET
                node_execution_id = excluded.node_execution_id,
                item_type = excluded.item_type,
                title = excluded.title,
                price = excluded.price,
                currency = excluded.currency,
                availability = excluded.availability,
                rating = excluded.rating,
                review_count = excluded.review_count,
                attributes = excluded.attributes,
                extracted_at = excluded.extracted_at
            "#,
        )
        .bind(&item.id)
        .bind(&item.execution_id)
        .bind(&item.url_id)
        .bind(&item.node_execution_id)
        .bind(&item.item_type)
        .bind(&item.schema_name)
        .bind(&item.title)
        .bind(item.price)
        .bind(&item.currency)
        .bind(&item.availability)
        .bind(item.rating)
        .bind(item.review_count)
        .bind(attributes)
        .bind(item.extracted_at)
        .execute(&self.pool)
        .await
        .context("Failed to upsert extracted item")?;
        Ok(())
    }

    pub async fn count_for_execution(&self, execution_id: &str) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM extracted_items WHERE execution_id = ?")
                .bind(execution_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    pub async fn count_for_url(&self, url_id: &str) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM extracted_items WHERE url_id = ?")
                .bind(url_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    pub async fn list_for_execution(&self, execution_id: &str) -> Result<Vec<ExtractedItem>> {
        #[allow(clippy::type_complexity)]
        let rows: Vec<(
            String,
            String,
            String,
            Option<String>,
            String,
            String,
            Option<String>,
            Option<f64>,
            Option<String>,
            Option<String>,
            Option<f64>,
            Option<i64>,
            String,
            i64,
        )> = sqlx::query_as(
            r#"
            SELECT id, execution_id, url_id, node_execution_id, item_type, schema_name,
                   title, price, currency, availability, rating, review_count,
                   attributes, extracted_at
            FROM extracted_items
            WHERE execution_id = ?
            ORDER BY extracted_at ASC, id ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list extracted items")?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    id,
                    execution_id,
                    url_id,
                    node_execution_id,
                    item_type,
                    schema_name,
                    title,
                    price,
                    currency,
                    availability,
                    rating,
                    review_count,
                    attributes,
                    extracted_at,
                )| ExtractedItem {
                    id,
                    execution_id,
                    url_id,
                    node_execution_id,
                    item_type,
                    schema_name,
                    title,
                    price,
                    currency,
                    availability,
                    rating,
                    review_count,
                    attributes: serde_json::from_str(&attributes).unwrap_or_default(),
                    extracted_at,
                },
            )
            .collect())
    }
}
