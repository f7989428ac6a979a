//! Store access for Rallykit: trait seams over the primary relational store,
//! the authoring provider, and sync-run history, with Postgres, HTTP and
//! in-memory implementations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use rallykit_core::{
    BudgetRange, BundleProduct, BundleTotals, CampaignBundle, Category, Product, SyncCounts,
    SyncRun, SyncStatus, SyncTrigger, TargetAudience,
};

pub const CRATE_NAME: &str = "rallykit-storage";

/// Embedded schema migrations, applied by `rallykit-cli migrate`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("query failed: {0}")]
    Query(String),
    #[error("row decode failed: {0}")]
    Decode(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Self::Unavailable(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Decode(err.to_string())
            }
            other => Self::Query(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// Bounds an I/O-bound store call so a hung backend cannot stall a caller
/// past its latency budget.
pub async fn with_timeout<T, F>(budget: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(budget_ms = budget.as_millis() as u64, "store call timed out");
            Err(StoreError::Timeout(budget))
        }
    }
}

/// Exponential backoff schedule for retried operations.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Whether an upsert touched the target row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn as_counts(self) -> SyncCounts {
        match self {
            Self::Created => SyncCounts { created: 1, ..Default::default() },
            Self::Updated => SyncCounts { updated: 1, ..Default::default() },
            Self::Unchanged => SyncCounts { skipped: 1, ..Default::default() },
        }
    }
}

/// Partial update of a bundle's own fields; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct BundleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub target_audience: Option<TargetAudience>,
    pub budget_range: Option<BudgetRange>,
    pub popularity: Option<i32>,
    pub is_active: Option<bool>,
    pub is_featured: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub products: Option<Vec<BundleProduct>>,
}

/// Read access to live products. Products are mutated outside this subsystem.
#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn get_product(&self, id: &str) -> Result<Option<Product>, StoreError>;
    async fn health(&self) -> Result<(), StoreError>;
}

/// The primary read/write tier: bundles, their product rows, and the catalog
/// tables the sync job imports into.
#[async_trait]
pub trait BundleStore: Send + Sync {
    async fn list_bundles(&self) -> Result<Vec<CampaignBundle>, StoreError>;
    async fn get_bundle(&self, id: &str) -> Result<Option<CampaignBundle>, StoreError>;
    async fn bundle_products(&self, bundle_id: &str) -> Result<Vec<BundleProduct>, StoreError>;
    async fn create_bundle(&self, bundle: &CampaignBundle) -> Result<(), StoreError>;
    async fn update_bundle(&self, id: &str, update: &BundleUpdate) -> Result<bool, StoreError>;
    /// Deletes the bundle and, by cascade, its product rows.
    async fn delete_bundle(&self, id: &str) -> Result<bool, StoreError>;
    async fn remove_bundle_product(
        &self,
        bundle_id: &str,
        product_id: &str,
    ) -> Result<bool, StoreError>;
    async fn update_totals(&self, bundle_id: &str, totals: BundleTotals)
        -> Result<bool, StoreError>;
    async fn upsert_product(&self, product: &Product) -> Result<UpsertOutcome, StoreError>;
    async fn upsert_category(&self, category: &Category) -> Result<UpsertOutcome, StoreError>;
    async fn upsert_bundle(&self, bundle: &CampaignBundle) -> Result<UpsertOutcome, StoreError>;
    async fn health(&self) -> Result<(), StoreError>;
}

/// Secondary, authoritative-but-slower provider. Read-only.
#[async_trait]
pub trait AuthoringStore: Send + Sync {
    async fn list_products(&self) -> Result<Vec<Product>, StoreError>;
    async fn list_categories(&self) -> Result<Vec<Category>, StoreError>;
    async fn list_bundles(&self) -> Result<Vec<CampaignBundle>, StoreError>;
    async fn get_bundle(&self, id: &str) -> Result<Option<CampaignBundle>, StoreError>;
    async fn health(&self) -> Result<(), StoreError>;
}

/// Durable sync-run history; finalized runs are never mutated again.
#[async_trait]
pub trait SyncRunStore: Send + Sync {
    async fn record_start(&self, run: &SyncRun) -> Result<(), StoreError>;
    async fn finalize(&self, run: &SyncRun) -> Result<(), StoreError>;
    async fn recent(&self, limit: i64) -> Result<Vec<SyncRun>, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

/// All primary-store traits implemented over one connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Applies the embedded migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Query(err.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn bundle_from_row(row: &sqlx::postgres::PgRow) -> Result<CampaignBundle, StoreError> {
        let audience: String = row.try_get("target_audience")?;
        let budget: String = row.try_get("budget_range")?;
        let tags_json: serde_json::Value = row.try_get("tags_json")?;
        Ok(CampaignBundle {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            target_audience: TargetAudience::parse(&audience)
                .ok_or_else(|| StoreError::Decode(format!("unknown audience {audience:?}")))?,
            budget_range: BudgetRange::parse(&budget)
                .ok_or_else(|| StoreError::Decode(format!("unknown budget range {budget:?}")))?,
            products: Vec::new(),
            estimated_total: row.try_get("estimated_total")?,
            original_total: row.try_get("original_total")?,
            savings: row.try_get("savings")?,
            popularity: row.try_get("popularity")?,
            is_active: row.try_get("is_active")?,
            is_featured: row.try_get("is_featured")?,
            tags: serde_json::from_value(tags_json)
                .map_err(|err| StoreError::Decode(err.to_string()))?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn bundle_product_from_row(row: &sqlx::postgres::PgRow) -> Result<BundleProduct, StoreError> {
        Ok(BundleProduct {
            product_id: row.try_get("product_id")?,
            name: row.try_get("name")?,
            quantity: row.try_get::<i32, _>("quantity")? as u32,
            custom_price: row.try_get("custom_price")?,
            is_required: row.try_get("is_required")?,
            display_order: row.try_get("display_order")?,
        })
    }

    async fn insert_bundle_rows(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        bundle_id: &str,
        rows: &[BundleProduct],
    ) -> Result<(), StoreError> {
        for bp in rows {
            sqlx::query(
                "INSERT INTO bundle_products \
                 (bundle_id, product_id, name, quantity, custom_price, is_required, display_order) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(bundle_id)
            .bind(&bp.product_id)
            .bind(&bp.name)
            .bind(bp.quantity as i32)
            .bind(bp.custom_price)
            .bind(bp.is_required)
            .bind(bp.display_order)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn attach_products(
        &self,
        bundles: &mut [CampaignBundle],
    ) -> Result<(), StoreError> {
        if bundles.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = bundles.iter().map(|b| b.id.clone()).collect();
        let rows = sqlx::query(
            "SELECT bundle_id, product_id, name, quantity, custom_price, is_required, display_order \
             FROM bundle_products WHERE bundle_id = ANY($1) ORDER BY display_order ASC, id ASC",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_bundle: HashMap<String, Vec<BundleProduct>> = HashMap::new();
        for row in &rows {
            let bundle_id: String = row.try_get("bundle_id")?;
            by_bundle
                .entry(bundle_id)
                .or_default()
                .push(Self::bundle_product_from_row(row)?);
        }
        for bundle in bundles.iter_mut() {
            bundle.products = by_bundle.remove(&bundle.id).unwrap_or_default();
        }
        Ok(())
    }
}

#[async_trait]
impl ProductStore for PgStore {
    async fn get_product(&self, id: &str) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query("SELECT id, name, base_price, is_active FROM products WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(Product {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                base_price: row.try_get("base_price")?,
                is_active: row.try_get("is_active")?,
            })
        })
        .transpose()
    }

    async fn health(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl BundleStore for PgStore {
    async fn list_bundles(&self) -> Result<Vec<CampaignBundle>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, description, target_audience, budget_range, estimated_total, \
             original_total, savings, popularity, is_active, is_featured, tags_json, \
             created_at, updated_at FROM campaign_bundles ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut bundles = rows
            .iter()
            .map(Self::bundle_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        self.attach_products(&mut bundles).await?;
        Ok(bundles)
    }

    async fn get_bundle(&self, id: &str) -> Result<Option<CampaignBundle>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, description, target_audience, budget_range, estimated_total, \
             original_total, savings, popularity, is_active, is_featured, tags_json, \
             created_at, updated_at FROM campaign_bundles WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let mut bundles = vec![Self::bundle_from_row(&row)?];
                self.attach_products(&mut bundles).await?;
                Ok(bundles.pop())
            }
            None => Ok(None),
        }
    }

    async fn bundle_products(&self, bundle_id: &str) -> Result<Vec<BundleProduct>, StoreError> {
        let rows = sqlx::query(
            "SELECT bundle_id, product_id, name, quantity, custom_price, is_required, display_order \
             FROM bundle_products WHERE bundle_id = $1 ORDER BY display_order ASC, id ASC",
        )
        .bind(bundle_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::bundle_product_from_row).collect()
    }

    async fn create_bundle(&self, bundle: &CampaignBundle) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO campaign_bundles \
             (id, name, description, target_audience, budget_range, estimated_total, \
              original_total, savings, popularity, is_active, is_featured, tags_json, \
              created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(&bundle.id)
        .bind(&bundle.name)
        .bind(&bundle.description)
        .bind(bundle.target_audience.as_str())
        .bind(bundle.budget_range.as_str())
        .bind(bundle.estimated_total)
        .bind(bundle.original_total)
        .bind(bundle.savings)
        .bind(bundle.popularity)
        .bind(bundle.is_active)
        .bind(bundle.is_featured)
        .bind(serde_json::json!(bundle.tags))
        .bind(bundle.created_at)
        .bind(bundle.updated_at)
        .execute(&mut *tx)
        .await?;
        Self::insert_bundle_rows(&mut tx, &bundle.id, &bundle.products).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_bundle(&self, id: &str, update: &BundleUpdate) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE campaign_bundles SET \
             name = COALESCE($2, name), \
             description = COALESCE($3, description), \
             target_audience = COALESCE($4, target_audience), \
             budget_range = COALESCE($5, budget_range), \
             popularity = COALESCE($6, popularity), \
             is_active = COALESCE($7, is_active), \
             is_featured = COALESCE($8, is_featured), \
             tags_json = COALESCE($9, tags_json), \
             updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(update.name.as_deref())
        .bind(update.description.as_deref())
        .bind(update.target_audience.map(|a| a.as_str()))
        .bind(update.budget_range.map(|b| b.as_str()))
        .bind(update.popularity)
        .bind(update.is_active)
        .bind(update.is_featured)
        .bind(update.tags.as_ref().map(|t| serde_json::json!(t)))
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        if let Some(rows) = &update.products {
            sqlx::query("DELETE FROM bundle_products WHERE bundle_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            Self::insert_bundle_rows(&mut tx, id, rows).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn delete_bundle(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM campaign_bundles WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_bundle_product(
        &self,
        bundle_id: &str,
        product_id: &str,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM bundle_products WHERE bundle_id = $1 AND product_id = $2")
                .bind(bundle_id)
                .bind(product_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_totals(
        &self,
        bundle_id: &str,
        totals: BundleTotals,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE campaign_bundles SET estimated_total = $2, original_total = $3, \
             savings = $4, updated_at = NOW() WHERE id = $1",
        )
        .bind(bundle_id)
        .bind(totals.estimated_total)
        .bind(totals.original_total)
        .bind(totals.savings)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_product(&self, product: &Product) -> Result<UpsertOutcome, StoreError> {
        match self.get_product(&product.id).await? {
            Some(ref current) if current == product => Ok(UpsertOutcome::Unchanged),
            Some(_) => {
                sqlx::query(
                    "UPDATE products SET name = $2, base_price = $3, is_active = $4 WHERE id = $1",
                )
                .bind(&product.id)
                .bind(&product.name)
                .bind(product.base_price)
                .bind(product.is_active)
                .execute(&self.pool)
                .await?;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                sqlx::query(
                    "INSERT INTO products (id, name, base_price, is_active) VALUES ($1, $2, $3, $4)",
                )
                .bind(&product.id)
                .bind(&product.name)
                .bind(product.base_price)
                .bind(product.is_active)
                .execute(&self.pool)
                .await?;
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn upsert_category(&self, category: &Category) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query("SELECT id, name, slug, is_active FROM categories WHERE id = $1")
            .bind(&category.id)
            .fetch_optional(&self.pool)
            .await?;
        let existing = row
            .map(|row| {
                Ok::<_, StoreError>(Category {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    slug: row.try_get("slug")?,
                    is_active: row.try_get("is_active")?,
                })
            })
            .transpose()?;
        match existing {
            Some(ref current) if current == category => Ok(UpsertOutcome::Unchanged),
            Some(_) => {
                sqlx::query("UPDATE categories SET name = $2, slug = $3, is_active = $4 WHERE id = $1")
                    .bind(&category.id)
                    .bind(&category.name)
                    .bind(&category.slug)
                    .bind(category.is_active)
                    .execute(&self.pool)
                    .await?;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                sqlx::query(
                    "INSERT INTO categories (id, name, slug, is_active) VALUES ($1, $2, $3, $4)",
                )
                .bind(&category.id)
                .bind(&category.name)
                .bind(&category.slug)
                .bind(category.is_active)
                .execute(&self.pool)
                .await?;
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn upsert_bundle(&self, bundle: &CampaignBundle) -> Result<UpsertOutcome, StoreError> {
        let existing = self.get_bundle(&bundle.id).await?;
        match existing {
            Some(ref current) if bundle_content_eq(current, bundle) => Ok(UpsertOutcome::Unchanged),
            Some(_) => {
                let mut tx = self.pool.begin().await?;
                sqlx::query(
                    "UPDATE campaign_bundles SET name = $2, description = $3, \
                     target_audience = $4, budget_range = $5, estimated_total = $6, \
                     original_total = $7, savings = $8, popularity = $9, is_active = $10, \
                     is_featured = $11, tags_json = $12, updated_at = NOW() WHERE id = $1",
                )
                .bind(&bundle.id)
                .bind(&bundle.name)
                .bind(&bundle.description)
                .bind(bundle.target_audience.as_str())
                .bind(bundle.budget_range.as_str())
                .bind(bundle.estimated_total)
                .bind(bundle.original_total)
                .bind(bundle.savings)
                .bind(bundle.popularity)
                .bind(bundle.is_active)
                .bind(bundle.is_featured)
                .bind(serde_json::json!(bundle.tags))
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM bundle_products WHERE bundle_id = $1")
                    .bind(&bundle.id)
                    .execute(&mut *tx)
                    .await?;
                Self::insert_bundle_rows(&mut tx, &bundle.id, &bundle.products).await?;
                tx.commit().await?;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                self.create_bundle(bundle).await?;
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn health(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Field comparison for sync upserts; timestamps are store-managed and the
/// product rows are compared as ordered lists.
fn bundle_content_eq(a: &CampaignBundle, b: &CampaignBundle) -> bool {
    a.name == b.name
        && a.description == b.description
        && a.target_audience == b.target_audience
        && a.budget_range == b.budget_range
        && a.estimated_total == b.estimated_total
        && a.original_total == b.original_total
        && a.savings == b.savings
        && a.popularity == b.popularity
        && a.is_active == b.is_active
        && a.is_featured == b.is_featured
        && a.tags == b.tags
        && a.products == b.products
}

#[async_trait]
impl SyncRunStore for PgStore {
    async fn record_start(&self, run: &SyncRun) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_runs (id, trigger, started_at, completed_at, status, created, \
             updated, skipped, errors, retry_count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(run.id)
        .bind(run.trigger.as_str())
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.status.as_str())
        .bind(run.counts.created)
        .bind(run.counts.updated)
        .bind(run.counts.skipped)
        .bind(run.counts.errors)
        .bind(run.retry_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize(&self, run: &SyncRun) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sync_runs SET completed_at = $2, status = $3, created = $4, updated = $5, \
             skipped = $6, errors = $7, retry_count = $8 WHERE id = $1",
        )
        .bind(run.id)
        .bind(run.completed_at)
        .bind(run.status.as_str())
        .bind(run.counts.created)
        .bind(run.counts.updated)
        .bind(run.counts.skipped)
        .bind(run.counts.errors)
        .bind(run.retry_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<SyncRun>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, trigger, started_at, completed_at, status, created, updated, skipped, \
             errors, retry_count FROM sync_runs ORDER BY started_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let trigger: String = row.try_get("trigger")?;
                let status: String = row.try_get("status")?;
                Ok(SyncRun {
                    id: row.try_get::<Uuid, _>("id")?,
                    trigger: SyncTrigger::parse(&trigger)
                        .ok_or_else(|| StoreError::Decode(format!("unknown trigger {trigger:?}")))?,
                    started_at: row.try_get("started_at")?,
                    completed_at: row.try_get("completed_at")?,
                    status: SyncStatus::parse(&status)
                        .ok_or_else(|| StoreError::Decode(format!("unknown status {status:?}")))?,
                    counts: SyncCounts {
                        created: row.try_get("created")?,
                        updated: row.try_get("updated")?,
                        skipped: row.try_get("skipped")?,
                        errors: row.try_get("errors")?,
                    },
                    retry_count: row.try_get("retry_count")?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// HTTP authoring client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: T,
}

// The authoring API speaks camelCase JSON; these wire shapes convert into the
// core model at the boundary.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireProduct {
    id: String,
    name: String,
    base_price: i64,
    #[serde(default)]
    is_active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCategory {
    id: String,
    name: String,
    slug: String,
    #[serde(default)]
    is_active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBundleProduct {
    id: String,
    name: String,
    quantity: u32,
    #[serde(default)]
    custom_price: Option<i64>,
    #[serde(default)]
    is_required: bool,
    #[serde(default)]
    display_order: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBundle {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    target_audience: String,
    budget_range: String,
    #[serde(default)]
    products: Vec<WireBundleProduct>,
    #[serde(default)]
    estimated_total: i64,
    #[serde(default)]
    original_total: i64,
    #[serde(default)]
    savings: i64,
    #[serde(default)]
    popularity: i32,
    #[serde(default)]
    is_active: bool,
    #[serde(default)]
    is_featured: bool,
    #[serde(default)]
    tags: Vec<String>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl WireBundle {
    fn into_bundle(self) -> Result<CampaignBundle, StoreError> {
        Ok(CampaignBundle {
            target_audience: TargetAudience::parse(&self.target_audience).ok_or_else(|| {
                StoreError::Decode(format!("unknown audience {:?}", self.target_audience))
            })?,
            budget_range: BudgetRange::parse(&self.budget_range).ok_or_else(|| {
                StoreError::Decode(format!("unknown budget range {:?}", self.budget_range))
            })?,
            id: self.id,
            name: self.name,
            description: self.description,
            products: self
                .products
                .into_iter()
                .map(|p| BundleProduct {
                    product_id: p.id,
                    name: p.name,
                    quantity: p.quantity,
                    custom_price: p.custom_price,
                    is_required: p.is_required,
                    display_order: p.display_order,
                })
                .collect(),
            estimated_total: self.estimated_total,
            original_total: self.original_total,
            savings: self.savings,
            popularity: self.popularity,
            is_active: self.is_active,
            is_featured: self.is_featured,
            tags: self.tags,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Authoring store reached over HTTP with an explicit per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpAuthoringStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthoringStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(timeout)
            .build()
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, StoreError> {
        let url = format!("{}/{path}", self.base_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(StoreError::Unavailable(format!(
                "authoring status {} for {url}",
                resp.status()
            )));
        }
        let envelope: Envelope<T> = resp.json().await?;
        if !envelope.success {
            return Err(StoreError::Unavailable(format!(
                "authoring reported failure for {url}"
            )));
        }
        Ok(envelope.data)
    }
}

#[async_trait]
impl AuthoringStore for HttpAuthoringStore {
    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        let wire: Vec<WireProduct> = self.fetch("products").await?;
        Ok(wire
            .into_iter()
            .map(|p| Product {
                id: p.id,
                name: p.name,
                base_price: p.base_price,
                is_active: p.is_active,
            })
            .collect())
    }

    async fn list_categories(&self) -> Result<Vec<Category>, StoreError> {
        let wire: Vec<WireCategory> = self.fetch("categories").await?;
        Ok(wire
            .into_iter()
            .map(|c| Category {
                id: c.id,
                name: c.name,
                slug: c.slug,
                is_active: c.is_active,
            })
            .collect())
    }

    async fn list_bundles(&self) -> Result<Vec<CampaignBundle>, StoreError> {
        let wire: Vec<WireBundle> = self.fetch("campaign-bundles").await?;
        wire.into_iter().map(WireBundle::into_bundle).collect()
    }

    async fn get_bundle(&self, id: &str) -> Result<Option<CampaignBundle>, StoreError> {
        let url = format!("{}/campaign-bundles/{id}", self.base_url);
        let resp = self.client.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(StoreError::Unavailable(format!(
                "authoring status {} for {url}",
                resp.status()
            )));
        }
        let envelope: Envelope<WireBundle> = resp.json().await?;
        if !envelope.success {
            return Err(StoreError::Unavailable(format!(
                "authoring reported failure for {url}"
            )));
        }
        envelope.data.into_bundle().map(Some)
    }

    async fn health(&self) -> Result<(), StoreError> {
        // The authoring API has no dedicated liveness route; the product list
        // doubles as the health probe.
        let _: Vec<WireProduct> = self.fetch("products").await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementations (tests, local development)
// ---------------------------------------------------------------------------

/// Primary-store traits over process memory, mirroring `PgStore` semantics.
/// Used by tests and database-less local runs.
#[derive(Default)]
pub struct MemoryStore {
    products: Mutex<HashMap<String, Product>>,
    categories: Mutex<HashMap<String, Category>>,
    bundles: Mutex<HashMap<String, CampaignBundle>>,
    runs: Mutex<Vec<SyncRun>>,
    down: AtomicBool,
}

impl MemoryStore {
    pub async fn insert_product(&self, product: Product) {
        self.products.lock().await.insert(product.id.clone(), product);
    }

    pub async fn remove_product(&self, id: &str) {
        self.products.lock().await.remove(id);
    }

    pub async fn insert(&self, bundle: CampaignBundle) {
        self.bundles.lock().await.insert(bundle.id.clone(), bundle);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("primary store marked down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ProductStore for MemoryStore {
    async fn get_product(&self, id: &str) -> Result<Option<Product>, StoreError> {
        self.guard()?;
        Ok(self.products.lock().await.get(id).cloned())
    }

    async fn health(&self) -> Result<(), StoreError> {
        self.guard()
    }
}

#[async_trait]
impl BundleStore for MemoryStore {
    async fn list_bundles(&self) -> Result<Vec<CampaignBundle>, StoreError> {
        self.guard()?;
        let mut bundles: Vec<_> = self.bundles.lock().await.values().cloned().collect();
        bundles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(bundles)
    }

    async fn get_bundle(&self, id: &str) -> Result<Option<CampaignBundle>, StoreError> {
        self.guard()?;
        Ok(self.bundles.lock().await.get(id).cloned())
    }

    async fn bundle_products(&self, bundle_id: &str) -> Result<Vec<BundleProduct>, StoreError> {
        self.guard()?;
        Ok(self
            .bundles
            .lock()
            .await
            .get(bundle_id)
            .map(|b| b.products.clone())
            .unwrap_or_default())
    }

    async fn create_bundle(&self, bundle: &CampaignBundle) -> Result<(), StoreError> {
        self.guard()?;
        self.bundles
            .lock()
            .await
            .insert(bundle.id.clone(), bundle.clone());
        Ok(())
    }

    async fn update_bundle(&self, id: &str, update: &BundleUpdate) -> Result<bool, StoreError> {
        self.guard()?;
        let mut bundles = self.bundles.lock().await;
        let Some(bundle) = bundles.get_mut(id) else {
            return Ok(false);
        };
        if let Some(name) = &update.name {
            bundle.name = name.clone();
        }
        if let Some(description) = &update.description {
            bundle.description = description.clone();
        }
        if let Some(audience) = update.target_audience {
            bundle.target_audience = audience;
        }
        if let Some(budget) = update.budget_range {
            bundle.budget_range = budget;
        }
        if let Some(popularity) = update.popularity {
            bundle.popularity = popularity;
        }
        if let Some(active) = update.is_active {
            bundle.is_active = active;
        }
        if let Some(featured) = update.is_featured {
            bundle.is_featured = featured;
        }
        if let Some(tags) = &update.tags {
            bundle.tags = tags.clone();
        }
        if let Some(products) = &update.products {
            bundle.products = products.clone();
        }
        bundle.updated_at = Utc::now();
        Ok(true)
    }

    async fn delete_bundle(&self, id: &str) -> Result<bool, StoreError> {
        self.guard()?;
        Ok(self.bundles.lock().await.remove(id).is_some())
    }

    async fn remove_bundle_product(
        &self,
        bundle_id: &str,
        product_id: &str,
    ) -> Result<bool, StoreError> {
        self.guard()?;
        let mut bundles = self.bundles.lock().await;
        let Some(bundle) = bundles.get_mut(bundle_id) else {
            return Ok(false);
        };
        let before = bundle.products.len();
        bundle.products.retain(|p| p.product_id != product_id);
        Ok(bundle.products.len() != before)
    }

    async fn update_totals(
        &self,
        bundle_id: &str,
        totals: BundleTotals,
    ) -> Result<bool, StoreError> {
        self.guard()?;
        let mut bundles = self.bundles.lock().await;
        let Some(bundle) = bundles.get_mut(bundle_id) else {
            return Ok(false);
        };
        bundle.estimated_total = totals.estimated_total;
        bundle.original_total = totals.original_total;
        bundle.savings = totals.savings;
        bundle.updated_at = Utc::now();
        Ok(true)
    }

    async fn upsert_product(&self, product: &Product) -> Result<UpsertOutcome, StoreError> {
        self.guard()?;
        let mut products = self.products.lock().await;
        match products.get(&product.id) {
            Some(current) if current == product => Ok(UpsertOutcome::Unchanged),
            Some(_) => {
                products.insert(product.id.clone(), product.clone());
                Ok(UpsertOutcome::Updated)
            }
            None => {
                products.insert(product.id.clone(), product.clone());
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn upsert_category(&self, category: &Category) -> Result<UpsertOutcome, StoreError> {
        self.guard()?;
        let mut categories = self.categories.lock().await;
        match categories.get(&category.id) {
            Some(current) if current == category => Ok(UpsertOutcome::Unchanged),
            Some(_) => {
                categories.insert(category.id.clone(), category.clone());
                Ok(UpsertOutcome::Updated)
            }
            None => {
                categories.insert(category.id.clone(), category.clone());
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn upsert_bundle(&self, bundle: &CampaignBundle) -> Result<UpsertOutcome, StoreError> {
        self.guard()?;
        let mut bundles = self.bundles.lock().await;
        match bundles.get(&bundle.id) {
            Some(current) if bundle_content_eq(current, bundle) => Ok(UpsertOutcome::Unchanged),
            Some(_) => {
                bundles.insert(bundle.id.clone(), bundle.clone());
                Ok(UpsertOutcome::Updated)
            }
            None => {
                bundles.insert(bundle.id.clone(), bundle.clone());
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn health(&self) -> Result<(), StoreError> {
        self.guard()
    }
}

#[derive(Default)]
pub struct MemoryAuthoringStore {
    products: Mutex<Vec<Product>>,
    categories: Mutex<Vec<Category>>,
    bundles: Mutex<Vec<CampaignBundle>>,
    down: AtomicBool,
}

impl MemoryAuthoringStore {
    pub async fn set_products(&self, products: Vec<Product>) {
        *self.products.lock().await = products;
    }

    pub async fn set_categories(&self, categories: Vec<Category>) {
        *self.categories.lock().await = categories;
    }

    pub async fn set_bundles(&self, bundles: Vec<CampaignBundle>) {
        *self.bundles.lock().await = bundles;
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("authoring store marked down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AuthoringStore for MemoryAuthoringStore {
    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        self.guard()?;
        Ok(self.products.lock().await.clone())
    }

    async fn list_categories(&self) -> Result<Vec<Category>, StoreError> {
        self.guard()?;
        Ok(self.categories.lock().await.clone())
    }

    async fn list_bundles(&self) -> Result<Vec<CampaignBundle>, StoreError> {
        self.guard()?;
        Ok(self.bundles.lock().await.clone())
    }

    async fn get_bundle(&self, id: &str) -> Result<Option<CampaignBundle>, StoreError> {
        self.guard()?;
        Ok(self
            .bundles
            .lock()
            .await
            .iter()
            .find(|b| b.id == id)
            .cloned())
    }

    async fn health(&self) -> Result<(), StoreError> {
        self.guard()
    }
}

#[async_trait]
impl SyncRunStore for MemoryStore {
    async fn record_start(&self, run: &SyncRun) -> Result<(), StoreError> {
        self.guard()?;
        self.runs.lock().await.push(run.clone());
        Ok(())
    }

    async fn finalize(&self, run: &SyncRun) -> Result<(), StoreError> {
        self.guard()?;
        let mut runs = self.runs.lock().await;
        if let Some(slot) = runs.iter_mut().find(|r| r.id == run.id) {
            *slot = run.clone();
        } else {
            runs.push(run.clone());
        }
        Ok(())
    }

    async fn recent(&self, limit: i64) -> Result<Vec<SyncRun>, StoreError> {
        self.guard()?;
        let mut runs = self.runs.lock().await.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }
}
