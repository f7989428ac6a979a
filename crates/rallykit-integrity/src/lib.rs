//! Referential integrity for bundle-product relationships: validation,
//! orphan cleanup, and totals recalculation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use rallykit_core::{
    BundleProduct, BundleTotals, ProblemReference, ProductReferenceCheck, ReferenceIssue,
    ValidationReport,
};
use rallykit_storage::{BundleStore, ProductStore, StoreError};

pub const CRATE_NAME: &str = "rallykit-integrity";

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Classifies a bundle's product references against the live product store.
/// Read-only; safe to call repeatedly and concurrently.
pub struct ReferentialIntegrityValidator {
    products: Arc<dyn ProductStore>,
}

impl ReferentialIntegrityValidator {
    pub fn new(products: Arc<dyn ProductStore>) -> Self {
        Self { products }
    }

    pub async fn validate(
        &self,
        bundle_id: &str,
        rows: &[BundleProduct],
    ) -> Result<ValidationReport, StoreError> {
        let mut valid = Vec::new();
        let mut problems = Vec::new();
        let mut notes = Vec::new();

        for row in rows {
            match self.products.get_product(&row.product_id).await? {
                None => problems.push(ProblemReference {
                    product_id: row.product_id.clone(),
                    name: row.name.clone(),
                    issue: ReferenceIssue::Missing,
                    note: None,
                }),
                Some(product) if !product.is_active => problems.push(ProblemReference {
                    product_id: row.product_id.clone(),
                    name: row.name.clone(),
                    issue: ReferenceIssue::Inactive,
                    note: None,
                }),
                Some(product) => {
                    if product.name != row.name {
                        notes.push(format!(
                            "product {} renamed from {:?} to {:?} since it was attached",
                            row.product_id, row.name, product.name
                        ));
                    }
                    valid.push(row.product_id.clone());
                }
            }
        }

        let healthy = problems.is_empty();
        Ok(ValidationReport {
            bundle_id: bundle_id.to_string(),
            valid,
            problems,
            notes,
            healthy,
            checked_at: Utc::now(),
        })
    }

    /// Pre-attach check used by admin tooling before a product may join a
    /// bundle.
    pub async fn validate_product_reference(
        &self,
        product_id: &str,
    ) -> Result<ProductReferenceCheck, StoreError> {
        Ok(match self.products.get_product(product_id).await? {
            Some(product) => ProductReferenceCheck { exists: true, active: product.is_active },
            None => ProductReferenceCheck { exists: false, active: false },
        })
    }
}

// ---------------------------------------------------------------------------
// Totals recalculation
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RecalcError {
    #[error("bundle {0} not found")]
    BundleNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-bundle outcome of a batch recalculation; failures never abort
/// sibling bundles.
#[derive(Debug, Serialize)]
pub struct RecalcOutcome {
    pub bundle_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totals: Option<BundleTotals>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Recomputes a bundle's derived totals from its currently-resolving
/// references. Recalculations of the same bundle are serialized through a
/// keyed mutex so concurrent requests cannot interleave the read-modify-write
/// of the stored totals.
pub struct TotalsRecalculator {
    bundles: Arc<dyn BundleStore>,
    products: Arc<dyn ProductStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TotalsRecalculator {
    pub fn new(bundles: Arc<dyn BundleStore>, products: Arc<dyn ProductStore>) -> Self {
        Self { bundles, products, locks: Mutex::new(HashMap::new()) }
    }

    async fn lock_for(&self, bundle_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(bundle_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Idempotent: with no intervening writes, a second call yields the same
    /// totals and overwrites the stored values with them again.
    pub async fn recalculate(&self, bundle_id: &str) -> Result<BundleTotals, RecalcError> {
        let lock = self.lock_for(bundle_id).await;
        let _guard = lock.lock().await;

        let bundle = self
            .bundles
            .get_bundle(bundle_id)
            .await?
            .ok_or_else(|| RecalcError::BundleNotFound(bundle_id.to_string()))?;

        let mut estimated = 0i64;
        for row in &bundle.products {
            // Orphaned rows contribute nothing; inactive products still
            // resolve and keep their contribution until an admin removes them.
            if let Some(product) = self.products.get_product(&row.product_id).await? {
                estimated += row.subtotal(product.base_price);
            }
        }

        let totals = BundleTotals::derive(estimated, bundle.original_total);
        self.bundles.update_totals(bundle_id, totals).await?;
        info!(
            bundle_id,
            estimated_total = totals.estimated_total,
            savings = totals.savings,
            "bundle totals recalculated"
        );
        Ok(totals)
    }

    /// Recalculates each listed bundle, isolating failures per bundle.
    pub async fn recalculate_many(&self, bundle_ids: &[String]) -> Vec<RecalcOutcome> {
        let mut outcomes = Vec::with_capacity(bundle_ids.len());
        for bundle_id in bundle_ids {
            match self.recalculate(bundle_id).await {
                Ok(totals) => outcomes.push(RecalcOutcome {
                    bundle_id: bundle_id.clone(),
                    success: true,
                    totals: Some(totals),
                    error: None,
                }),
                Err(err) => {
                    warn!(bundle_id = %bundle_id, error = %err, "recalculation failed");
                    outcomes.push(RecalcOutcome {
                        bundle_id: bundle_id.clone(),
                        success: false,
                        totals: None,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        outcomes
    }
}

// ---------------------------------------------------------------------------
// Orphan cleanup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("bundle {0} not found")]
    BundleNotFound(String),
    #[error("recalculation after cleanup failed: {0}")]
    Recalc(#[from] RecalcError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    pub dry_run: bool,
    /// When set, remove exactly these rows instead of scanning for orphans.
    pub explicit_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct CleanupFailure {
    pub product_id: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct CleanupReport {
    pub bundle_id: String,
    pub removed: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<CleanupFailure>,
    pub dry_run: bool,
    /// Present when removals were applied and totals were recomputed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totals: Option<BundleTotals>,
}

/// Removes invalid references from a bundle, then recomputes its totals.
/// Removal-then-recalculation ordering is a hard invariant: applied cleanup
/// never returns with stale totals.
pub struct OrphanCleanupEngine {
    bundles: Arc<dyn BundleStore>,
    validator: ReferentialIntegrityValidator,
    recalculator: Arc<TotalsRecalculator>,
}

impl OrphanCleanupEngine {
    pub fn new(
        bundles: Arc<dyn BundleStore>,
        validator: ReferentialIntegrityValidator,
        recalculator: Arc<TotalsRecalculator>,
    ) -> Self {
        Self { bundles, validator, recalculator }
    }

    pub async fn cleanup(
        &self,
        bundle_id: &str,
        options: CleanupOptions,
    ) -> Result<CleanupReport, CleanupError> {
        let bundle = self
            .bundles
            .get_bundle(bundle_id)
            .await?
            .ok_or_else(|| CleanupError::BundleNotFound(bundle_id.to_string()))?;

        // Inactive references are reported by validation but never removed
        // here: deactivation is a business decision, not an integrity
        // violation.
        let removal_set = match &options.explicit_ids {
            Some(ids) => ids.clone(),
            None => {
                self.validator
                    .validate(bundle_id, &bundle.products)
                    .await?
                    .missing_ids()
            }
        };

        if options.dry_run {
            return Ok(CleanupReport {
                bundle_id: bundle_id.to_string(),
                removed: removal_set,
                failed: Vec::new(),
                dry_run: true,
                totals: None,
            });
        }

        let mut removed = Vec::new();
        let mut failed = Vec::new();
        for product_id in &removal_set {
            match self.bundles.remove_bundle_product(bundle_id, product_id).await {
                Ok(true) => removed.push(product_id.clone()),
                Ok(false) => {
                    // Row already gone; nothing to report.
                }
                Err(err) => {
                    warn!(bundle_id, product_id = %product_id, error = %err, "failed to remove bundle product");
                    failed.push(CleanupFailure {
                        product_id: product_id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        // Emptying a bundle is allowed; totals drop to zero and the bundle
        // stays active for the owning workflow to decide on.
        let totals = if removed.is_empty() {
            None
        } else {
            Some(self.recalculator.recalculate(bundle_id).await?)
        };

        if !removed.is_empty() {
            info!(bundle_id, removed = removed.len(), "orphaned references cleaned up");
        }

        Ok(CleanupReport {
            bundle_id: bundle_id.to_string(),
            removed,
            failed,
            dry_run: false,
            totals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rallykit_core::{BudgetRange, CampaignBundle, Product, TargetAudience};
    use rallykit_storage::MemoryStore;
    use std::time::Duration;

    fn product(id: &str, price: i64, active: bool) -> Product {
        Product { id: id.into(), name: format!("Produit {id}"), base_price: price, is_active: active }
    }

    fn row(product_id: &str, quantity: u32, custom_price: Option<i64>) -> BundleProduct {
        BundleProduct {
            product_id: product_id.into(),
            name: format!("Produit {product_id}"),
            quantity,
            custom_price,
            is_required: false,
            display_order: 0,
        }
    }

    fn bundle(id: &str, products: Vec<BundleProduct>) -> CampaignBundle {
        CampaignBundle {
            id: id.into(),
            name: format!("Bundle {id}"),
            description: String::new(),
            target_audience: TargetAudience::Local,
            budget_range: BudgetRange::Starter,
            products,
            estimated_total: 0,
            original_total: 0,
            savings: 0,
            popularity: 50,
            is_active: true,
            is_featured: false,
            tags: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// P1 valid (2 500 × 10), P2 missing, P3 inactive (500 × 20).
    async fn fixture() -> (Arc<MemoryStore>, Arc<MemoryStore>) {
        let bundles = Arc::new(MemoryStore::default());
        let products = Arc::new(MemoryStore::default());
        products.insert_product(product("p1", 2_500, true)).await;
        products.insert_product(product("p3", 500, false)).await;
        bundles
            .insert(bundle(
                "b1",
                vec![row("p1", 10, None), row("p2", 5, Some(1_000)), row("p3", 20, None)],
            ))
            .await;
        (bundles, products)
    }

    fn engines(
        bundles: Arc<MemoryStore>,
        products: Arc<MemoryStore>,
    ) -> (ReferentialIntegrityValidator, Arc<TotalsRecalculator>, OrphanCleanupEngine) {
        let validator = ReferentialIntegrityValidator::new(products.clone());
        let recalculator = Arc::new(TotalsRecalculator::new(bundles.clone(), products.clone()));
        let cleanup = OrphanCleanupEngine::new(
            bundles,
            ReferentialIntegrityValidator::new(products),
            recalculator.clone(),
        );
        (validator, recalculator, cleanup)
    }

    #[tokio::test]
    async fn validation_classifies_missing_and_inactive() {
        let (bundles, products) = fixture().await;
        let (validator, _, _) = engines(bundles.clone(), products);

        let rows = bundles.bundle_products("b1").await.unwrap();
        let report = validator.validate("b1", &rows).await.unwrap();

        assert!(!report.healthy);
        assert_eq!(report.valid, vec!["p1".to_string()]);
        assert_eq!(report.problems.len(), 2);
        let missing: Vec<_> = report
            .problems
            .iter()
            .filter(|p| p.issue == ReferenceIssue::Missing)
            .map(|p| p.product_id.as_str())
            .collect();
        assert_eq!(missing, vec!["p2"]);
        let inactive: Vec<_> = report
            .problems
            .iter()
            .filter(|p| p.issue == ReferenceIssue::Inactive)
            .map(|p| p.product_id.as_str())
            .collect();
        assert_eq!(inactive, vec!["p3"]);
    }

    #[tokio::test]
    async fn validation_is_side_effect_free_and_repeatable() {
        let (bundles, products) = fixture().await;
        let (validator, _, _) = engines(bundles.clone(), products);
        let rows = bundles.bundle_products("b1").await.unwrap();

        let first = validator.validate("b1", &rows).await.unwrap();
        let second = validator.validate("b1", &rows).await.unwrap();
        assert_eq!(first.valid, second.valid);
        assert_eq!(first.problems.len(), second.problems.len());
        assert_eq!(bundles.bundle_products("b1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn validation_notes_renamed_products() {
        let products = Arc::new(MemoryStore::default());
        products
            .insert_product(Product {
                id: "p1".into(),
                name: "Casquette brodée".into(),
                base_price: 2_500,
                is_active: true,
            })
            .await;
        let validator = ReferentialIntegrityValidator::new(products);
        let rows = vec![row("p1", 10, None)];
        let report = validator.validate("b1", &rows).await.unwrap();
        assert!(report.healthy);
        assert_eq!(report.notes.len(), 1);
    }

    #[tokio::test]
    async fn single_reference_check_reports_existence_and_activity() {
        let (_, products) = fixture().await;
        let validator = ReferentialIntegrityValidator::new(products);

        let p1 = validator.validate_product_reference("p1").await.unwrap();
        assert!(p1.exists && p1.active);
        let p3 = validator.validate_product_reference("p3").await.unwrap();
        assert!(p3.exists && !p3.active);
        let p2 = validator.validate_product_reference("p2").await.unwrap();
        assert!(!p2.exists && !p2.active);
    }

    #[tokio::test]
    async fn cleanup_removes_exactly_the_missing_references() {
        let (bundles, products) = fixture().await;
        let (_, _, cleanup) = engines(bundles.clone(), products);

        let report = cleanup.cleanup("b1", CleanupOptions::default()).await.unwrap();
        assert_eq!(report.removed, vec!["p2".to_string()]);
        assert!(report.failed.is_empty());

        let remaining: Vec<_> = bundles
            .bundle_products("b1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.product_id)
            .collect();
        assert_eq!(remaining, vec!["p1".to_string(), "p3".to_string()]);

        // p1: 2 500 × 10, p3 (inactive but resolving): 500 × 20.
        let totals = report.totals.unwrap();
        assert_eq!(totals.estimated_total, 35_000);
        let stored = bundles.get_bundle("b1").await.unwrap().unwrap();
        assert_eq!(stored.estimated_total, 35_000);
        assert_eq!(stored.savings, stored.original_total - stored.estimated_total);
    }

    #[tokio::test]
    async fn dry_run_reports_without_mutating() {
        let (bundles, products) = fixture().await;
        let (_, _, cleanup) = engines(bundles.clone(), products);

        let before = bundles.get_bundle("b1").await.unwrap().unwrap();
        let report = cleanup
            .cleanup("b1", CleanupOptions { dry_run: true, explicit_ids: None })
            .await
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.removed, vec!["p2".to_string()]);
        assert!(report.totals.is_none());

        let after = bundles.get_bundle("b1").await.unwrap().unwrap();
        assert_eq!(after.products.len(), before.products.len());
        assert_eq!(after.estimated_total, before.estimated_total);

        // The applied run removes the same set the dry run previewed.
        let applied = cleanup.cleanup("b1", CleanupOptions::default()).await.unwrap();
        assert_eq!(applied.removed, report.removed);
    }

    #[tokio::test]
    async fn explicit_ids_bypass_the_orphan_scan() {
        let (bundles, products) = fixture().await;
        let (_, _, cleanup) = engines(bundles.clone(), products);

        let report = cleanup
            .cleanup(
                "b1",
                CleanupOptions { dry_run: false, explicit_ids: Some(vec!["p3".into()]) },
            )
            .await
            .unwrap();
        assert_eq!(report.removed, vec!["p3".to_string()]);

        // p2 is still present: the admin's explicit list won.
        let remaining: Vec<_> = bundles
            .bundle_products("b1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.product_id)
            .collect();
        assert!(remaining.contains(&"p2".to_string()));
    }

    #[tokio::test]
    async fn removing_the_last_row_zeroes_totals_and_keeps_bundle_active() {
        let bundles = Arc::new(MemoryStore::default());
        let products = Arc::new(MemoryStore::default());
        bundles.insert(bundle("solo", vec![row("gone", 4, Some(100))])).await;
        let (_, _, cleanup) = engines(bundles.clone(), products);

        let report = cleanup.cleanup("solo", CleanupOptions::default()).await.unwrap();
        assert_eq!(report.removed, vec!["gone".to_string()]);

        let stored = bundles.get_bundle("solo").await.unwrap().unwrap();
        assert!(stored.products.is_empty());
        assert_eq!(stored.estimated_total, 0);
        assert_eq!(stored.savings, 0);
        assert!(stored.is_active);
    }

    #[tokio::test]
    async fn cleanup_of_unknown_bundle_is_not_found() {
        let (bundles, products) = fixture().await;
        let (_, _, cleanup) = engines(bundles, products);
        let err = cleanup.cleanup("nope", CleanupOptions::default()).await;
        assert!(matches!(err, Err(CleanupError::BundleNotFound(_))));
    }

    #[tokio::test]
    async fn recalculation_is_idempotent() {
        let (bundles, products) = fixture().await;
        let (_, recalculator, _) = engines(bundles.clone(), products);

        let first = recalculator.recalculate("b1").await.unwrap();
        let second = recalculator.recalculate("b1").await.unwrap();
        assert_eq!(first, second);

        let stored = bundles.get_bundle("b1").await.unwrap().unwrap();
        assert_eq!(stored.estimated_total, first.estimated_total);
        assert_eq!(stored.original_total, first.original_total);
        assert_eq!(stored.savings, first.savings);
    }

    #[tokio::test]
    async fn batch_recalculation_isolates_failures() {
        let (bundles, products) = fixture().await;
        let (_, recalculator, _) = engines(bundles, products);

        let outcomes = recalculator
            .recalculate_many(&["b1".to_string(), "ghost".to_string()])
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].success);
        assert!(outcomes[0].totals.is_some());
        assert!(!outcomes[1].success);
        assert!(outcomes[1].error.as_deref().unwrap_or("").contains("not found"));
    }

    /// Product store that takes simulated time per lookup, to make
    /// interleaving observable under paused time.
    struct SlowProducts {
        inner: Arc<MemoryStore>,
        delay: Duration,
    }

    #[async_trait]
    impl ProductStore for SlowProducts {
        async fn get_product(&self, id: &str) -> Result<Option<Product>, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.get_product(id).await
        }

        async fn health(&self) -> Result<(), StoreError> {
            ProductStore::health(&*self.inner).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_recalculations_of_one_bundle_are_serialized() {
        let bundles = Arc::new(MemoryStore::default());
        let products = Arc::new(MemoryStore::default());
        products.insert_product(product("p1", 1_000, true)).await;
        bundles.insert(bundle("b1", vec![row("p1", 2, None)])).await;

        let slow = Arc::new(SlowProducts {
            inner: products,
            delay: Duration::from_millis(100),
        });
        let recalculator =
            Arc::new(TotalsRecalculator::new(bundles.clone(), slow));

        let started = tokio::time::Instant::now();
        let a = {
            let r = recalculator.clone();
            tokio::spawn(async move { r.recalculate("b1").await })
        };
        let b = {
            let r = recalculator.clone();
            tokio::spawn(async move { r.recalculate("b1").await })
        };
        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a, b);

        // One product lookup per run; serialized runs take the sum of both
        // delays, interleaved runs would overlap them.
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
