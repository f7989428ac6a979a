//! Core domain model for the Rallykit campaign-bundle catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rallykit-core";

/// Placeholder markup used to derive a list-price baseline when a bundle has
/// no stored `original_total`. Replace with an explicit list-price column
/// before this drives anything customer-facing.
pub const LIST_PRICE_MARKUP_PERCENT: i64 = 15;

/// Audience tier a bundle is composed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetAudience {
    Local,
    Regional,
    National,
    Universal,
}

impl TargetAudience {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "regional" => Some(Self::Regional),
            "national" => Some(Self::National),
            "universal" => Some(Self::Universal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Regional => "regional",
            Self::National => "national",
            Self::Universal => "universal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetRange {
    Starter,
    Medium,
    Premium,
    Enterprise,
}

impl BudgetRange {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starter" => Some(Self::Starter),
            "medium" => Some(Self::Medium),
            "premium" => Some(Self::Premium),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starter => "starter",
            Self::Medium => "medium",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
        }
    }
}

/// Catalog product, owned by the product store. This subsystem only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    /// Minor currency unit (e.g. FCFA).
    pub base_price: i64,
    pub is_active: bool,
}

/// Catalog category, pulled during sync alongside products and bundles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub is_active: bool,
}

/// One product line inside a bundle. The effective unit price is the admin
/// override when present, otherwise the product's live base price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleProduct {
    pub product_id: String,
    /// Name snapshot taken when the product was attached.
    pub name: String,
    pub quantity: u32,
    pub custom_price: Option<i64>,
    pub is_required: bool,
    pub display_order: i32,
}

impl BundleProduct {
    pub fn effective_unit_price(&self, live_base_price: i64) -> i64 {
        self.custom_price.unwrap_or(live_base_price)
    }

    pub fn subtotal(&self, live_base_price: i64) -> i64 {
        self.effective_unit_price(live_base_price) * i64::from(self.quantity)
    }
}

/// A named, priced collection of products sold as a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignBundle {
    pub id: String,
    pub name: String,
    pub description: String,
    pub target_audience: TargetAudience,
    pub budget_range: BudgetRange,
    pub products: Vec<BundleProduct>,
    pub estimated_total: i64,
    pub original_total: i64,
    pub savings: i64,
    pub popularity: i32,
    pub is_active: bool,
    pub is_featured: bool,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Derived monetary totals for one bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleTotals {
    pub estimated_total: i64,
    pub original_total: i64,
    pub savings: i64,
}

impl BundleTotals {
    /// Builds totals from a freshly computed subtotal sum and the bundle's
    /// stored baseline. A missing baseline (zero or negative) falls back to
    /// the placeholder markup over the estimate; savings never go negative.
    pub fn derive(estimated_total: i64, stored_original_total: i64) -> Self {
        let original_total = if stored_original_total > 0 {
            stored_original_total
        } else {
            estimated_total + (estimated_total * LIST_PRICE_MARKUP_PERCENT + 50) / 100
        };
        Self {
            estimated_total,
            original_total,
            savings: (original_total - estimated_total).max(0),
        }
    }
}

/// Which backing tier served a read, ranked by freshness and read cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTier {
    Primary,
    Authoring,
    Static,
}

impl SourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Authoring => "authoring",
            Self::Static => "static",
        }
    }
}

/// Read-time wrapper tagging bundle data with its origin tier. Not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedCatalog {
    pub bundles: Vec<CampaignBundle>,
    pub source: SourceTier,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedBundle {
    pub bundle: CampaignBundle,
    pub source: SourceTier,
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    Scheduled,
    Startup,
    Manual,
    Webhook,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Startup => "startup",
            Self::Manual => "manual",
            Self::Webhook => "webhook",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "startup" => Some(Self::Startup),
            "manual" => Some(Self::Manual),
            "webhook" => Some(Self::Webhook),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Success,
    Partial,
    Failed,
    Aborted,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

/// Aggregate record counts for one sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub created: i32,
    pub updated: i32,
    pub skipped: i32,
    pub errors: i32,
}

impl SyncCounts {
    pub fn absorb(&mut self, other: SyncCounts) {
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }

    pub fn changed(&self) -> i32 {
        self.created + self.updated
    }
}

/// Durable record of one sync execution. Finalized runs are append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub counts: SyncCounts,
    pub retry_count: i32,
}

impl SyncRun {
    pub fn begin(trigger: SyncTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            started_at: Utc::now(),
            completed_at: None,
            status: SyncStatus::Running,
            counts: SyncCounts::default(),
            retry_count: 0,
        }
    }
}

/// How a reference inside a bundle resolved against the product store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceIssue {
    /// Product id does not resolve at all.
    Missing,
    /// Product resolves but is deactivated.
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemReference {
    pub product_id: String,
    pub name: String,
    pub issue: ReferenceIssue,
    /// Set when the denormalized snapshot no longer matches the live product.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Outcome of validating one bundle's references. Informational only; orphan
/// classification is carried here, never raised as an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub bundle_id: String,
    pub valid: Vec<String>,
    pub problems: Vec<ProblemReference>,
    /// Informational drift (e.g. a product renamed since it was attached);
    /// never affects `healthy`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
}

impl ValidationReport {
    pub fn missing_ids(&self) -> Vec<String> {
        self.problems
            .iter()
            .filter(|p| p.issue == ReferenceIssue::Missing)
            .map(|p| p.product_id.clone())
            .collect()
    }
}

/// Pre-attach check for a single product id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProductReferenceCheck {
    pub exists: bool,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(product_id: &str, quantity: u32, custom_price: Option<i64>) -> BundleProduct {
        BundleProduct {
            product_id: product_id.to_string(),
            name: product_id.to_string(),
            quantity,
            custom_price,
            is_required: false,
            display_order: 0,
        }
    }

    #[test]
    fn effective_price_prefers_custom_override() {
        let r = row("tshirt-001", 50, Some(3_000));
        assert_eq!(r.effective_unit_price(3_500), 3_000);
        assert_eq!(r.subtotal(3_500), 150_000);

        let r = row("tshirt-001", 50, None);
        assert_eq!(r.effective_unit_price(3_500), 3_500);
        assert_eq!(r.subtotal(3_500), 175_000);
    }

    #[test]
    fn totals_use_stored_baseline_when_present() {
        let totals = BundleTotals::derive(495_000, 520_000);
        assert_eq!(totals.original_total, 520_000);
        assert_eq!(totals.savings, 25_000);
    }

    #[test]
    fn totals_fall_back_to_markup_without_baseline() {
        let totals = BundleTotals::derive(100_000, 0);
        assert_eq!(totals.original_total, 115_000);
        assert_eq!(totals.savings, 15_000);
    }

    #[test]
    fn savings_never_go_negative() {
        let totals = BundleTotals::derive(600_000, 500_000);
        assert_eq!(totals.savings, 0);
    }

    #[test]
    fn markup_rounds_to_nearest_unit() {
        // 15% of 3 is 0.45, which rounds to 0.
        assert_eq!(BundleTotals::derive(3, 0).original_total, 3);
        // 15% of 10 is 1.5, which rounds up to 2.
        assert_eq!(BundleTotals::derive(10, 0).original_total, 12);
    }

    #[test]
    fn audience_and_budget_round_trip() {
        for a in ["local", "regional", "national", "universal"] {
            assert_eq!(TargetAudience::parse(a).map(|v| v.as_str()), Some(a));
        }
        assert!(TargetAudience::parse("galactic").is_none());
        for b in ["starter", "medium", "premium", "enterprise"] {
            assert_eq!(BudgetRange::parse(b).map(|v| v.as_str()), Some(b));
        }
    }

    #[test]
    fn sync_counts_absorb_and_changed() {
        let mut total = SyncCounts::default();
        total.absorb(SyncCounts { created: 3, updated: 2, skipped: 1, errors: 0 });
        total.absorb(SyncCounts { created: 1, updated: 0, skipped: 4, errors: 2 });
        assert_eq!(total.changed(), 6);
        assert_eq!(total.skipped, 5);
        assert_eq!(total.errors, 2);
    }
}
