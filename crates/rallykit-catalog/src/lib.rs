//! Tiered catalog resolution: primary store, authoring fallback, and the
//! built-in static catalog, cascaded behind one provider interface.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use rallykit_core::{
    BudgetRange, BundleProduct, CampaignBundle, ResolvedBundle, ResolvedCatalog, SourceTier,
    TargetAudience,
};
use rallykit_storage::{with_timeout, AuthoringStore, BundleStore, StoreError};

pub const CRATE_NAME: &str = "rallykit-catalog";

/// Default latency budget for one tier's call before the cascade moves on.
pub const DEFAULT_TIER_TIMEOUT: Duration = Duration::from_millis(250);

/// One backing tier the resolver can serve bundle reads from.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    fn tier(&self) -> SourceTier;
    async fn list_bundles(&self) -> Result<Vec<CampaignBundle>, StoreError>;
    async fn get_bundle(&self, id: &str) -> Result<Option<CampaignBundle>, StoreError>;
}

/// Primary tier: the bundle store itself.
pub struct PrimaryProvider {
    store: Arc<dyn BundleStore>,
}

impl PrimaryProvider {
    pub fn new(store: Arc<dyn BundleStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CatalogProvider for PrimaryProvider {
    fn tier(&self) -> SourceTier {
        SourceTier::Primary
    }

    async fn list_bundles(&self) -> Result<Vec<CampaignBundle>, StoreError> {
        self.store.list_bundles().await
    }

    async fn get_bundle(&self, id: &str) -> Result<Option<CampaignBundle>, StoreError> {
        self.store.get_bundle(id).await
    }
}

/// Authoring tier: authoritative but slower, read-only.
pub struct AuthoringProvider {
    store: Arc<dyn AuthoringStore>,
}

impl AuthoringProvider {
    pub fn new(store: Arc<dyn AuthoringStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CatalogProvider for AuthoringProvider {
    fn tier(&self) -> SourceTier {
        SourceTier::Authoring
    }

    async fn list_bundles(&self) -> Result<Vec<CampaignBundle>, StoreError> {
        self.store.list_bundles().await
    }

    async fn get_bundle(&self, id: &str) -> Result<Option<CampaignBundle>, StoreError> {
        self.store.get_bundle(id).await
    }
}

/// Last-resort tier: an in-process constant set that cannot fail.
pub struct StaticCatalogProvider {
    bundles: Vec<CampaignBundle>,
}

impl StaticCatalogProvider {
    pub fn new() -> Self {
        Self { bundles: static_catalog() }
    }
}

impl Default for StaticCatalogProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogProvider for StaticCatalogProvider {
    fn tier(&self) -> SourceTier {
        SourceTier::Static
    }

    async fn list_bundles(&self) -> Result<Vec<CampaignBundle>, StoreError> {
        Ok(self.bundles.clone())
    }

    async fn get_bundle(&self, id: &str) -> Result<Option<CampaignBundle>, StoreError> {
        Ok(self.bundles.iter().find(|b| b.id == id).cloned())
    }
}

/// Read-side filters, applied identically regardless of which tier served.
#[derive(Debug, Clone, Default)]
pub struct BundleQuery {
    pub audience: Option<TargetAudience>,
    pub budget: Option<BudgetRange>,
    pub featured_only: bool,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no tier has bundle {0}")]
    NotFound(String),
}

/// Client cache lifetime derived from the serving tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub max_age: Duration,
}

impl CachePolicy {
    pub fn for_tier(tier: SourceTier) -> Self {
        let max_age = match tier {
            SourceTier::Primary => Duration::from_secs(900),
            SourceTier::Authoring => Duration::from_secs(300),
            SourceTier::Static => Duration::from_secs(60),
        };
        Self { max_age }
    }

    pub fn header_value(&self) -> String {
        format!("public, max-age={}", self.max_age.as_secs())
    }
}

/// Cascades reads across an ordered provider list. Tier order is a
/// construction-time configuration; the resolver itself is tier-agnostic.
pub struct SourceResolver {
    providers: Vec<Arc<dyn CatalogProvider>>,
    tier_timeout: Duration,
}

impl SourceResolver {
    pub fn new(providers: Vec<Arc<dyn CatalogProvider>>, tier_timeout: Duration) -> Self {
        Self { providers, tier_timeout }
    }

    /// Standard three-tier cascade ending in the infallible static catalog.
    pub fn with_default_tiers(
        primary: Arc<dyn BundleStore>,
        authoring: Arc<dyn AuthoringStore>,
        tier_timeout: Duration,
    ) -> Self {
        Self::new(
            vec![
                Arc::new(PrimaryProvider::new(primary)),
                Arc::new(AuthoringProvider::new(authoring)),
                Arc::new(StaticCatalogProvider::new()),
            ],
            tier_timeout,
        )
    }

    /// Serves the first tier that answers, in full; never raises. Filters are
    /// applied after the tier returns so callers see the same semantics in
    /// degraded mode.
    pub async fn resolve(&self, query: &BundleQuery) -> ResolvedCatalog {
        for provider in &self.providers {
            let tier = provider.tier();
            match with_timeout(self.tier_timeout, provider.list_bundles()).await {
                Ok(bundles) => {
                    return ResolvedCatalog {
                        bundles: apply_query(bundles, query),
                        source: tier,
                        degraded: tier != SourceTier::Primary,
                    };
                }
                Err(err) => {
                    warn!(tier = tier.as_str(), error = %err, "catalog tier failed, falling through");
                }
            }
        }
        // Only reachable when the resolver was built without the static tier.
        warn!("all catalog tiers failed; serving empty degraded catalog");
        ResolvedCatalog { bundles: Vec::new(), source: SourceTier::Static, degraded: true }
    }

    /// Same cascade for one id. A healthy tier that has no matching bundle
    /// falls through to the next tier; exhaustion is a `NotFound`, distinct
    /// from every tier being unreachable.
    pub async fn resolve_bundle(&self, id: &str) -> Result<ResolvedBundle, ResolveError> {
        for provider in &self.providers {
            let tier = provider.tier();
            match with_timeout(self.tier_timeout, provider.get_bundle(id)).await {
                Ok(Some(bundle)) => {
                    return Ok(ResolvedBundle {
                        bundle,
                        source: tier,
                        degraded: tier != SourceTier::Primary,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(tier = tier.as_str(), bundle_id = id, error = %err, "catalog tier failed, falling through");
                }
            }
        }
        Err(ResolveError::NotFound(id.to_string()))
    }
}

fn apply_query(bundles: Vec<CampaignBundle>, query: &BundleQuery) -> Vec<CampaignBundle> {
    let mut result: Vec<CampaignBundle> = bundles
        .into_iter()
        .filter(|b| b.is_active)
        .filter(|b| query.audience.map_or(true, |a| b.target_audience == a))
        .filter(|b| query.budget.map_or(true, |r| b.budget_range == r))
        .filter(|b| !query.featured_only || b.is_featured)
        .collect();
    result.sort_by(|a, b| {
        b.is_featured
            .cmp(&a.is_featured)
            .then(b.popularity.cmp(&a.popularity))
            .then(a.id.cmp(&b.id))
    });
    result
}

// ---------------------------------------------------------------------------
// Static catalog
// ---------------------------------------------------------------------------

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn line(
    product_id: &str,
    name: &str,
    unit_price: i64,
    quantity: u32,
    display_order: i32,
) -> BundleProduct {
    BundleProduct {
        product_id: product_id.to_string(),
        name: name.to_string(),
        quantity,
        custom_price: Some(unit_price),
        is_required: display_order == 0,
        display_order,
    }
}

/// The hardcoded minimal bundle set served when every other tier is down.
/// Prices are FCFA; totals are kept consistent with the line items.
pub fn static_catalog() -> Vec<CampaignBundle> {
    let created = ts(1_735_689_600); // 2025-01-01
    let updated = ts(1_736_931_600); // 2025-01-15

    vec![
        CampaignBundle {
            id: "local-starter-001".into(),
            name: "Pack Candidat Local".into(),
            description: "L'essentiel pour lancer votre campagne municipale avec une visibilité de proximité.".into(),
            target_audience: TargetAudience::Local,
            budget_range: BudgetRange::Starter,
            products: vec![
                line("casquette-001", "Casquettes personnalisées", 2_500, 100, 0),
                line("t-shirt-001", "T-shirts de campagne", 3_500, 50, 1),
                line("autocollant-001", "Autocollants", 150, 500, 2),
            ],
            estimated_total: 500_000,
            original_total: 520_000,
            savings: 20_000,
            popularity: 95,
            is_active: true,
            is_featured: true,
            tags: vec!["débutant".into(), "budget-maîtrisé".into()],
            created_at: created,
            updated_at: updated,
        },
        CampaignBundle {
            id: "local-medium-001".into(),
            name: "Pack Mobilisation Quartier".into(),
            description: "Équipez vos militants et créez l'effet de groupe dans votre commune.".into(),
            target_audience: TargetAudience::Local,
            budget_range: BudgetRange::Medium,
            products: vec![
                line("casquette-002", "Casquettes premium", 3_000, 200, 0),
                line("t-shirt-002", "T-shirts qualité supérieure", 4_500, 100, 1),
                line("banderole-001", "Banderoles PVC", 15_000, 10, 2),
                line("stylo-001", "Stylos publicitaires", 300, 500, 3),
            ],
            estimated_total: 1_350_000,
            original_total: 1_500_000,
            savings: 150_000,
            popularity: 88,
            is_active: true,
            is_featured: false,
            tags: vec!["mobilisation".into(), "équipe-campagne".into()],
            created_at: created,
            updated_at: updated,
        },
        CampaignBundle {
            id: "regional-premium-001".into(),
            name: "Pack Candidat Départemental".into(),
            description: "Couvrez votre département avec un mix de visibilité véhicule et d'équipement militant.".into(),
            target_audience: TargetAudience::Regional,
            budget_range: BudgetRange::Premium,
            products: vec![
                line("casquette-003", "Casquettes brodées", 3_500, 500, 0),
                line("t-shirt-003", "T-shirts campagne", 4_000, 300, 1),
                line("affiche-001", "Affiches A2", 500, 1_000, 2),
            ],
            estimated_total: 3_450_000,
            original_total: 3_900_000,
            savings: 450_000,
            popularity: 92,
            is_active: true,
            is_featured: true,
            tags: vec!["départementale".into(), "couverture-étendue".into()],
            created_at: created,
            updated_at: updated,
        },
        CampaignBundle {
            id: "national-enterprise-001".into(),
            name: "Pack Campagne Nationale".into(),
            description: "Le dispositif complet pour une présence nationale coordonnée.".into(),
            target_audience: TargetAudience::National,
            budget_range: BudgetRange::Enterprise,
            products: vec![
                line("t-shirt-004", "T-shirts grand volume", 4_000, 2_000, 0),
                line("casquette-004", "Casquettes grand volume", 3_000, 2_000, 1),
                line("gilet-001", "Gilets militants", 7_000, 500, 2),
            ],
            estimated_total: 17_500_000,
            original_total: 20_000_000,
            savings: 2_500_000,
            popularity: 90,
            is_active: true,
            is_featured: true,
            tags: vec!["nationale".into(), "grand-volume".into()],
            created_at: created,
            updated_at: updated,
        },
    ]
}
