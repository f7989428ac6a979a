//! Axum JSON surface for the Rallykit catalog: tiered reads, bundle writes,
//! integrity admin tooling, recalculation webhook, and sync operations.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::error;
use uuid::Uuid;

use rallykit_catalog::{BundleQuery, CachePolicy, SourceResolver};
use rallykit_core::{
    BudgetRange, BundleProduct, CampaignBundle, SourceTier, SyncTrigger, TargetAudience,
};
use rallykit_integrity::{
    CleanupError, CleanupOptions, OrphanCleanupEngine, ReferentialIntegrityValidator,
    TotalsRecalculator,
};
use rallykit_storage::{
    AuthoringStore, BundleStore, BundleUpdate, ProductStore, StoreError, SyncRunStore,
};
use rallykit_sync::{RuntimeConfig, SyncJobRunner};

pub const CRATE_NAME: &str = "rallykit-web";

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<SourceResolver>,
    pub bundles: Arc<dyn BundleStore>,
    pub products: Arc<dyn ProductStore>,
    pub validator: Arc<ReferentialIntegrityValidator>,
    pub cleanup: Arc<OrphanCleanupEngine>,
    pub recalculator: Arc<TotalsRecalculator>,
    pub sync: Arc<SyncJobRunner>,
}

impl AppState {
    /// Wires the full engine stack over the given stores. Production passes
    /// the Postgres store for all three primary seams; tests pass memory
    /// stores.
    pub fn build(
        products: Arc<dyn ProductStore>,
        bundles: Arc<dyn BundleStore>,
        runs: Arc<dyn SyncRunStore>,
        authoring: Arc<dyn AuthoringStore>,
        tier_timeout: Duration,
    ) -> Self {
        let resolver = Arc::new(SourceResolver::with_default_tiers(
            bundles.clone(),
            authoring.clone(),
            tier_timeout,
        ));
        let validator = Arc::new(ReferentialIntegrityValidator::new(products.clone()));
        let recalculator = Arc::new(TotalsRecalculator::new(bundles.clone(), products.clone()));
        let cleanup = Arc::new(OrphanCleanupEngine::new(
            bundles.clone(),
            ReferentialIntegrityValidator::new(products.clone()),
            recalculator.clone(),
        ));
        let sync = Arc::new(
            SyncJobRunner::new(authoring, bundles.clone(), runs).with_store_timeout(tier_timeout),
        );
        Self { resolver, bundles, products, validator, cleanup, recalculator, sync }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/campaign-bundles",
            get(list_bundles_handler).post(create_bundle_handler),
        )
        .route(
            "/campaign-bundles/recalculate-totals",
            post(recalculate_totals_handler),
        )
        .route(
            "/campaign-bundles/{id}",
            get(get_bundle_handler)
                .put(update_bundle_handler)
                .delete(delete_bundle_handler),
        )
        .route(
            "/admin/bundle-reference/validate/{bundle_id}",
            post(validate_bundle_handler),
        )
        .route(
            "/admin/bundle-reference/cleanup/{bundle_id}",
            post(cleanup_bundle_handler),
        )
        .route(
            "/admin/product-reference/validate/{product_id}",
            get(validate_product_handler),
        )
        .route("/admin/sync/trigger", post(sync_trigger_handler))
        .route("/admin/sync/status", get(sync_status_handler))
        .with_state(Arc::new(state))
}

/// Binds and serves using the runtime configuration's port.
pub async fn serve(state: AppState, config: &RuntimeConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    tracing::info!(port = config.web_port, "rallykit web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

enum ApiError {
    Validation { message: String, fields: Vec<FieldError> },
    NotFound(String),
    Internal(String),
}

impl ApiError {
    fn internal(err: impl std::fmt::Display) -> Self {
        error!(error = %err, "request failed");
        Self::Internal(err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Validation { message, fields } => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "success": false,
                    "error": "validation_error",
                    "message": message,
                    "fields": fields,
                })),
            )
                .into_response(),
            Self::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "success": false,
                    "error": "not_found",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "error": "store_error",
                    "message": message,
                })),
            )
                .into_response(),
        }
    }
}

// ---------------------------------------------------------------------------
// Read endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    audience: Option<String>,
    featured: Option<String>,
    budget: Option<String>,
}

fn degraded_warning(source: SourceTier) -> Option<&'static str> {
    match source {
        SourceTier::Primary => None,
        SourceTier::Authoring => Some("serving from the authoring source; data may lag"),
        SourceTier::Static => Some("degraded service: serving the built-in catalog"),
    }
}

fn set_cache_control(response: &mut Response, source: SourceTier) {
    let policy = CachePolicy::for_tier(source);
    if let Ok(value) = header::HeaderValue::from_str(&policy.header_value()) {
        response.headers_mut().insert(header::CACHE_CONTROL, value);
    }
}

fn parse_list_query(query: &ListQuery) -> Result<BundleQuery, ApiError> {
    let mut fields = Vec::new();
    let audience = match query.audience.as_deref() {
        None | Some("all") => None,
        Some(raw) => match TargetAudience::parse(raw) {
            Some(audience) => Some(audience),
            None => {
                fields.push(FieldError {
                    field: "audience".into(),
                    message: format!("unknown audience {raw:?}"),
                });
                None
            }
        },
    };
    let budget = match query.budget.as_deref() {
        None | Some("all") => None,
        Some(raw) => match BudgetRange::parse(raw) {
            Some(budget) => Some(budget),
            None => {
                fields.push(FieldError {
                    field: "budget".into(),
                    message: format!("unknown budget range {raw:?}"),
                });
                None
            }
        },
    };
    if !fields.is_empty() {
        return Err(ApiError::Validation { message: "invalid filter".into(), fields });
    }
    Ok(BundleQuery {
        audience,
        budget,
        featured_only: query.featured.as_deref() == Some("true"),
    })
}

async fn list_bundles_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let query = parse_list_query(&query)?;
    let resolved = state.resolver.resolve(&query).await;

    let total = resolved.bundles.len();
    let mut body = json!({
        "success": true,
        "data": resolved.bundles,
        "source": resolved.source.as_str(),
        "pagination": {
            "page": 1,
            "limit": total,
            "total": total,
            "has_more": false,
        },
    });
    if let Some(warning) = degraded_warning(resolved.source) {
        body["warning"] = json!(warning);
    }

    let mut response = (StatusCode::OK, Json(body)).into_response();
    set_cache_control(&mut response, resolved.source);
    Ok(response)
}

async fn get_bundle_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, ApiError> {
    let resolved = state
        .resolver
        .resolve_bundle(&id)
        .await
        .map_err(|err| ApiError::NotFound(err.to_string()))?;

    let etag = format!(
        "\"bundle-{}-{}\"",
        resolved.bundle.id,
        resolved.bundle.updated_at.timestamp()
    );
    let mut body = json!({
        "success": true,
        "data": resolved.bundle,
        "source": resolved.source.as_str(),
    });
    if let Some(warning) = degraded_warning(resolved.source) {
        body["warning"] = json!(warning);
    }
    let mut response = (StatusCode::OK, Json(body)).into_response();
    set_cache_control(&mut response, resolved.source);
    if let Ok(value) = header::HeaderValue::from_str(&etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

// ---------------------------------------------------------------------------
// Write endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NewBundleProductBody {
    product_id: String,
    quantity: u32,
    #[serde(default)]
    custom_price: Option<i64>,
    #[serde(default)]
    is_required: bool,
    #[serde(default)]
    display_order: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct CreateBundleRequest {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    description: String,
    target_audience: String,
    budget_range: String,
    products: Vec<NewBundleProductBody>,
    #[serde(default)]
    original_total: Option<i64>,
    #[serde(default)]
    popularity: Option<i32>,
    #[serde(default)]
    is_featured: bool,
    #[serde(default)]
    tags: Vec<String>,
}

fn slugify(name: &str) -> String {
    name.to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Validates the payload's product references and builds the join rows with
/// live name snapshots. Inactive or unknown products are field errors: they
/// may not be attached to a bundle.
async fn build_bundle_rows(
    state: &AppState,
    products: &[NewBundleProductBody],
    fields: &mut Vec<FieldError>,
) -> Result<Vec<BundleProduct>, ApiError> {
    let mut rows = Vec::with_capacity(products.len());
    for (index, item) in products.iter().enumerate() {
        if item.quantity == 0 {
            fields.push(FieldError {
                field: format!("products[{index}].quantity"),
                message: "quantity must be greater than zero".into(),
            });
            continue;
        }
        match state.products.get_product(&item.product_id).await? {
            None => fields.push(FieldError {
                field: format!("products[{index}].product_id"),
                message: format!("product {:?} does not exist", item.product_id),
            }),
            Some(product) if !product.is_active => fields.push(FieldError {
                field: format!("products[{index}].product_id"),
                message: format!("product {:?} is inactive", item.product_id),
            }),
            Some(product) => rows.push(BundleProduct {
                product_id: product.id,
                name: product.name,
                quantity: item.quantity,
                custom_price: item.custom_price,
                is_required: item.is_required,
                display_order: item.display_order.unwrap_or(index as i32),
            }),
        }
    }
    Ok(rows)
}

async fn create_bundle_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateBundleRequest>,
) -> Result<Response, ApiError> {
    let mut fields = Vec::new();
    if payload.name.trim().is_empty() {
        fields.push(FieldError { field: "name".into(), message: "name is required".into() });
    }
    if payload.products.is_empty() {
        fields.push(FieldError {
            field: "products".into(),
            message: "at least one product is required".into(),
        });
    }
    let target_audience = TargetAudience::parse(&payload.target_audience);
    if target_audience.is_none() {
        fields.push(FieldError {
            field: "target_audience".into(),
            message: format!("unknown audience {:?}", payload.target_audience),
        });
    }
    let budget_range = BudgetRange::parse(&payload.budget_range);
    if budget_range.is_none() {
        fields.push(FieldError {
            field: "budget_range".into(),
            message: format!("unknown budget range {:?}", payload.budget_range),
        });
    }

    let rows = build_bundle_rows(&state, &payload.products, &mut fields).await?;
    if !fields.is_empty() {
        return Err(ApiError::Validation { message: "invalid bundle".into(), fields });
    }
    // parse failures are reported above
    let (Some(target_audience), Some(budget_range)) = (target_audience, budget_range) else {
        return Err(ApiError::Validation { message: "invalid bundle".into(), fields });
    };

    let id = payload.id.unwrap_or_else(|| {
        let short = Uuid::new_v4().simple().to_string();
        format!("{}-{}", slugify(&payload.name), &short[..8])
    });
    let now = Utc::now();
    let bundle = CampaignBundle {
        id: id.clone(),
        name: payload.name,
        description: payload.description,
        target_audience,
        budget_range,
        products: rows,
        estimated_total: 0,
        original_total: payload.original_total.unwrap_or(0),
        savings: 0,
        popularity: payload.popularity.unwrap_or(0),
        is_active: true,
        is_featured: payload.is_featured,
        tags: payload.tags,
        created_at: now,
        updated_at: now,
    };

    state.bundles.create_bundle(&bundle).await?;
    state
        .recalculator
        .recalculate(&id)
        .await
        .map_err(ApiError::internal)?;
    let created = state
        .bundles
        .get_bundle(&id)
        .await?
        .ok_or_else(|| ApiError::internal(format!("bundle {id} vanished after create")))?;

    Ok((StatusCode::CREATED, Json(json!({ "success": true, "data": created }))).into_response())
}

#[derive(Debug, Deserialize)]
struct UpdateBundleRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    target_audience: Option<String>,
    #[serde(default)]
    budget_range: Option<String>,
    #[serde(default)]
    popularity: Option<i32>,
    #[serde(default)]
    is_active: Option<bool>,
    #[serde(default)]
    is_featured: Option<bool>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    products: Option<Vec<NewBundleProductBody>>,
}

async fn update_bundle_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(payload): Json<UpdateBundleRequest>,
) -> Result<Response, ApiError> {
    let mut fields = Vec::new();

    let target_audience = match payload.target_audience.as_deref() {
        None => None,
        Some(raw) => match TargetAudience::parse(raw) {
            Some(audience) => Some(audience),
            None => {
                fields.push(FieldError {
                    field: "target_audience".into(),
                    message: format!("unknown audience {raw:?}"),
                });
                None
            }
        },
    };
    let budget_range = match payload.budget_range.as_deref() {
        None => None,
        Some(raw) => match BudgetRange::parse(raw) {
            Some(budget) => Some(budget),
            None => {
                fields.push(FieldError {
                    field: "budget_range".into(),
                    message: format!("unknown budget range {raw:?}"),
                });
                None
            }
        },
    };
    if let Some(name) = &payload.name {
        if name.trim().is_empty() {
            fields.push(FieldError { field: "name".into(), message: "name must not be empty".into() });
        }
    }

    let products = match &payload.products {
        Some(items) => Some(build_bundle_rows(&state, items, &mut fields).await?),
        None => None,
    };
    if !fields.is_empty() {
        return Err(ApiError::Validation { message: "invalid bundle update".into(), fields });
    }

    let update = BundleUpdate {
        name: payload.name,
        description: payload.description,
        target_audience,
        budget_range,
        popularity: payload.popularity,
        is_active: payload.is_active,
        is_featured: payload.is_featured,
        tags: payload.tags,
        products,
    };

    if !state.bundles.update_bundle(&id, &update).await? {
        return Err(ApiError::NotFound(format!("bundle {id} not found")));
    }
    state
        .recalculator
        .recalculate(&id)
        .await
        .map_err(ApiError::internal)?;
    let updated = state
        .bundles
        .get_bundle(&id)
        .await?
        .ok_or_else(|| ApiError::internal(format!("bundle {id} vanished after update")))?;

    Ok(Json(json!({ "success": true, "data": updated })).into_response())
}

async fn delete_bundle_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response, ApiError> {
    if !state.bundles.delete_bundle(&id).await? {
        return Err(ApiError::NotFound(format!("bundle {id} not found")));
    }
    Ok(Json(json!({
        "success": true,
        "message": format!("bundle {id} deleted"),
    }))
    .into_response())
}

// ---------------------------------------------------------------------------
// Recalculation webhook
// ---------------------------------------------------------------------------

/// Authoring-side automations send either one id or a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(id) => vec![id],
            Self::Many(ids) => ids,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RecalculatePayload {
    #[serde(default)]
    bundle_product_id: Option<String>,
    campaign_bundle_ids: OneOrMany,
    #[serde(default)]
    trigger: Option<String>,
}

/// At-least-once webhook: recalculation is idempotent, so duplicate
/// deliveries are harmless. Always 200 with a per-bundle breakdown.
async fn recalculate_totals_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RecalculatePayload>,
) -> Result<Response, ApiError> {
    let bundle_ids = payload.campaign_bundle_ids.into_vec();
    if bundle_ids.is_empty() {
        return Err(ApiError::Validation {
            message: "campaign_bundle_ids is required".into(),
            fields: vec![FieldError {
                field: "campaign_bundle_ids".into(),
                message: "at least one bundle id is required".into(),
            }],
        });
    }

    tracing::info!(
        bundle_count = bundle_ids.len(),
        bundle_product_id = payload.bundle_product_id.as_deref().unwrap_or("-"),
        trigger = payload.trigger.as_deref().unwrap_or("manual"),
        "recalculation webhook received"
    );

    let results = state.recalculator.recalculate_many(&bundle_ids).await;
    let total = results.len();
    let succeeded = results.iter().filter(|r| r.success).count();
    let failed = total - succeeded;

    Ok(Json(json!({
        "success": true,
        "results": results,
        "statistics": {
            "total": total,
            "succeeded": succeeded,
            "failed": failed,
        },
        "recalculated_at": Utc::now(),
    }))
    .into_response())
}

// ---------------------------------------------------------------------------
// Admin: integrity tooling
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct ValidateBundleBody {
    /// Pre-save validation: when present, validate these rows instead of the
    /// persisted ones.
    #[serde(default)]
    products: Option<Vec<BundleProduct>>,
}

async fn validate_bundle_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(bundle_id): AxumPath<String>,
    Json(body): Json<ValidateBundleBody>,
) -> Result<Response, ApiError> {
    let rows = match body.products {
        Some(rows) => rows,
        None => state.bundles.bundle_products(&bundle_id).await?,
    };
    let report = state.validator.validate(&bundle_id, &rows).await?;
    Ok(Json(json!({ "success": true, "data": report })).into_response())
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CleanupBundleBody {
    #[serde(default)]
    orphaned_product_ids: Option<Vec<String>>,
    #[serde(default)]
    dry_run: bool,
}

async fn cleanup_bundle_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(bundle_id): AxumPath<String>,
    Json(body): Json<CleanupBundleBody>,
) -> Result<Response, ApiError> {
    let options = CleanupOptions {
        dry_run: body.dry_run,
        explicit_ids: body.orphaned_product_ids.filter(|ids| !ids.is_empty()),
    };
    let report = state
        .cleanup
        .cleanup(&bundle_id, options)
        .await
        .map_err(|err| match err {
            CleanupError::BundleNotFound(id) => ApiError::NotFound(format!("bundle {id} not found")),
            other => ApiError::internal(other),
        })?;

    let message = if report.removed.is_empty() {
        "no orphaned references to remove".to_string()
    } else if report.dry_run {
        format!("{} orphaned reference(s) would be removed", report.removed.len())
    } else {
        format!("removed {} orphaned reference(s)", report.removed.len())
    };

    Ok(Json(json!({ "success": true, "message": message, "data": report })).into_response())
}

async fn validate_product_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(product_id): AxumPath<String>,
) -> Result<Response, ApiError> {
    let check = state.validator.validate_product_reference(&product_id).await?;
    Ok(Json(json!({ "success": true, "data": check })).into_response())
}

// ---------------------------------------------------------------------------
// Health and sync operations
// ---------------------------------------------------------------------------

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let health = state.sync.health().await;
    Json(json!({ "success": true, "data": health })).into_response()
}

async fn sync_trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    let report = state.sync.run(SyncTrigger::Manual).await;
    Json(json!({ "success": true, "data": report })).into_response()
}

async fn sync_status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let health = state.sync.health().await;
    let history = state.sync.history(20).await?;
    Ok(Json(json!({
        "success": true,
        "data": {
            "health": health,
            "last_run": history.first(),
            "history": history,
        },
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use rallykit_catalog::static_catalog;
    use rallykit_core::Product;
    use rallykit_storage::{MemoryAuthoringStore, MemoryStore};
    use tower::ServiceExt;

    struct TestHarness {
        app: Router,
        primary: Arc<MemoryStore>,
        authoring: Arc<MemoryAuthoringStore>,
    }

    /// Primary seeded with the static catalog plus one admin-made test pack
    /// holding a valid, a missing and an inactive reference.
    async fn harness() -> TestHarness {
        let primary = Arc::new(MemoryStore::default());
        for bundle in static_catalog() {
            primary.insert(bundle).await;
        }
        primary
            .insert_product(Product {
                id: "p1".into(),
                name: "Casquettes personnalisées".into(),
                base_price: 2_500,
                is_active: true,
            })
            .await;
        primary
            .insert_product(Product {
                id: "p3".into(),
                name: "Anciens flyers".into(),
                base_price: 200,
                is_active: false,
            })
            .await;
        let mut test_pack = static_catalog().remove(0);
        test_pack.id = "test-pack-001".into();
        test_pack.name = "Pack de Test".into();
        test_pack.original_total = 0;
        test_pack.products = vec![
            BundleProduct {
                product_id: "p1".into(),
                name: "Casquettes personnalisées".into(),
                quantity: 10,
                custom_price: None,
                is_required: true,
                display_order: 0,
            },
            BundleProduct {
                product_id: "p2".into(),
                name: "Produit supprimé".into(),
                quantity: 5,
                custom_price: Some(1_000),
                is_required: false,
                display_order: 1,
            },
            BundleProduct {
                product_id: "p3".into(),
                name: "Anciens flyers".into(),
                quantity: 100,
                custom_price: None,
                is_required: false,
                display_order: 2,
            },
        ];
        primary.insert(test_pack).await;

        let authoring = Arc::new(MemoryAuthoringStore::default());
        authoring.set_bundles(static_catalog()).await;

        let state = AppState::build(
            primary.clone(),
            primary.clone(),
            primary.clone(),
            authoring.clone(),
            Duration::from_millis(250),
        );
        TestHarness { app: app(state), primary, authoring }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value, axum::http::HeaderMap) {
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value, headers)
    }

    async fn send_json(
        app: Router,
        method: &str,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn list_serves_primary_with_long_cache() {
        let h = harness().await;
        let (status, body, headers) = get_json(h.app, "/campaign-bundles").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["source"], json!("primary"));
        assert!(body.get("warning").is_none());
        assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=900");
        assert_eq!(body["data"].as_array().map(Vec::len), Some(5));
    }

    #[tokio::test]
    async fn list_falls_back_by_tier_with_cache_and_warning() {
        let h = harness().await;
        h.primary.set_down(true);
        let (status, body, headers) = get_json(h.app.clone(), "/campaign-bundles").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], json!("authoring"));
        assert!(body["warning"].as_str().is_some());
        assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=300");

        h.authoring.set_down(true);
        let (status, body, headers) = get_json(h.app, "/campaign-bundles").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], json!("static"));
        assert!(body["warning"].as_str().expect("warning").contains("degraded"));
        assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=60");
    }

    #[tokio::test]
    async fn list_filters_apply_in_degraded_mode_too() {
        let h = harness().await;
        h.primary.set_down(true);
        h.authoring.set_down(true);
        let (_, body, _) =
            get_json(h.app, "/campaign-bundles?audience=local&featured=true").await;
        let ids: Vec<&str> = body["data"]
            .as_array()
            .expect("data")
            .iter()
            .filter_map(|b| b["id"].as_str())
            .collect();
        assert_eq!(ids, vec!["local-starter-001"]);
    }

    #[tokio::test]
    async fn list_rejects_unknown_audience() {
        let h = harness().await;
        let (status, body, _) = get_json(h.app, "/campaign-bundles?audience=galactic").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("validation_error"));
    }

    #[tokio::test]
    async fn single_bundle_carries_etag_and_404s_when_nowhere() {
        let h = harness().await;
        let (status, body, headers) =
            get_json(h.app.clone(), "/campaign-bundles/local-starter-001").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["id"], json!("local-starter-001"));
        assert!(headers[header::ETAG]
            .to_str()
            .expect("etag")
            .starts_with("\"bundle-local-starter-001-"));

        let (status, body, _) = get_json(h.app, "/campaign-bundles/no-such-pack").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("not_found"));
    }

    #[tokio::test]
    async fn create_computes_totals_and_rejects_bad_references() {
        let h = harness().await;
        let (status, body) = send_json(
            h.app.clone(),
            "POST",
            "/campaign-bundles",
            json!({
                "id": "custom-pack-001",
                "name": "Pack Custom",
                "target_audience": "local",
                "budget_range": "starter",
                "products": [
                    { "product_id": "p1", "quantity": 10 },
                ],
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        // 10 × 2 500 live base price, baseline derived from the markup.
        assert_eq!(body["data"]["estimated_total"], json!(25_000));
        assert_eq!(body["data"]["savings"], json!(3_750));

        let (status, body) = send_json(
            h.app,
            "POST",
            "/campaign-bundles",
            json!({
                "name": "Pack Cassé",
                "target_audience": "local",
                "budget_range": "starter",
                "products": [
                    { "product_id": "ghost", "quantity": 1 },
                    { "product_id": "p3", "quantity": 1 },
                ],
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["fields"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn delete_cascades_and_404s_after() {
        let h = harness().await;
        let (status, _) = send_json(
            h.app.clone(),
            "DELETE",
            "/campaign-bundles/test-pack-001",
            json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(h.primary.get_bundle("test-pack-001").await.expect("store").is_none());

        let (status, _, _) = get_json(h.app.clone(), "/campaign-bundles/test-pack-001").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            send_json(h.app, "DELETE", "/campaign-bundles/test-pack-001", json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn recalculate_webhook_isolates_per_bundle_failures() {
        let h = harness().await;
        let (status, body) = send_json(
            h.app,
            "POST",
            "/campaign-bundles/recalculate-totals",
            json!({
                "bundle_product_id": "p1",
                "campaign_bundle_ids": ["test-pack-001", "ghost-pack"],
                "trigger": "product_updated",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let results = body["results"].as_array().expect("results");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["success"], json!(true));
        assert_eq!(results[1]["success"], json!(false));
        assert_eq!(body["statistics"]["succeeded"], json!(1));
        assert_eq!(body["statistics"]["failed"], json!(1));
    }

    #[tokio::test]
    async fn webhook_accepts_a_single_string_id() {
        let h = harness().await;
        let (status, body) = send_json(
            h.app,
            "POST",
            "/campaign-bundles/recalculate-totals",
            json!({
                "bundle_product_id": "p1",
                "campaign_bundle_ids": "test-pack-001",
                "trigger": "manual",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["statistics"]["total"], json!(1));
    }

    #[tokio::test]
    async fn validate_endpoint_reports_problem_references() {
        let h = harness().await;
        let (status, body) = send_json(
            h.app,
            "POST",
            "/admin/bundle-reference/validate/test-pack-001",
            json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let report = &body["data"];
        assert_eq!(report["healthy"], json!(false));
        assert_eq!(report["valid"], json!(["p1"]));
        assert_eq!(report["problems"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn validate_endpoint_accepts_presave_products() {
        let h = harness().await;
        let (status, body) = send_json(
            h.app,
            "POST",
            "/admin/bundle-reference/validate/draft-pack",
            json!({
                "products": [{
                    "product_id": "p1",
                    "name": "Casquettes personnalisées",
                    "quantity": 5,
                    "custom_price": null,
                    "is_required": false,
                    "display_order": 0,
                }],
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["healthy"], json!(true));
    }

    #[tokio::test]
    async fn cleanup_endpoint_removes_missing_and_recalculates() {
        let h = harness().await;
        let (status, body) = send_json(
            h.app.clone(),
            "POST",
            "/admin/bundle-reference/cleanup/test-pack-001",
            json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["removed"], json!(["p2"]));
        // p1: 10 × 2 500 + p3: 100 × 200 (inactive but still resolving).
        assert_eq!(body["data"]["totals"]["estimated_total"], json!(45_000));

        let stored = h.primary.get_bundle("test-pack-001").await.expect("store").expect("bundle");
        assert_eq!(stored.estimated_total, 45_000);
        assert_eq!(stored.products.len(), 2);

        let (status, _) = send_json(
            h.app,
            "POST",
            "/admin/bundle-reference/cleanup/ghost-pack",
            json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cleanup_dry_run_leaves_storage_untouched() {
        let h = harness().await;
        let before = h.primary.get_bundle("test-pack-001").await.expect("store").expect("bundle");
        let (status, body) = send_json(
            h.app,
            "POST",
            "/admin/bundle-reference/cleanup/test-pack-001",
            json!({ "dryRun": true }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["removed"], json!(["p2"]));
        assert_eq!(body["data"]["dry_run"], json!(true));

        let after = h.primary.get_bundle("test-pack-001").await.expect("store").expect("bundle");
        assert_eq!(after.products.len(), before.products.len());
        assert_eq!(after.estimated_total, before.estimated_total);
    }

    #[tokio::test]
    async fn product_reference_check_reports_flags() {
        let h = harness().await;
        let (_, body, _) = get_json(h.app.clone(), "/admin/product-reference/validate/p1").await;
        assert_eq!(body["data"]["exists"], json!(true));
        assert_eq!(body["data"]["active"], json!(true));

        let (_, body, _) = get_json(h.app.clone(), "/admin/product-reference/validate/p3").await;
        assert_eq!(body["data"]["active"], json!(false));

        let (_, body, _) = get_json(h.app, "/admin/product-reference/validate/ghost").await;
        assert_eq!(body["data"]["exists"], json!(false));
    }

    #[tokio::test]
    async fn sync_trigger_and_status_round_trip() {
        let h = harness().await;
        h.authoring
            .set_products(vec![Product {
                id: "p9".into(),
                name: "Nouveau produit".into(),
                base_price: 750,
                is_active: true,
            }])
            .await;

        let (status, body) = send_json(h.app.clone(), "POST", "/admin/sync/trigger", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["run"]["status"], json!("success"));

        let (status, body, _) = get_json(h.app, "/admin/sync/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["health"]["primary"], json!(true));
        assert_eq!(body["data"]["history"].as_array().map(Vec::len), Some(1));
        assert_eq!(body["data"]["last_run"]["trigger"], json!("manual"));
    }

    #[tokio::test]
    async fn health_endpoint_reports_store_liveness() {
        let h = harness().await;
        let (status, body, _) = get_json(h.app.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["primary"], json!(true));
        assert_eq!(body["data"]["authoring"], json!(true));

        h.primary.set_down(true);
        let (_, body, _) = get_json(h.app, "/health").await;
        assert_eq!(body["data"]["primary"], json!(false));
    }
}
