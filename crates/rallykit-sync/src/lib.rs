//! Sync orchestration: pulls authoritative catalog data into the primary
//! store under a health-gated, retry-bounded state machine, plus runtime
//! configuration and the cron scheduler.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use rallykit_core::{SyncCounts, SyncRun, SyncStatus, SyncTrigger};
use rallykit_storage::{
    with_timeout, AuthoringStore, BackoffPolicy, BundleStore, StoreError, SyncRunStore,
};

pub const CRATE_NAME: &str = "rallykit-sync";

/// Combined creates+updates above which a run is flagged as a notable
/// catalog change. Advisory only.
pub const NOTABLE_CHANGE_THRESHOLD: i32 = 10;

// ---------------------------------------------------------------------------
// Runtime configuration
// ---------------------------------------------------------------------------

/// Process configuration: an optional `rallykit.yaml` at the workspace root,
/// with environment variables taking precedence over both the file and the
/// defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RuntimeConfig {
    pub database_url: Option<String>,
    pub authoring_url: Option<String>,
    pub web_port: u16,
    pub scheduler_enabled: bool,
    /// Seconds-first cron expression; default is every six hours.
    pub sync_cron: String,
    pub store_timeout_ms: u64,
    pub http_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            authoring_url: None,
            web_port: 8080,
            scheduler_enabled: false,
            sync_cron: "0 0 */6 * * *".to_string(),
            store_timeout_ms: 250,
            http_timeout_secs: 20,
        }
    }
}

impl RuntimeConfig {
    pub fn load(workspace_root: &Path) -> anyhow::Result<Self> {
        let path = workspace_root.join("rallykit.yaml");
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Ok(url) = std::env::var("RALLYKIT_AUTHORING_URL") {
            self.authoring_url = Some(url);
        }
        if let Some(port) = env_parse("RALLYKIT_WEB_PORT") {
            self.web_port = port;
        }
        if let Ok(v) = std::env::var("RALLYKIT_SCHEDULER_ENABLED") {
            self.scheduler_enabled = matches!(v.as_str(), "1" | "true" | "TRUE" | "True");
        }
        if let Ok(cron) = std::env::var("RALLYKIT_SYNC_CRON") {
            self.sync_cron = cron;
        }
        if let Some(ms) = env_parse("RALLYKIT_STORE_TIMEOUT_MS") {
            self.store_timeout_ms = ms;
        }
        if let Some(secs) = env_parse("RALLYKIT_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = secs;
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

// ---------------------------------------------------------------------------
// Sync job
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    /// Authoring store entirely unreachable; aborts the run, no retry.
    #[error("authoring store unreachable: {0}")]
    Fatal(String),
    /// Retried with backoff up to the policy's bound.
    #[error("transient sync failure: {0}")]
    Transient(String),
}

/// Per-store liveness, also served over the health endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StoreHealth {
    pub primary: bool,
    pub authoring: bool,
}

/// Finalized outcome of one run, with the per-entity breakdown that the
/// durable `SyncRun` row aggregates away.
#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub run: SyncRun,
    pub entities: BTreeMap<String, SyncCounts>,
    pub warnings: Vec<String>,
    pub notable_change: bool,
}

/// Pulls products, categories and bundles from the authoring store into the
/// primary store. Runs are globally serialized: a full sync touches the whole
/// catalog, so at most one execution is in flight at a time.
pub struct SyncJobRunner {
    authoring: Arc<dyn AuthoringStore>,
    bundles: Arc<dyn BundleStore>,
    runs: Arc<dyn SyncRunStore>,
    backoff: BackoffPolicy,
    store_timeout: Duration,
    run_gate: Mutex<()>,
}

impl SyncJobRunner {
    pub fn new(
        authoring: Arc<dyn AuthoringStore>,
        bundles: Arc<dyn BundleStore>,
        runs: Arc<dyn SyncRunStore>,
    ) -> Self {
        Self {
            authoring,
            bundles,
            runs,
            backoff: BackoffPolicy::default(),
            store_timeout: Duration::from_millis(250),
            run_gate: Mutex::new(()),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub async fn health(&self) -> StoreHealth {
        let primary = with_timeout(self.store_timeout, self.bundles.health())
            .await
            .is_ok();
        let authoring = with_timeout(self.store_timeout, self.authoring.health())
            .await
            .is_ok();
        StoreHealth { primary, authoring }
    }

    pub async fn history(&self, limit: i64) -> Result<Vec<SyncRun>, StoreError> {
        self.runs.recent(limit).await
    }

    /// Drives one run through HealthChecking, then Importing with bounded
    /// retry, and finalizes the durable record either way. The scheduler's
    /// fixed interval is independent of the in-run backoff.
    pub async fn run(&self, trigger: SyncTrigger) -> SyncReport {
        let _gate = self.run_gate.lock().await;

        let mut run = SyncRun::begin(trigger);
        let mut warnings = Vec::new();
        let mut entities = BTreeMap::new();

        info!(run_id = %run.id, trigger = trigger.as_str(), "sync run starting");

        let health = self.health().await;
        if !health.authoring {
            // Nothing to import from; abort without touching the retry budget.
            run.status = SyncStatus::Aborted;
            run.completed_at = Some(Utc::now());
            let fatal = SyncError::Fatal("health probe failed".to_string());
            warnings.push(format!("{fatal}; run aborted"));
            warn!(run_id = %run.id, "authoring store unreachable; aborting sync run");
            self.persist_start_and_final(&run).await;
            return SyncReport { run, entities, warnings, notable_change: false };
        }
        if !health.primary {
            warnings.push("primary store unhealthy; proceeding in degraded mode".to_string());
            warn!(run_id = %run.id, "primary store unhealthy; sync proceeding in degraded mode");
        }

        if let Err(err) = self.runs.record_start(&run).await {
            warnings.push(format!("failed to record run start: {err}"));
        }

        let mut retries = 0usize;
        loop {
            match self.import_all().await {
                Ok((counts, breakdown)) => {
                    run.counts = counts;
                    entities = breakdown;
                    run.status = if counts.errors > 0 {
                        SyncStatus::Partial
                    } else {
                        SyncStatus::Success
                    };
                    break;
                }
                Err(err) => {
                    if retries < self.backoff.max_retries {
                        let delay = self.backoff.delay_for_attempt(retries);
                        retries += 1;
                        run.retry_count = retries as i32;
                        warn!(
                            run_id = %run.id,
                            retry = retries,
                            delay_secs = delay.as_secs(),
                            error = %err,
                            "import failed; retrying after backoff"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        run.status = SyncStatus::Failed;
                        warnings.push(format!("import failed after {retries} retries: {err}"));
                        warn!(run_id = %run.id, error = %err, "sync run failed; retry budget exhausted");
                        break;
                    }
                }
            }
        }

        run.completed_at = Some(Utc::now());
        if let Err(err) = self.runs.finalize(&run).await {
            warnings.push(format!("failed to finalize run record: {err}"));
        }

        let notable_change = matches!(run.status, SyncStatus::Success | SyncStatus::Partial)
            && run.counts.changed() > NOTABLE_CHANGE_THRESHOLD;
        if notable_change {
            info!(
                run_id = %run.id,
                created = run.counts.created,
                updated = run.counts.updated,
                "notable catalog change"
            );
        }

        info!(
            run_id = %run.id,
            status = run.status.as_str(),
            created = run.counts.created,
            updated = run.counts.updated,
            skipped = run.counts.skipped,
            errors = run.counts.errors,
            "sync run finished"
        );

        SyncReport { run, entities, warnings, notable_change }
    }

    /// One import pass over every entity type. A failed batch fetch is a
    /// transient error for the whole pass; individual record failures are
    /// isolated into the error count.
    async fn import_all(
        &self,
    ) -> Result<(SyncCounts, BTreeMap<String, SyncCounts>), SyncError> {
        let mut breakdown = BTreeMap::new();
        let mut total = SyncCounts::default();

        let products = self
            .authoring
            .list_products()
            .await
            .map_err(|err| SyncError::Transient(err.to_string()))?;
        let mut counts = SyncCounts::default();
        for product in &products {
            match self.bundles.upsert_product(product).await {
                Ok(outcome) => counts.absorb(outcome.as_counts()),
                Err(err) => {
                    warn!(product_id = %product.id, error = %err, "product upsert failed");
                    counts.errors += 1;
                }
            }
        }
        total.absorb(counts);
        breakdown.insert("products".to_string(), counts);

        let categories = self
            .authoring
            .list_categories()
            .await
            .map_err(|err| SyncError::Transient(err.to_string()))?;
        let mut counts = SyncCounts::default();
        for category in &categories {
            match self.bundles.upsert_category(category).await {
                Ok(outcome) => counts.absorb(outcome.as_counts()),
                Err(err) => {
                    warn!(category_id = %category.id, error = %err, "category upsert failed");
                    counts.errors += 1;
                }
            }
        }
        total.absorb(counts);
        breakdown.insert("categories".to_string(), counts);

        let bundles = self
            .authoring
            .list_bundles()
            .await
            .map_err(|err| SyncError::Transient(err.to_string()))?;
        let mut counts = SyncCounts::default();
        for bundle in &bundles {
            match self.bundles.upsert_bundle(bundle).await {
                Ok(outcome) => counts.absorb(outcome.as_counts()),
                Err(err) => {
                    warn!(bundle_id = %bundle.id, error = %err, "bundle upsert failed");
                    counts.errors += 1;
                }
            }
        }
        total.absorb(counts);
        breakdown.insert("bundles".to_string(), counts);

        Ok((total, breakdown))
    }

    /// Aborted runs never saw `record_start`; write both phases in one go so
    /// the history still shows them.
    async fn persist_start_and_final(&self, run: &SyncRun) {
        if let Err(err) = self.runs.record_start(run).await {
            warn!(run_id = %run.id, error = %err, "failed to record aborted run");
            return;
        }
        if let Err(err) = self.runs.finalize(run).await {
            warn!(run_id = %run.id, error = %err, "failed to finalize aborted run");
        }
    }
}

/// Registers the fixed-interval job that re-triggers the sync independent of
/// any in-run retry backoff. Call `start()` on the returned scheduler.
pub async fn build_scheduler(
    runner: Arc<SyncJobRunner>,
    cron: &str,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let runner = runner.clone();
        Box::pin(async move {
            let report = runner.run(SyncTrigger::Scheduled).await;
            info!(
                run_id = %report.run.id,
                status = report.run.status.as_str(),
                "scheduled sync finished"
            );
        })
    })
    .with_context(|| format!("creating sync job for cron {cron}"))?;
    scheduler.add(job).await.context("adding sync job")?;
    Ok(scheduler)
}
