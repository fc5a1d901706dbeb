//! Sync pipeline: run the webshop adapters, reconcile their batches into the
//! persisted catalog, validate offer links, then save, snapshot and report.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gfpc_adapters::{AdapterContext, LinkRepairRule, SourceAdapter, WebshopAdapter, WebshopConfig};
use gfpc_core::RunStats;
use gfpc_storage::{CatalogStore, HttpClientConfig, HttpFetcher, TokenBucketConfig};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

pub mod dedup;
pub mod links;
pub mod orchestrator;
pub mod reconcile;
pub mod report;

pub use dedup::{dedupe, DedupConfig, DedupEngine, NearDuplicate};
pub use links::{repair_url, slugify, validate_links, LinkProbe, LinkValidatorConfig, ProbeOutcome};
pub use orchestrator::{run_sources, OrchestratorConfig, OrchestratorOutcome, SourceBatch, SourceFailure};
pub use reconcile::merge;
pub use report::{report_daily_markdown, RunReport};

pub const CRATE_NAME: &str = "gfpc-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<WebshopConfig>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &WebshopConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn repair_rules(&self) -> HashMap<String, LinkRepairRule> {
        self.enabled()
            .filter_map(|s| s.link_repair.map(|rule| (s.source_id.clone(), rule)))
            .collect()
    }

    pub fn adapters(&self) -> Vec<Arc<dyn SourceAdapter>> {
        self.enabled()
            .map(|s| Arc::new(WebshopAdapter::new(s.clone())) as Arc<dyn SourceAdapter>)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub catalog_path: PathBuf,
    pub snapshots_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agents: Vec<String>,
    pub http_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_concurrent_sources: usize,
    pub per_source_concurrency: usize,
    pub max_concurrent_probes: usize,
    pub probe_delay_ms: u64,
    /// Global request budget shared by crawls and link checks; 0 disables it.
    pub token_bucket_capacity: u32,
    pub token_refill_ms: u64,
    pub source_timeout_secs: Option<u64>,
    pub target_products: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn default_user_agents() -> Vec<String> {
    [
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
        "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("GFPC_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            catalog_path: std::env::var("CATALOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("data").join("products.json")),
            snapshots_dir: std::env::var("SNAPSHOTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("data").join("backups")),
            reports_dir: std::env::var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("reports")),
            user_agents: std::env::var("GFPC_USER_AGENTS")
                .map(|v| {
                    v.split('|')
                        .map(str::trim)
                        .filter(|ua| !ua.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_else(|_| default_user_agents()),
            http_timeout_secs: env_parse("GFPC_HTTP_TIMEOUT_SECS").unwrap_or(30),
            connect_timeout_secs: env_parse("GFPC_CONNECT_TIMEOUT_SECS").unwrap_or(10),
            max_concurrent_sources: env_parse("GFPC_MAX_CONCURRENT_SOURCES").unwrap_or(10),
            per_source_concurrency: env_parse("GFPC_PER_SOURCE_CONCURRENCY").unwrap_or(5),
            max_concurrent_probes: env_parse("GFPC_MAX_CONCURRENT_PROBES").unwrap_or(8),
            probe_delay_ms: env_parse("GFPC_PROBE_DELAY_MS").unwrap_or(100),
            token_bucket_capacity: env_parse("GFPC_TOKEN_BUCKET_CAPACITY").unwrap_or(20),
            token_refill_ms: env_parse("GFPC_TOKEN_REFILL_MS").unwrap_or(100),
            source_timeout_secs: env_parse("GFPC_SOURCE_TIMEOUT_SECS"),
            target_products: env_parse("GFPC_TARGET_PRODUCTS").unwrap_or(2500),
            scheduler_enabled: std::env::var("GFPC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            workspace_root,
        }
    }

    /// Defaults rooted at `root`, without reading the environment.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let workspace_root = root.into();
        Self {
            catalog_path: workspace_root.join("data").join("products.json"),
            snapshots_dir: workspace_root.join("data").join("backups"),
            reports_dir: workspace_root.join("reports"),
            user_agents: default_user_agents(),
            http_timeout_secs: 30,
            connect_timeout_secs: 10,
            max_concurrent_sources: 10,
            per_source_concurrency: 5,
            max_concurrent_probes: 8,
            probe_delay_ms: 100,
            token_bucket_capacity: 20,
            token_refill_ms: 100,
            source_timeout_secs: None,
            target_products: 2500,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            workspace_root,
        }
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            user_agents: self.user_agents.clone(),
            global_concurrency: self.max_concurrent_sources.max(self.max_concurrent_probes),
            per_source_concurrency: self.per_source_concurrency,
            token_bucket: (self.token_bucket_capacity > 0).then(|| TokenBucketConfig {
                capacity: self.token_bucket_capacity,
                refill_every: Duration::from_millis(self.token_refill_ms),
            }),
            ..Default::default()
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrent_sources: self.max_concurrent_sources,
            source_timeout: self.source_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn link_validation(&self) -> LinkValidatorConfig {
        LinkValidatorConfig {
            max_concurrent_probes: self.max_concurrent_probes,
            probe_delay: Duration::from_millis(self.probe_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: RunStats,
    pub failed_sources: Vec<String>,
    pub catalog_path: String,
    pub catalog_sha256: String,
    pub catalog_bytes: usize,
    pub total_products: usize,
    pub snapshot_path: String,
    pub report_path: String,
    pub brief_path: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    store: CatalogStore,
    dedup: DedupEngine,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client())?;
        let store = CatalogStore::new(config.catalog_path.clone(), config.snapshots_dir.clone());
        Ok(Self {
            config,
            http,
            store,
            dedup: DedupEngine::new(DedupConfig::default()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    /// One full run against the sources in `sources.yaml`.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let registry = self.load_source_registry().await?;
        let adapters = registry.adapters();
        let repair_rules = registry.repair_rules();
        self.run_once_with(&adapters, &repair_rules, &self.http).await
    }

    pub async fn run_once_with(
        &self,
        adapters: &[Arc<dyn SourceAdapter>],
        repair_rules: &HashMap<String, LinkRepairRule>,
        probe: &dyn LinkProbe,
    ) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let _lock = self
            .store
            .acquire_lock()
            .await
            .context("acquiring catalog lock")?;
        let existing = self.store.load().await.context("loading catalog")?;

        info!(%run_id, sources = adapters.len(), products = existing.len(), "sync run started");
        let mut stats = RunStats::new(adapters.len());
        let ctx = AdapterContext {
            run_id,
            fetched_at: started_at,
        };

        let outcome = run_sources(adapters, &self.http, &ctx, self.config.orchestrator(), &mut stats).await;
        let mut catalog = merge(existing, &outcome.batches, &mut stats);
        validate_links(
            &mut catalog,
            repair_rules,
            probe,
            self.config.link_validation(),
            &mut stats,
        )
        .await;

        let saved = self.store.save(&catalog).await.context("saving catalog")?;
        let snapshot_path = self
            .store
            .write_snapshot(&catalog, started_at)
            .await
            .context("writing catalog snapshot")?;

        let near_duplicates = self.dedup.review(&catalog);
        let finished_at = Utc::now();
        let run_report = RunReport::build(report::ReportInput {
            run_id,
            started_at,
            finished_at,
            catalog: &catalog,
            stats: &stats,
            failures: &outcome.failures,
            near_duplicates: &near_duplicates,
            target_products: self.config.target_products,
        });
        let written = report::write_report(&self.config.reports_dir, &run_report).await?;

        info!(
            %run_id,
            products = saved.products,
            new = stats.new,
            updated = stats.updated,
            errors = stats.errors,
            links_fixed = stats.links_fixed,
            "sync run finished"
        );

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            stats,
            failed_sources: outcome.failures.into_iter().map(|f| f.source_id).collect(),
            catalog_path: saved.path.display().to_string(),
            catalog_sha256: saved.content_hash,
            catalog_bytes: saved.byte_size,
            total_products: saved.products,
            snapshot_path: snapshot_path.display().to_string(),
            report_path: written.json_path.display().to_string(),
            brief_path: written.brief_path.display().to_string(),
        })
    }

    /// Cron-driven runs; `None` unless the scheduler is enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        products = summary.total_products,
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.config.workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    SyncPipeline::new(SyncConfig::from_env())?.run_once().await
}
