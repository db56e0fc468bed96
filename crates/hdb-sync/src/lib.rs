//! Pipeline orchestration: configuration, stage entry points, run reports and scheduling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hdb_adapters::{
    AddressResolver, DatasetFetcher, GeocodeClient, GeocodeConfig, Transport, TransportConfig,
    DEFAULT_DATASET_API,
};
use hdb_core::DatasetKind;
use hdb_storage::{Store, StoreConfig, DEFAULT_CHUNK_SIZE};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod enrich;
mod ingest;
mod lock;

pub use enrich::{
    address_keys, missing_addresses, AddressEnricher, EnrichConfig, EnrichError, EnrichOutcome,
    EnrichSummary, UnresolvedAddress, DEFAULT_FLUSH_EVERY,
};
pub use ingest::{prepare_snapshot, IngestError, IngestSummary, TransactionIngestor};
pub use lock::{RunLock, RunLockError};

pub const CRATE_NAME: &str = "hdb-sync";

pub const DEFAULT_GEOCODE_RATE_PER_MIN: u32 = 250;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub workspace_root: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub write_chunk_size: usize,
    pub geocode_concurrency: usize,
    pub geocode_rate_per_min: u32,
    pub enrich_flush_every: usize,
    pub dataset_api: String,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
            value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        }

        Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://hdb.sqlite".to_string()),
            workspace_root: lookup("HDB_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            scheduler_enabled: lookup("HDB_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: lookup("SYNC_CRON_1").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            sync_cron_2: lookup("SYNC_CRON_2").unwrap_or_else(|| "0 0 18 * * *".to_string()),
            user_agent: lookup("HDB_USER_AGENT").unwrap_or_else(|| "hdb-pipeline/0.1".to_string()),
            http_timeout_secs: parsed(lookup("HDB_HTTP_TIMEOUT_SECS"), 20),
            write_chunk_size: parsed(lookup("HDB_WRITE_CHUNK_SIZE"), DEFAULT_CHUNK_SIZE).max(1),
            geocode_concurrency: parsed(lookup("HDB_GEOCODE_CONCURRENCY"), 1).max(1),
            geocode_rate_per_min: parsed(lookup("HDB_GEOCODE_RATE_PER_MIN"), DEFAULT_GEOCODE_RATE_PER_MIN)
                .max(1),
            enrich_flush_every: parsed(lookup("HDB_ENRICH_FLUSH_EVERY"), DEFAULT_FLUSH_EVERY).max(1),
            dataset_api: lookup("HDB_DATASET_API").unwrap_or_else(|| DEFAULT_DATASET_API.to_string()),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.database_url.clone()).with_chunk_size(self.write_chunk_size)
    }

    pub fn dataset_transport_config(&self) -> TransportConfig {
        TransportConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    /// Geocoding gets its own transport so pacing never slows dataset downloads.
    pub fn geocode_transport_config(&self) -> TransportConfig {
        TransportConfig {
            max_in_flight: self.geocode_concurrency,
            ..self.dataset_transport_config()
        }
        .paced_per_minute(self.geocode_rate_per_min)
    }

    pub fn enrich_config(&self) -> EnrichConfig {
        EnrichConfig {
            concurrency: self.geocode_concurrency,
            flush_every: self.enrich_flush_every,
            ..Default::default()
        }
    }

    pub fn reports_dir(&self, run_id: Uuid) -> PathBuf {
        self.workspace_root.join("reports").join(run_id.to_string())
    }
}

/// An open store plus the HTTP transports the stages share.
pub struct Pipeline {
    config: PipelineConfig,
    store: Store,
    dataset_http: Arc<Transport>,
    geocode_http: Arc<Transport>,
}

impl Pipeline {
    /// Open the store and bring its schema up to date.
    pub async fn open(config: PipelineConfig) -> Result<Self> {
        let dataset_http = Arc::new(
            Transport::new("dataset", config.dataset_transport_config()).context("building dataset client")?,
        );
        let geocode_http = Arc::new(
            Transport::new("geocode", config.geocode_transport_config()).context("building geocode client")?,
        );
        let store = Store::open(&config.store_config())
            .await
            .context("opening store")?;
        if let Err(err) = store.migrate().await {
            store.close().await;
            return Err(err).context("applying migrations");
        }
        Ok(Self {
            config,
            store,
            dataset_http,
            geocode_http,
        })
    }

    pub async fn close(self) {
        self.store.close().await;
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Publish column descriptions. Schema migrations already ran in [`Pipeline::open`].
    pub async fn migrate(&self) -> Result<usize> {
        let report = self
            .store
            .publish_schema_metadata()
            .await
            .context("publishing schema metadata")?;
        Ok(report.rows)
    }

    pub async fn ingest(&self, run_id: Uuid, dataset: DatasetKind) -> Result<IngestSummary> {
        let fetcher = DatasetFetcher::new(self.dataset_http.clone(), self.config.dataset_api.clone());
        TransactionIngestor::new(&self.store, &fetcher)
            .run(run_id, dataset)
            .await
            .with_context(|| format!("ingesting {dataset} transactions"))
    }

    pub async fn connect_geocoder(&self, config: GeocodeConfig, run_id: Uuid) -> Result<GeocodeClient> {
        GeocodeClient::connect(config, self.geocode_http.clone(), run_id)
            .await
            .context("connecting to geocoding service")
    }

    pub async fn enrich(&self, resolver: &dyn AddressResolver) -> Result<EnrichOutcome> {
        AddressEnricher::new(&self.store, resolver, self.config.enrich_config())
            .run()
            .await
            .context("enriching addresses")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrateSummary {
    pub run_id: Uuid,
    pub metadata_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunAllSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ingested: Vec<IngestSummary>,
    pub enrichment: EnrichOutcome,
    pub reports_dir: PathBuf,
}

/// Write `reports/<run_id>/<stage>.json` under `workspace_root`.
pub async fn write_report<T: Serialize>(
    workspace_root: &Path,
    run_id: Uuid,
    stage: &str,
    report: &T,
) -> Result<PathBuf> {
    let reports_dir = workspace_root.join("reports").join(run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    let path = reports_dir.join(format!("{stage}.json"));
    let bytes = serde_json::to_vec_pretty(report).with_context(|| format!("serializing {stage} report"))?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

fn acquire_lock(config: &PipelineConfig) -> Result<RunLock> {
    RunLock::acquire(&config.workspace_root).context("acquiring run lock")
}

pub async fn run_migrate(config: &PipelineConfig) -> Result<MigrateSummary> {
    let _lock = acquire_lock(config)?;
    let run_id = Uuid::new_v4();
    let pipeline = Pipeline::open(config.clone()).await?;
    let result = pipeline.migrate().await;
    pipeline.close().await;

    let summary = MigrateSummary {
        run_id,
        metadata_rows: result?,
    };
    write_report(&config.workspace_root, run_id, "migrate", &summary).await?;
    Ok(summary)
}

pub async fn run_ingest(config: &PipelineConfig, dataset: DatasetKind) -> Result<IngestSummary> {
    let _lock = acquire_lock(config)?;
    let run_id = Uuid::new_v4();
    let pipeline = Pipeline::open(config.clone()).await?;
    let result = pipeline.ingest(run_id, dataset).await;
    pipeline.close().await;

    let summary = result?;
    write_report(&config.workspace_root, run_id, &format!("ingest-{}", dataset.source_id()), &summary).await?;
    Ok(summary)
}

pub async fn run_enrich(config: &PipelineConfig, geocode: GeocodeConfig) -> Result<EnrichOutcome> {
    let _lock = acquire_lock(config)?;
    let run_id = Uuid::new_v4();
    let pipeline = Pipeline::open(config.clone()).await?;
    let result = async {
        let client = pipeline.connect_geocoder(geocode, run_id).await?;
        pipeline.enrich(&client).await
    }
    .instrument(info_span!("enrich", %run_id))
    .await;
    pipeline.close().await;

    let outcome = result?;
    write_report(&config.workspace_root, run_id, "enrich", &outcome).await?;
    Ok(outcome)
}

/// Ingest both datasets, then enrich, under one lock and one run id.
pub async fn run_all_once(config: &PipelineConfig, geocode: GeocodeConfig) -> Result<RunAllSummary> {
    let _lock = acquire_lock(config)?;
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(%run_id, "pipeline run started");

    let pipeline = Pipeline::open(config.clone()).await?;
    let result = async {
        let mut ingested = Vec::with_capacity(DatasetKind::ALL.len());
        for dataset in DatasetKind::ALL {
            let summary = pipeline.ingest(run_id, dataset).await?;
            write_report(&config.workspace_root, run_id, &format!("ingest-{}", dataset.source_id()), &summary)
                .await?;
            ingested.push(summary);
        }
        let client = pipeline.connect_geocoder(geocode, run_id).await?;
        let enrichment = pipeline.enrich(&client).await?;
        write_report(&config.workspace_root, run_id, "enrich", &enrichment).await?;
        Ok::<_, anyhow::Error>((ingested, enrichment))
    }
    .await;
    pipeline.close().await;

    let (ingested, enrichment) = result?;
    let summary = RunAllSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        ingested,
        enrichment,
        reports_dir: config.reports_dir(run_id),
    };
    write_report(&config.workspace_root, run_id, "run", &summary).await?;
    info!(%run_id, "pipeline run finished");
    Ok(summary)
}

pub async fn run_migrate_from_env() -> Result<MigrateSummary> {
    run_migrate(&PipelineConfig::from_env()).await
}

pub async fn run_ingest_from_env(dataset: DatasetKind) -> Result<IngestSummary> {
    run_ingest(&PipelineConfig::from_env(), dataset).await
}

pub async fn run_enrich_from_env() -> Result<EnrichOutcome> {
    let geocode = GeocodeConfig::from_env().context("loading geocoding credentials")?;
    run_enrich(&PipelineConfig::from_env(), geocode).await
}

pub async fn run_all_once_from_env() -> Result<RunAllSummary> {
    let geocode = GeocodeConfig::from_env().context("loading geocoding credentials")?;
    run_all_once(&PipelineConfig::from_env(), geocode).await
}

/// Build the twice-daily scheduler, or `None` when scheduling is disabled.
///
/// A trigger that fires while the previous run is still going is skipped.
pub async fn maybe_build_scheduler(
    config: &PipelineConfig,
    geocode: GeocodeConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let in_flight = Arc::new(Mutex::new(()));
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let config = config.clone();
        let geocode = geocode.clone();
        let in_flight = in_flight.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let config = config.clone();
            let geocode = geocode.clone();
            let in_flight = in_flight.clone();
            Box::pin(async move {
                let Ok(_running) = in_flight.try_lock() else {
                    warn!("previous pipeline run still in progress; skipping trigger");
                    return;
                };
                match run_all_once(&config, geocode).await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled run finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

/// Run the scheduler until Ctrl-C.
pub async fn run_scheduler_from_env() -> Result<()> {
    let config = PipelineConfig::from_env();
    let geocode = GeocodeConfig::from_env().context("loading geocoding credentials")?;
    let Some(mut sched) = maybe_build_scheduler(&config, geocode).await? else {
        anyhow::bail!("scheduler is disabled; set HDB_SCHEDULER_ENABLED=1 to enable it");
    };

    sched.start().await.context("starting scheduler")?;
    info!(cron_1 = %config.sync_cron_1, cron_2 = %config.sync_cron_2, "scheduler started");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
