use chrono::{DateTime, Utc};
use hdb_adapters::{AdapterError, DatasetSnapshot, SnapshotSource};
use hdb_core::{
    format_timestamp, DatasetKind, Table, TableError, Value, STREET_NAME_COLUMN, TOWN_COLUMN,
    UPDATE_DT_COLUMN,
};
use hdb_storage::{Store, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("fetching dataset failed: {0}")]
    Fetch(#[from] AdapterError),
    #[error("{dataset} snapshot has no rows; refusing to replace the table")]
    EmptySnapshot { dataset: DatasetKind },
    #[error("{dataset} snapshot has no {column} column")]
    MissingColumn {
        dataset: DatasetKind,
        column: &'static str,
    },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub dataset: DatasetKind,
    pub table: String,
    pub rows: usize,
    pub chunks: usize,
    pub dropped_columns: Vec<String>,
    pub source_url: String,
    pub source_bytes: usize,
    pub ingested_at: DateTime<Utc>,
}

/// Downloads one dataset and replaces its table with the snapshot.
pub struct TransactionIngestor<'a> {
    store: &'a Store,
    source: &'a dyn SnapshotSource,
}

impl<'a> TransactionIngestor<'a> {
    pub fn new(store: &'a Store, source: &'a dyn SnapshotSource) -> Self {
        Self { store, source }
    }

    pub async fn run(&self, run_id: Uuid, dataset: DatasetKind) -> Result<IngestSummary, IngestError> {
        let span = info_span!("ingest", %run_id, %dataset);
        self.run_inner(run_id, dataset).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, dataset: DatasetKind) -> Result<IngestSummary, IngestError> {
        let snapshot = self.source.fetch_snapshot(run_id, dataset).await?;
        let source_url = snapshot.source_url.clone();
        let source_bytes = snapshot.bytes;

        let target = dataset.table_name();
        let declared = self.store.columns(target).await?;
        let ingested_at = Utc::now();
        let (rows, dropped_columns) = prepare_snapshot(snapshot, &declared, ingested_at)?;
        if !dropped_columns.is_empty() {
            warn!(table = target, dropped = ?dropped_columns, "dataset columns not in table were dropped");
        }

        let report = self.store.write_replace(target, &rows).await?;
        info!(table = target, rows = report.rows, chunks = report.chunks, "replaced table with snapshot");

        Ok(IngestSummary {
            run_id,
            dataset,
            table: target.to_string(),
            rows: report.rows,
            chunks: report.chunks,
            dropped_columns,
            source_url,
            source_bytes,
            ingested_at,
        })
    }
}

/// Check a snapshot against the table contract and shape it for writing.
///
/// Returns the rows projected onto `declared` with `UPDATE_DT` stamped, and the
/// snapshot columns that had no place in the table.
pub fn prepare_snapshot(
    snapshot: DatasetSnapshot,
    declared: &[String],
    ingested_at: DateTime<Utc>,
) -> Result<(Table, Vec<String>), IngestError> {
    let dataset = snapshot.dataset;
    let table = snapshot.table;
    if table.is_empty() {
        return Err(IngestError::EmptySnapshot { dataset });
    }
    for column in [TOWN_COLUMN, STREET_NAME_COLUMN] {
        if !table.has_column(column) {
            return Err(IngestError::MissingColumn { dataset, column });
        }
    }

    let dropped = table
        .columns
        .iter()
        .filter(|c| !c.eq_ignore_ascii_case(UPDATE_DT_COLUMN))
        .filter(|c| !declared.iter().any(|d| d.eq_ignore_ascii_case(c)))
        .cloned()
        .collect();
    let keep: Vec<String> = declared
        .iter()
        .filter(|d| !d.eq_ignore_ascii_case(UPDATE_DT_COLUMN))
        .cloned()
        .collect();
    let stamped = table
        .project(&keep)
        .with_constant_column(UPDATE_DT_COLUMN, Value::Text(format_timestamp(ingested_at)))?;
    Ok((stamped, dropped))
}
