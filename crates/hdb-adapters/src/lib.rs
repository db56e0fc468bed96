//! External collaborators of the pipeline: dataset downloads, address geocoding and
//! the HTTP transport they share.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hdb_core::{DatasetKind, GeocodedAddress, Table, TableError};
use thiserror::Error;
use uuid::Uuid;

mod dataset;
mod geocode;
mod transport;

pub use dataset::{parse_csv_table, parse_download_url, DatasetFetcher, DEFAULT_DATASET_API};
pub use geocode::{
    first_match, parse_token, search_url, GeocodeClient, GeocodeConfig, GeocodeError,
    DEFAULT_AUTH_URL, DEFAULT_SEARCH_URL,
};
pub use transport::{FetchError, FetchedResponse, RetryPolicy, Transport, TransportConfig};

pub const CRATE_NAME: &str = "hdb-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed dataset csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("malformed dataset api response: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// One downloaded dataset, parsed.
#[derive(Debug, Clone)]
pub struct DatasetSnapshot {
    pub dataset: DatasetKind,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    /// Size of the CSV as served.
    pub bytes: usize,
    pub table: Table,
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(
        &self,
        run_id: Uuid,
        dataset: DatasetKind,
    ) -> Result<DatasetSnapshot, AdapterError>;
}

/// Resolves a free-text address query to its first geocoding match.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<GeocodedAddress, GeocodeError>;
}
