use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use hdb_core::{DatasetKind, Table, Value};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::transport::Transport;
use crate::{AdapterError, DatasetSnapshot, SnapshotSource};

pub const DEFAULT_DATASET_API: &str = "https://api-open.data.gov.sg/v1/public/api";

#[derive(Debug, Deserialize)]
struct InitiateDownloadResponse {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default, rename = "errorMsg")]
    error_msg: Option<String>,
    #[serde(default)]
    data: Option<InitiateDownloadData>,
}

#[derive(Debug, Deserialize)]
struct InitiateDownloadData {
    #[serde(default)]
    url: Option<String>,
}

/// Two-step dataset download: ask the catalog for a short-lived URL, then fetch the CSV.
#[derive(Debug, Clone)]
pub struct DatasetFetcher {
    http: Arc<Transport>,
    api_base: String,
}

impl DatasetFetcher {
    pub fn new(http: Arc<Transport>, api_base: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into(),
        }
    }

    pub fn initiate_download_url(&self, dataset: DatasetKind) -> String {
        format!(
            "{}/datasets/{}/initiate-download",
            self.api_base.trim_end_matches('/'),
            dataset.dataset_id()
        )
    }
}

#[async_trait]
impl SnapshotSource for DatasetFetcher {
    async fn fetch_snapshot(
        &self,
        run_id: Uuid,
        dataset: DatasetKind,
    ) -> Result<DatasetSnapshot, AdapterError> {
        let initiate_url = self.initiate_download_url(dataset);
        let initiated = self.http.get(run_id, &initiate_url).await?;
        let download_url = parse_download_url(&initiated.body)?;

        let fetched_at = Utc::now();
        let download = self.http.get(run_id, &download_url).await?;
        let table = parse_csv_table(&download.body)?;
        info!(
            %dataset,
            rows = table.len(),
            bytes = download.body.len(),
            "downloaded dataset snapshot"
        );

        Ok(DatasetSnapshot {
            dataset,
            source_url: download.final_url,
            fetched_at,
            bytes: download.body.len(),
            table,
        })
    }
}

/// Extract `data.url` from an initiate-download payload.
pub fn parse_download_url(body: &[u8]) -> Result<String, AdapterError> {
    let response: InitiateDownloadResponse = serde_json::from_slice(body)?;
    match response.data.and_then(|d| d.url).filter(|u| !u.trim().is_empty()) {
        Some(url) => Ok(url),
        None => Err(AdapterError::Message(format!(
            "initiate-download returned no url (code {}, error {:?})",
            response
                .code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string()),
            response.error_msg.unwrap_or_default()
        ))),
    }
}

/// Parse a dataset CSV. Headers are trimmed and upper-cased, cells typed with [`Value::infer`].
pub fn parse_csv_table(bytes: &[u8]) -> Result<Table, AdapterError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let columns = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_ascii_uppercase())
        .collect();
    let mut table = Table::new(columns);
    for record in reader.records() {
        let record = record?;
        table.push_row(record.iter().map(Value::infer).collect())?;
    }
    Ok(table)
}
