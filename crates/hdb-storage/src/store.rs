//! Chunked read/write access to the SQLite store.
//!
//! The store knows nothing about the pipeline's domain: it reads queries into
//! [`Table`]s and writes [`Table`]s either replacing or appending to a named
//! table. Writes are split into chunks, each committed on its own, so a failure
//! part way through leaves the committed chunks in place and reports how many
//! rows made it.

use std::str::FromStr;
use std::time::Duration;

use hdb_core::{Table, Value, SCHEMA_METADATA_TABLE};
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, QueryBuilder, Row, Sqlite, TypeInfo, ValueRef};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Upper bound on bound parameters per statement in SQLite >= 3.32.
pub const SQLITE_MAX_PARAMETERS: usize = 32_766;

const SCHEMA_METADATA_YAML: &str = include_str!("../schema/columns.yaml");

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub chunk_size: usize,
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn in_memory() -> Self {
        Self::new("sqlite::memory:")
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("opening store {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("query failed: {sql}: {source}")]
    Query {
        sql: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("write to {table} stopped after {committed_rows} of {total_rows} rows: {source}")]
    PartialWrite {
        table: String,
        committed_rows: usize,
        total_rows: usize,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("schema metadata document is invalid: {0}")]
    Metadata(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteReport {
    pub rows: usize,
    pub chunks: usize,
}

/// Rows per chunk for a table of `columns` columns, respecting the parameter ceiling.
pub fn chunk_len(chunk_size: usize, columns: usize) -> usize {
    let ceiling = SQLITE_MAX_PARAMETERS / columns.max(1);
    chunk_size.min(ceiling).max(1)
}

/// Validate and double-quote a table or column name.
pub fn quote_identifier(name: &str) -> Result<String, StoreError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(format!("\"{name}\""))
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Handle on the store's single connection. Acquire with [`Store::open`],
/// release with [`Store::close`].
#[derive(Debug)]
pub struct Store {
    pool: SqlitePool,
    chunk_size: usize,
}

impl Store {
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let connect_err = |source| StoreError::Connect {
            url: config.database_url.clone(),
            source,
        };
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(connect_err)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        // One connection for the lifetime of the handle; an in-memory database
        // only lives as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(connect_err)?;

        info!(url = %config.database_url, chunk_size = config.chunk_size, "opened store");
        Ok(Self {
            pool,
            chunk_size: config.chunk_size.max(1),
        })
    }

    pub async fn close(self) {
        self.pool.close().await;
        debug!("closed store");
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Create the pipeline tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Execute a single statement, returning the number of affected rows.
    pub async fn execute(&self, sql: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map_err(|source| query_error(sql, source))?;
        Ok(result.rows_affected())
    }

    /// Run a read query. Column names come back upper-cased.
    pub async fn read(&self, sql: &str) -> Result<Table, StoreError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|source| query_error(sql, source))?;

        let columns = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|c| c.name().to_ascii_uppercase())
                    .collect()
            })
            .unwrap_or_default();
        let mut table = Table::new(columns);
        for row in &rows {
            table.rows.push(decode_row(row).map_err(|source| query_error(sql, source))?);
        }
        Ok(table)
    }

    /// Declared column names of `table`, upper-cased, in declaration order.
    pub async fn columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let sql = format!("PRAGMA table_info({})", quote_identifier(table)?);
        let info = self.read(&sql).await?;
        let Some(name_idx) = info.column_index("NAME") else {
            return Ok(Vec::new());
        };
        Ok(info
            .rows
            .iter()
            .filter_map(|row| row[name_idx].as_text())
            .map(|name| name.to_ascii_uppercase())
            .collect())
    }

    pub async fn count(&self, table: &str) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(table)?);
        sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|source| query_error(&sql, source))
    }

    /// Delete every row of `table`, then insert `rows` in chunks.
    ///
    /// The delete commits on its own: a failure during the inserts leaves the
    /// table holding only the chunks committed so far.
    pub async fn write_replace(&self, table: &str, rows: &Table) -> Result<WriteReport, StoreError> {
        let sql = format!("DELETE FROM {}", quote_identifier(table)?);
        let deleted = self.execute(&sql).await?;
        debug!(table, deleted, "cleared table before replace");
        self.insert_chunked(table, rows).await
    }

    /// Insert `rows` in chunks without touching existing data.
    pub async fn write_append(&self, table: &str, rows: &Table) -> Result<WriteReport, StoreError> {
        self.insert_chunked(table, rows).await
    }

    async fn insert_chunked(&self, table: &str, rows: &Table) -> Result<WriteReport, StoreError> {
        let quoted_table = quote_identifier(table)?;
        if rows.is_empty() {
            return Ok(WriteReport::default());
        }
        let quoted_columns = rows
            .columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");
        let per_chunk = chunk_len(self.chunk_size, rows.columns.len());

        let mut report = WriteReport::default();
        for chunk in rows.rows.chunks(per_chunk) {
            self.insert_chunk(&quoted_table, &quoted_columns, chunk)
                .await
                .map_err(|source| StoreError::PartialWrite {
                    table: table.to_string(),
                    committed_rows: report.rows,
                    total_rows: rows.len(),
                    source,
                })?;
            report.rows += chunk.len();
            report.chunks += 1;
        }

        info!(table, rows = report.rows, chunks = report.chunks, "wrote rows");
        Ok(report)
    }

    async fn insert_chunk(
        &self,
        quoted_table: &str,
        quoted_columns: &str,
        chunk: &[Vec<Value>],
    ) -> Result<(), sqlx::Error> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("INSERT INTO {quoted_table} ({quoted_columns}) "));
        builder.push_values(chunk, |mut b, row| {
            for value in row {
                match value {
                    Value::Null => {
                        b.push_bind(None::<String>);
                    }
                    Value::Integer(v) => {
                        b.push_bind(*v);
                    }
                    Value::Real(v) => {
                        b.push_bind(*v);
                    }
                    Value::Text(v) => {
                        b.push_bind(v.clone());
                    }
                }
            }
        });

        let mut tx = self.pool.begin().await?;
        builder.build().execute(&mut *tx).await?;
        tx.commit().await
    }

    /// Replace `SCHEMA_METADATA` with the column descriptions shipped with this crate.
    pub async fn publish_schema_metadata(&self) -> Result<WriteReport, StoreError> {
        let table = schema_metadata_table()?;
        self.write_replace(SCHEMA_METADATA_TABLE, &table).await
    }
}

#[derive(Debug, Deserialize)]
struct SchemaMetadataFile {
    tables: Vec<TableDescription>,
}

#[derive(Debug, Deserialize)]
struct TableDescription {
    name: String,
    columns: Vec<ColumnDescription>,
}

#[derive(Debug, Deserialize)]
struct ColumnDescription {
    name: String,
    description: String,
}

fn schema_metadata_table() -> Result<Table, StoreError> {
    let file: SchemaMetadataFile = serde_yaml::from_str(SCHEMA_METADATA_YAML)?;
    let mut table = Table::new(vec![
        "TABLE_NAME".to_string(),
        "COLUMN_NAME".to_string(),
        "DESCRIPTION".to_string(),
    ]);
    for described in file.tables {
        for column in described.columns {
            table.rows.push(vec![
                Value::Text(described.name.clone()),
                Value::Text(column.name),
                Value::Text(column.description),
            ]);
        }
    }
    Ok(table)
}

fn query_error(sql: &str, source: sqlx::Error) -> StoreError {
    StoreError::Query {
        sql: sql.to_string(),
        source,
    }
}

fn decode_row(row: &SqliteRow) -> Result<Vec<Value>, sqlx::Error> {
    (0..row.len()).map(|idx| decode_cell(row, idx)).collect()
}

// Cells are decoded by their runtime storage class, not the declared column type.
fn decode_cell(row: &SqliteRow, idx: usize) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage_class = raw.type_info().name().to_string();
    match storage_class.as_str() {
        "INTEGER" => row.try_get::<i64, _>(idx).map(Value::Integer),
        "REAL" => row.try_get::<f64, _>(idx).map(Value::Real),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(idx)
            .map(|bytes| Value::Text(String::from_utf8_lossy(&bytes).into_owned())),
        _ => row.try_get::<String, _>(idx).map(Value::Text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdb_core::{ADDRESS_DETAILS_TABLE, RESALE_TABLE};

    async fn scratch_store(chunk_size: usize) -> Store {
        let store = Store::open(&StoreConfig::in_memory().with_chunk_size(chunk_size))
            .await
            .expect("open store");
        store
            .execute("CREATE TABLE items (id INTEGER NOT NULL, label TEXT, score REAL)")
            .await
            .expect("create table");
        store
    }

    fn items(range: std::ops::Range<i64>) -> Table {
        let mut table = Table::new(vec!["id".into(), "label".into(), "score".into()]);
        for i in range {
            table
                .push_row(vec![
                    Value::Integer(i),
                    Value::Text(format!("item-{i}")),
                    Value::Real(i as f64 / 2.0),
                ])
                .expect("row");
        }
        table
    }

    #[test]
    fn chunk_len_respects_parameter_ceiling() {
        assert_eq!(chunk_len(1000, 11), 1000);
        assert_eq!(chunk_len(1000, 100), 327);
        assert_eq!(chunk_len(0, 3), 1);
        assert_eq!(chunk_len(1000, 0), 1000);
    }

    #[test]
    fn identifiers_are_validated_before_quoting() {
        assert_eq!(quote_identifier("HDB_RESALE_PRICE").unwrap(), "\"HDB_RESALE_PRICE\"");
        assert_eq!(quote_identifier("_x1").unwrap(), "\"_x1\"");
        for bad in ["", "1abc", "a b", "t\"; DROP TABLE x; --", "a-b"] {
            assert!(matches!(quote_identifier(bad), Err(StoreError::InvalidIdentifier(_))));
        }
    }

    #[tokio::test]
    async fn append_across_chunk_boundaries_persists_every_row() {
        let store = scratch_store(1000).await;
        let report = store.write_append("items", &items(0..2500)).await.expect("append");

        assert_eq!(report, WriteReport { rows: 2500, chunks: 3 });
        assert_eq!(store.count("items").await.expect("count"), 2500);
    }

    #[tokio::test]
    async fn replace_leaves_exactly_the_new_rows() {
        let store = scratch_store(1000).await;
        store.write_append("items", &items(0..10)).await.expect("seed");

        let report = store
            .write_replace("items", &items(100..105))
            .await
            .expect("replace");

        assert_eq!(report.rows, 5);
        let read = store.read("SELECT id FROM items ORDER BY id").await.expect("read");
        let ids: Vec<Value> = read.rows.into_iter().map(|mut r| r.remove(0)).collect();
        assert_eq!(ids, (100..105).map(Value::Integer).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn append_keeps_existing_rows() {
        let store = scratch_store(4).await;
        store.write_append("items", &items(0..3)).await.expect("first");
        store.write_append("items", &items(3..10)).await.expect("second");
        assert_eq!(store.count("items").await.expect("count"), 10);
    }

    #[tokio::test]
    async fn read_normalizes_column_case_and_decodes_storage_classes() {
        let store = scratch_store(1000).await;
        let mut table = items(0..1);
        table.push_row(vec![Value::Integer(1), Value::Null, Value::Real(0.25)]).expect("row");
        store.write_append("items", &table).await.expect("append");

        let read = store
            .read("SELECT id, label AS Label, score FROM items ORDER BY id")
            .await
            .expect("read");
        assert_eq!(read.columns, vec!["ID", "LABEL", "SCORE"]);
        assert_eq!(
            read.rows,
            vec![
                vec![Value::Integer(0), Value::Text("item-0".into()), Value::Real(0.0)],
                vec![Value::Integer(1), Value::Null, Value::Real(0.25)],
            ]
        );
    }

    #[tokio::test]
    async fn empty_read_has_no_rows() {
        let store = scratch_store(1000).await;
        let read = store.read("SELECT * FROM items").await.expect("read");
        assert!(read.is_empty());
    }

    #[tokio::test]
    async fn failing_chunk_reports_committed_rows() {
        let store = scratch_store(1000).await;
        let mut table = items(0..2500);
        table.rows[1500][0] = Value::Null;

        let err = store
            .write_append("items", &table)
            .await
            .expect_err("NOT NULL violation in second chunk");
        match err {
            StoreError::PartialWrite {
                committed_rows,
                total_rows,
                ..
            } => {
                assert_eq!(committed_rows, 1000);
                assert_eq!(total_rows, 2500);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.count("items").await.expect("count"), 1000);
    }

    #[tokio::test]
    async fn invalid_table_names_never_reach_sql() {
        let store = scratch_store(1000).await;
        let err = store
            .write_append("items; DROP TABLE items", &items(0..1))
            .await
            .expect_err("rejected");
        assert!(matches!(err, StoreError::InvalidIdentifier(_)));
        assert_eq!(store.count("items").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn migrations_create_pipeline_tables() {
        let store = Store::open(&StoreConfig::in_memory()).await.expect("open");
        store.migrate().await.expect("migrate");
        store.migrate().await.expect("migrate is idempotent");

        let columns = store.columns(RESALE_TABLE).await.expect("columns");
        assert!(columns.contains(&"TOWN".to_string()));
        assert!(columns.contains(&"STREET_NAME".to_string()));
        assert_eq!(
            store.columns(ADDRESS_DETAILS_TABLE).await.expect("columns"),
            hdb_core::AddressDetailRecord::COLUMNS
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn address_details_reject_a_second_row_for_the_same_key() {
        let store = Store::open(&StoreConfig::in_memory()).await.expect("open");
        store.migrate().await.expect("migrate");
        let mut detail = Table::new(vec!["TOWN".into(), "STREET_NAME".into(), "POSTAL_CODE".into()]);
        detail
            .push_row(vec![
                Value::Text("BEDOK".into()),
                Value::Text("NEW STREET".into()),
                Value::Text("460001".into()),
            ])
            .expect("row");

        store
            .write_append(ADDRESS_DETAILS_TABLE, &detail)
            .await
            .expect("first append");
        let err = store
            .write_append(ADDRESS_DETAILS_TABLE, &detail)
            .await
            .expect_err("duplicate key");

        assert!(matches!(err, StoreError::PartialWrite { committed_rows: 0, total_rows: 1, .. }));
        assert_eq!(store.count(ADDRESS_DETAILS_TABLE).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn schema_metadata_is_replaced_not_accumulated() {
        let store = Store::open(&StoreConfig::in_memory()).await.expect("open");
        store.migrate().await.expect("migrate");

        let first = store.publish_schema_metadata().await.expect("publish");
        let second = store.publish_schema_metadata().await.expect("republish");

        assert!(first.rows > 0);
        assert_eq!(first.rows, second.rows);
        assert_eq!(
            store.count(SCHEMA_METADATA_TABLE).await.expect("count"),
            second.rows as i64
        );
    }
}
