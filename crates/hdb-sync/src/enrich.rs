//! Incremental address enrichment.
//!
//! Addresses seen in the transaction tables but missing from the address
//! details table are geocoded once each and appended. Keys are compared as
//! (town, street) pairs, deduplicated before any request is sent, and written
//! in the order they were first observed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use hdb_adapters::{AddressResolver, GeocodeError};
use hdb_core::{
    AddressDetailRecord, AddressKey, Table, ADDRESS_DETAILS_TABLE, RENTAL_TABLE, RESALE_TABLE,
    STREET_NAME_COLUMN, TOWN_COLUMN,
};
use hdb_storage::{quote_identifier, Store, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

pub const DEFAULT_FLUSH_EVERY: usize = 100;

const PROGRESS_EVERY: usize = 50;

#[derive(Debug, Clone)]
pub struct EnrichConfig {
    pub source_tables: Vec<String>,
    pub detail_table: String,
    /// Geocode requests in flight at once. Results are still consumed in order.
    pub concurrency: usize,
    /// Resolved rows buffered before each append.
    pub flush_every: usize,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            source_tables: vec![RESALE_TABLE.to_string(), RENTAL_TABLE.to_string()],
            detail_table: ADDRESS_DETAILS_TABLE.to_string(),
            concurrency: 1,
            flush_every: DEFAULT_FLUSH_EVERY,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnresolvedAddress {
    pub key: AddressKey,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichSummary {
    pub observed: usize,
    pub known: usize,
    pub missing: usize,
    pub persisted: usize,
    pub unresolved: Vec<UnresolvedAddress>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnrichOutcome {
    /// Nothing new to enrich.
    NoOp { observed: usize, known: usize },
    Enriched(EnrichSummary),
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{table} has no {column} column")]
    MissingColumn { table: String, column: &'static str },
    #[error("resolving {key} failed after {persisted} new addresses were saved: {source}")]
    Resolve {
        key: AddressKey,
        persisted: usize,
        #[source]
        source: GeocodeError,
    },
    #[error(
        "resolving {key} failed ({source}) and saving {unsaved} resolved addresses then failed too ({flush}); {persisted} were saved earlier"
    )]
    ResolveUnsaved {
        key: AddressKey,
        persisted: usize,
        unsaved: usize,
        #[source]
        source: GeocodeError,
        flush: StoreError,
    },
}

pub struct AddressEnricher<'a> {
    store: &'a Store,
    resolver: &'a dyn AddressResolver,
    config: EnrichConfig,
}

impl<'a> AddressEnricher<'a> {
    pub fn new(store: &'a Store, resolver: &'a dyn AddressResolver, config: EnrichConfig) -> Self {
        Self {
            store,
            resolver,
            config,
        }
    }

    pub async fn run(&self) -> Result<EnrichOutcome, EnrichError> {
        let known: HashSet<AddressKey> = self.known_addresses().await?.into_iter().collect();
        let observed = self.observed_addresses().await?;
        let missing = missing_addresses(&observed, &known);

        if missing.is_empty() {
            info!(observed = observed.len(), known = known.len(), "no new addresses to enrich");
            return Ok(EnrichOutcome::NoOp {
                observed: observed.len(),
                known: known.len(),
            });
        }

        info!(
            observed = observed.len(),
            known = known.len(),
            missing = missing.len(),
            concurrency = self.config.concurrency.max(1),
            "enriching new addresses"
        );

        let enriched_at = Utc::now();
        let resolver = self.resolver;
        let halted = AtomicBool::new(false);
        let halted = &halted;
        let mut results = stream::iter(missing.iter().cloned())
            .map(move |key| async move {
                if halted.load(Ordering::Acquire) {
                    return (key, None);
                }
                let result = resolver.resolve(&key.street_name).await;
                (key, Some(result))
            })
            .buffered(self.config.concurrency.max(1));

        let mut pending = Vec::new();
        let mut persisted = 0usize;
        let mut unresolved = Vec::new();
        let mut processed = 0usize;
        let mut skipped = 0usize;
        let mut failure: Option<(AddressKey, GeocodeError)> = None;

        while let Some((key, result)) = results.next().await {
            let Some(result) = result else {
                skipped += 1;
                continue;
            };
            processed += 1;
            match result {
                Ok(found) => {
                    pending.push(AddressDetailRecord::from_match(key, found, enriched_at));
                    if pending.len() >= self.config.flush_every.max(1) {
                        match self.flush(&mut pending).await {
                            Ok(rows) => persisted += rows,
                            Err(err) => return Err(flush_failed(failure, persisted, pending.len(), err)),
                        }
                    }
                }
                Err(err) if err.is_no_match() => {
                    warn!(%key, "no geocode match; leaving address unenriched");
                    unresolved.push(UnresolvedAddress {
                        key,
                        reason: err.to_string(),
                    });
                }
                Err(err) if failure.is_some() => {
                    warn!(%key, error = %err, "another geocode request failed while draining");
                }
                Err(err) => {
                    // Requests already in flight still complete and are kept.
                    halted.store(true, Ordering::Release);
                    error!(%key, error = %err, "geocoding failed; no new requests will be sent");
                    failure = Some((key, err));
                }
            }

            if processed % PROGRESS_EVERY == 0 {
                info!(processed, total = missing.len(), persisted, "enrichment progress");
            }
        }
        drop(results);

        let unsaved = pending.len();
        match self.flush(&mut pending).await {
            Ok(rows) => persisted += rows,
            Err(err) => return Err(flush_failed(failure, persisted, unsaved, err)),
        }
        if let Some((key, source)) = failure {
            warn!(persisted, skipped, "enrichment stopped early; a rerun resumes from here");
            return Err(EnrichError::Resolve {
                key,
                persisted,
                source,
            });
        }

        info!(
            persisted,
            unresolved = unresolved.len(),
            "address enrichment finished"
        );
        Ok(EnrichOutcome::Enriched(EnrichSummary {
            observed: observed.len(),
            known: known.len(),
            missing: missing.len(),
            persisted,
            unresolved,
        }))
    }

    async fn known_addresses(&self) -> Result<Vec<AddressKey>, EnrichError> {
        let table_name = &self.config.detail_table;
        let sql = format!(
            "SELECT {}, {} FROM {}",
            quote_identifier(TOWN_COLUMN)?,
            quote_identifier(STREET_NAME_COLUMN)?,
            quote_identifier(table_name)?
        );
        let table = self.store.read(&sql).await?;
        address_keys(table_name, &table)
    }

    /// Distinct keys across every source table, in first-seen order.
    async fn observed_addresses(&self) -> Result<Vec<AddressKey>, EnrichError> {
        let town = quote_identifier(TOWN_COLUMN)?;
        let street = quote_identifier(STREET_NAME_COLUMN)?;

        let mut seen = HashSet::new();
        let mut observed = Vec::new();
        for table_name in &self.config.source_tables {
            let sql = format!(
                "SELECT DISTINCT {town}, {street} FROM {} ORDER BY {town}, {street}",
                quote_identifier(table_name)?
            );
            let table = self.store.read(&sql).await?;
            for key in address_keys(table_name, &table)? {
                if seen.insert(key.clone()) {
                    observed.push(key);
                }
            }
        }
        Ok(observed)
    }

    async fn flush(&self, pending: &mut Vec<AddressDetailRecord>) -> Result<usize, StoreError> {
        if pending.is_empty() {
            return Ok(0);
        }
        let table = AddressDetailRecord::to_table(pending);
        let report = self
            .store
            .write_append(&self.config.detail_table, &table)
            .await?;
        pending.clear();
        Ok(report.rows)
    }
}

fn flush_failed(
    failure: Option<(AddressKey, GeocodeError)>,
    persisted: usize,
    unsaved: usize,
    flush: StoreError,
) -> EnrichError {
    match failure {
        Some((key, source)) => EnrichError::ResolveUnsaved {
            key,
            persisted,
            unsaved,
            source,
            flush,
        },
        None => EnrichError::Store(flush),
    }
}

/// Keys of `observed` that are not in `known`, keeping `observed` order.
pub fn missing_addresses(observed: &[AddressKey], known: &HashSet<AddressKey>) -> Vec<AddressKey> {
    observed
        .iter()
        .filter(|key| !known.contains(*key))
        .cloned()
        .collect()
}

/// Read (TOWN, STREET_NAME) pairs out of a table. Rows with a null half are skipped.
pub fn address_keys(table_name: &str, table: &Table) -> Result<Vec<AddressKey>, EnrichError> {
    if table.is_empty() {
        return Ok(Vec::new());
    }
    let town_idx = table
        .column_index(TOWN_COLUMN)
        .ok_or_else(|| EnrichError::MissingColumn {
            table: table_name.to_string(),
            column: TOWN_COLUMN,
        })?;
    let street_idx = table
        .column_index(STREET_NAME_COLUMN)
        .ok_or_else(|| EnrichError::MissingColumn {
            table: table_name.to_string(),
            column: STREET_NAME_COLUMN,
        })?;

    let mut keys = Vec::with_capacity(table.len());
    for row in &table.rows {
        match (row[town_idx].as_text(), row[street_idx].as_text()) {
            (Some(town), Some(street_name)) => keys.push(AddressKey { town, street_name }),
            _ => warn!(table = table_name, "skipping row with a null town or street name"),
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use hdb_core::{GeocodedAddress, Value};
    use hdb_adapters::FetchError;
    use hdb_storage::StoreConfig;

    #[derive(Default)]
    struct FakeResolver {
        calls: Mutex<Vec<String>>,
        no_match: Vec<&'static str>,
        transport_failure: Option<&'static str>,
        delays_ms: HashMap<&'static str, u64>,
    }

    impl FakeResolver {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AddressResolver for FakeResolver {
        async fn resolve(&self, query: &str) -> Result<GeocodedAddress, GeocodeError> {
            self.calls.lock().unwrap().push(query.to_string());
            if let Some(ms) = self.delays_ms.get(query) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            if self.no_match.contains(&query) {
                return Err(GeocodeError::NoMatch {
                    query: query.to_string(),
                });
            }
            if self.transport_failure == Some(query) {
                return Err(unavailable());
            }
            Ok(geocoded(query))
        }
    }

    /// Fails on `fail_on` after moving the details table out of the way, so the
    /// next flush cannot land.
    struct TableDroppingResolver<'a> {
        store: &'a Store,
        fail_on: &'static str,
    }

    #[async_trait]
    impl AddressResolver for TableDroppingResolver<'_> {
        async fn resolve(&self, query: &str) -> Result<GeocodedAddress, GeocodeError> {
            if query != self.fail_on {
                return Ok(geocoded(query));
            }
            self.store
                .execute("ALTER TABLE HDB_ADDRESS_DETAILS RENAME TO HDB_ADDRESS_DETAILS_MOVED")
                .await
                .expect("rename details table");
            Err(unavailable())
        }
    }

    fn unavailable() -> GeocodeError {
        GeocodeError::Transport(FetchError::HttpStatus {
            status: 503,
            url: "https://geocode.example/search".to_string(),
        })
    }

    fn geocoded(query: &str) -> GeocodedAddress {
        GeocodedAddress {
            block_number: "1".to_string(),
            road_name: query.to_string(),
            building_name: "NIL".to_string(),
            formatted_address: format!("1 {query} SINGAPORE 000001"),
            postal_code: "000001".to_string(),
            projected_x: 30000.0,
            projected_y: 32000.0,
            latitude: 1.3,
            longitude: 103.8,
        }
    }

    async fn migrated_store() -> Store {
        let store = Store::open(&StoreConfig::in_memory()).await.expect("open store");
        store.migrate().await.expect("migrate");
        store
    }

    async fn seed_transactions(store: &Store, table: &str, pairs: &[(&str, &str)]) {
        let mut rows = Table::new(vec![TOWN_COLUMN.to_string(), STREET_NAME_COLUMN.to_string()]);
        for (town, street) in pairs {
            rows.push_row(vec![Value::Text(town.to_string()), Value::Text(street.to_string())])
                .expect("row");
        }
        store.write_append(table, &rows).await.expect("seed transactions");
    }

    async fn stored_keys(store: &Store) -> Vec<AddressKey> {
        let table = store
            .read("SELECT TOWN, STREET_NAME FROM HDB_ADDRESS_DETAILS ORDER BY rowid")
            .await
            .expect("read details");
        address_keys(ADDRESS_DETAILS_TABLE, &table).expect("keys")
    }

    fn key(town: &str, street: &str) -> AddressKey {
        AddressKey::new(town, street)
    }

    #[test]
    fn set_difference_compares_tuples_not_concatenations() {
        let known: HashSet<AddressKey> = [key("A", "X")].into_iter().collect();
        let observed = vec![key("A", "X"), key("A", "Y"), key("B", "X")];
        assert_eq!(missing_addresses(&observed, &known), vec![key("A", "Y"), key("B", "X")]);

        // "A"+"XY" and "AX"+"Y" concatenate to the same string but are different addresses.
        let known: HashSet<AddressKey> = [key("A", "XY")].into_iter().collect();
        let observed = vec![key("A", "XY"), key("AX", "Y")];
        assert_eq!(missing_addresses(&observed, &known), vec![key("AX", "Y")]);
    }

    #[test]
    fn address_keys_requires_both_columns_on_non_empty_tables() {
        assert!(address_keys("T", &Table::default()).unwrap().is_empty());

        let mut table = Table::new(vec!["TOWN".to_string()]);
        table.push_row(vec![Value::Text("BEDOK".into())]).unwrap();
        assert!(matches!(
            address_keys("T", &table),
            Err(EnrichError::MissingColumn { column: "STREET_NAME", .. })
        ));

        let mut table = Table::new(vec!["town".to_string(), "street_name".to_string()]);
        table.push_row(vec![Value::Text("BEDOK".into()), Value::Null]).unwrap();
        table
            .push_row(vec![Value::Text("BEDOK".into()), Value::Text("NEW STREET".into())])
            .unwrap();
        assert_eq!(address_keys("T", &table).unwrap(), vec![key("BEDOK", "NEW STREET")]);
    }

    #[tokio::test]
    async fn new_address_is_resolved_and_appended_once() {
        let store = migrated_store().await;
        seed_transactions(&store, RESALE_TABLE, &[("BEDOK", "NEW STREET")]).await;
        let resolver = FakeResolver::default();

        let outcome = AddressEnricher::new(&store, &resolver, EnrichConfig::default())
            .run()
            .await
            .expect("enrich");

        let EnrichOutcome::Enriched(summary) = outcome else {
            panic!("expected enrichment, got {outcome:?}");
        };
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.persisted, 1);
        assert_eq!(resolver.calls(), vec!["NEW STREET".to_string()]);
        assert_eq!(stored_keys(&store).await, vec![key("BEDOK", "NEW STREET")]);

        let detail = store
            .read("SELECT POSTAL_CODE, LATITUDE, UPDATE_DT FROM HDB_ADDRESS_DETAILS")
            .await
            .expect("read");
        assert_eq!(detail.rows[0][0], Value::Text("000001".into()));
        assert_eq!(detail.rows[0][1], Value::Real(1.3));
        assert!(matches!(detail.rows[0][2], Value::Text(_)));
    }

    #[tokio::test]
    async fn second_run_without_new_transactions_is_a_noop() {
        let store = migrated_store().await;
        seed_transactions(&store, RESALE_TABLE, &[("BEDOK", "NEW STREET"), ("YISHUN", "YISHUN RING RD")])
            .await;
        let resolver = FakeResolver::default();
        let enricher = AddressEnricher::new(&store, &resolver, EnrichConfig::default());

        enricher.run().await.expect("first run");
        let second = enricher.run().await.expect("second run");

        assert!(matches!(second, EnrichOutcome::NoOp { observed: 2, known: 2 }));
        assert_eq!(resolver.calls().len(), 2);
        assert_eq!(store.count(ADDRESS_DETAILS_TABLE).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn addresses_shared_by_both_tables_are_enriched_once() {
        let store = migrated_store().await;
        seed_transactions(
            &store,
            RESALE_TABLE,
            &[("A", "XY"), ("BEDOK", "NEW STREET"), ("BEDOK", "NEW STREET")],
        )
        .await;
        seed_transactions(&store, RENTAL_TABLE, &[("BEDOK", "NEW STREET"), ("AX", "Y")]).await;
        let resolver = FakeResolver::default();

        AddressEnricher::new(&store, &resolver, EnrichConfig::default())
            .run()
            .await
            .expect("enrich");

        assert_eq!(resolver.calls().len(), 3);
        assert_eq!(
            stored_keys(&store).await,
            vec![key("A", "XY"), key("BEDOK", "NEW STREET"), key("AX", "Y")]
        );
    }

    #[tokio::test]
    async fn later_runs_only_resolve_newly_observed_addresses() {
        let store = migrated_store().await;
        seed_transactions(&store, RESALE_TABLE, &[("A", "X")]).await;
        let resolver = FakeResolver::default();
        let enricher = AddressEnricher::new(&store, &resolver, EnrichConfig::default());
        enricher.run().await.expect("first run");

        seed_transactions(&store, RENTAL_TABLE, &[("A", "X"), ("A", "Y"), ("B", "X")]).await;
        let outcome = enricher.run().await.expect("second run");

        let EnrichOutcome::Enriched(summary) = outcome else {
            panic!("expected enrichment");
        };
        assert_eq!(summary.known, 1);
        assert_eq!(summary.missing, 2);
        assert_eq!(resolver.calls(), vec!["X", "Y", "X"]);
        assert_eq!(stored_keys(&store).await, vec![key("A", "X"), key("A", "Y"), key("B", "X")]);
    }

    #[tokio::test]
    async fn no_match_is_recorded_and_enrichment_continues() {
        let store = migrated_store().await;
        seed_transactions(
            &store,
            RESALE_TABLE,
            &[("A", "FIRST ST"), ("B", "NOWHERE LANE"), ("C", "THIRD ST")],
        )
        .await;
        let resolver = FakeResolver {
            no_match: vec!["NOWHERE LANE"],
            ..Default::default()
        };

        let outcome = AddressEnricher::new(&store, &resolver, EnrichConfig::default())
            .run()
            .await
            .expect("no match does not abort");

        let EnrichOutcome::Enriched(summary) = outcome else {
            panic!("expected enrichment");
        };
        assert_eq!(summary.persisted, 2);
        assert_eq!(summary.unresolved.len(), 1);
        assert_eq!(summary.unresolved[0].key, key("B", "NOWHERE LANE"));
        assert_eq!(stored_keys(&store).await, vec![key("A", "FIRST ST"), key("C", "THIRD ST")]);
    }

    #[tokio::test]
    async fn transport_failure_keeps_already_resolved_addresses() {
        let store = migrated_store().await;
        seed_transactions(
            &store,
            RESALE_TABLE,
            &[("A", "FIRST ST"), ("B", "SECOND ST"), ("C", "THIRD ST"), ("D", "FOURTH ST")],
        )
        .await;
        let resolver = FakeResolver {
            transport_failure: Some("THIRD ST"),
            ..Default::default()
        };

        let err = AddressEnricher::new(&store, &resolver, EnrichConfig::default())
            .run()
            .await
            .expect_err("transport failure aborts");

        match err {
            EnrichError::Resolve { key: failed, persisted, source } => {
                assert_eq!(failed, key("C", "THIRD ST"));
                assert_eq!(persisted, 2);
                assert!(matches!(source, GeocodeError::Transport(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(stored_keys(&store).await, vec![key("A", "FIRST ST"), key("B", "SECOND ST")]);

        // A rerun picks up where the failed run stopped.
        let healthy = FakeResolver::default();
        AddressEnricher::new(&store, &healthy, EnrichConfig::default())
            .run()
            .await
            .expect("rerun");
        assert_eq!(healthy.calls(), vec!["THIRD ST", "FOURTH ST"]);
        assert_eq!(store.count(ADDRESS_DETAILS_TABLE).await.expect("count"), 4);
    }

    #[tokio::test]
    async fn concurrent_resolution_preserves_write_order() {
        let store = migrated_store().await;
        seed_transactions(
            &store,
            RESALE_TABLE,
            &[("A", "SLOW ST"), ("B", "FAST ST"), ("C", "MEDIUM ST"), ("D", "QUICK ST")],
        )
        .await;
        let resolver = FakeResolver {
            delays_ms: [("SLOW ST", 60), ("MEDIUM ST", 20)].into_iter().collect(),
            ..Default::default()
        };
        let config = EnrichConfig {
            concurrency: 4,
            flush_every: 2,
            ..Default::default()
        };

        AddressEnricher::new(&store, &resolver, config)
            .run()
            .await
            .expect("enrich");

        assert_eq!(
            stored_keys(&store).await,
            vec![key("A", "SLOW ST"), key("B", "FAST ST"), key("C", "MEDIUM ST"), key("D", "QUICK ST")]
        );
    }

    #[tokio::test]
    async fn in_flight_results_are_saved_when_an_earlier_key_fails() {
        let store = migrated_store().await;
        seed_transactions(
            &store,
            RESALE_TABLE,
            &[("A", "A ST"), ("B", "B ST"), ("C", "C ST"), ("D", "D ST")],
        )
        .await;
        let resolver = FakeResolver {
            transport_failure: Some("B ST"),
            delays_ms: [("B ST", 80)].into_iter().collect(),
            ..Default::default()
        };
        let config = EnrichConfig {
            concurrency: 4,
            ..Default::default()
        };

        let err = AddressEnricher::new(&store, &resolver, config)
            .run()
            .await
            .expect_err("transport failure aborts");

        match err {
            EnrichError::Resolve { key: failed, persisted, .. } => {
                assert_eq!(failed, key("B", "B ST"));
                assert_eq!(persisted, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            stored_keys(&store).await,
            vec![key("A", "A ST"), key("C", "C ST"), key("D", "D ST")]
        );
    }

    #[tokio::test]
    async fn no_new_requests_are_sent_after_a_failure() {
        let store = migrated_store().await;
        seed_transactions(
            &store,
            RESALE_TABLE,
            &[("A", "A ST"), ("B", "B ST"), ("C", "C ST"), ("D", "D ST"), ("E", "E ST")],
        )
        .await;
        let resolver = FakeResolver {
            transport_failure: Some("A ST"),
            ..Default::default()
        };
        let config = EnrichConfig {
            concurrency: 2,
            ..Default::default()
        };

        let err = AddressEnricher::new(&store, &resolver, config)
            .run()
            .await
            .expect_err("transport failure aborts");

        assert!(matches!(err, EnrichError::Resolve { .. }));
        let calls = resolver.calls();
        for street in ["C ST", "D ST", "E ST"] {
            assert!(!calls.iter().any(|c| c == street), "{street} was sent after the failure");
        }
    }

    #[tokio::test]
    async fn failed_flush_after_a_resolve_failure_reports_both() {
        let store = migrated_store().await;
        seed_transactions(&store, RESALE_TABLE, &[("A", "FIRST ST"), ("B", "SECOND ST")]).await;
        let resolver = TableDroppingResolver {
            store: &store,
            fail_on: "SECOND ST",
        };

        let err = AddressEnricher::new(&store, &resolver, EnrichConfig::default())
            .run()
            .await
            .expect_err("resolve and flush both fail");

        let message = err.to_string();
        match err {
            EnrichError::ResolveUnsaved {
                key: failed,
                persisted,
                unsaved,
                source,
                flush,
            } => {
                assert_eq!(failed, key("B", "SECOND ST"));
                assert_eq!(persisted, 0);
                assert_eq!(unsaved, 1);
                assert!(matches!(source, GeocodeError::Transport(_)));
                assert!(matches!(flush, StoreError::PartialWrite { committed_rows: 0, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(message.contains("SECOND ST"));
        assert!(message.contains("503"));
    }

    #[tokio::test]
    async fn empty_transaction_tables_are_a_noop() {
        let store = migrated_store().await;
        let resolver = FakeResolver::default();

        let outcome = AddressEnricher::new(&store, &resolver, EnrichConfig::default())
            .run()
            .await
            .expect("enrich");

        assert!(matches!(outcome, EnrichOutcome::NoOp { observed: 0, known: 0 }));
        assert!(resolver.calls().is_empty());
    }
}
