//! Core domain model and tabular payload types for the HDB pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hdb-core";

pub const RESALE_TABLE: &str = "HDB_RESALE_PRICE";
pub const RENTAL_TABLE: &str = "HDB_RENTAL_PRICE";
pub const ADDRESS_DETAILS_TABLE: &str = "HDB_ADDRESS_DETAILS";
pub const SCHEMA_METADATA_TABLE: &str = "SCHEMA_METADATA";

pub const TOWN_COLUMN: &str = "TOWN";
pub const STREET_NAME_COLUMN: &str = "STREET_NAME";
pub const UPDATE_DT_COLUMN: &str = "UPDATE_DT";

/// Timestamp layout used for every `UPDATE_DT` cell.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Public transaction datasets the pipeline ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Resale,
    Rental,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 2] = [DatasetKind::Resale, DatasetKind::Rental];

    pub fn dataset_id(self) -> &'static str {
        match self {
            DatasetKind::Resale => "d_8b84c4ee58e3cfc0ece0d773c8ca6abc",
            DatasetKind::Rental => "d_c9f57187485a850908655db0e8cfe651",
        }
    }

    pub fn table_name(self) -> &'static str {
        match self {
            DatasetKind::Resale => RESALE_TABLE,
            DatasetKind::Rental => RENTAL_TABLE,
        }
    }

    pub fn source_id(self) -> &'static str {
        match self {
            DatasetKind::Resale => "resale",
            DatasetKind::Rental => "rental",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source_id())
    }
}

/// Composite (town, street) key. Compared and hashed on both fields jointly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressKey {
    pub town: String,
    pub street_name: String,
}

impl AddressKey {
    pub fn new(town: impl Into<String>, street_name: impl Into<String>) -> Self {
        Self {
            town: town.into(),
            street_name: street_name.into(),
        }
    }
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.town, self.street_name)
    }
}

/// First match returned by the geocoding service for a free-text query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodedAddress {
    pub block_number: String,
    pub road_name: String,
    pub building_name: String,
    pub formatted_address: String,
    pub postal_code: String,
    pub projected_x: f64,
    pub projected_y: f64,
    pub latitude: f64,
    pub longitude: f64,
}

/// Persisted enrichment of one [`AddressKey`]. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressDetailRecord {
    pub key: AddressKey,
    pub block_number: String,
    pub road_name: String,
    pub building_name: String,
    pub formatted_address: String,
    pub postal_code: String,
    pub projected_x: f64,
    pub projected_y: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub enriched_at: DateTime<Utc>,
}

impl AddressDetailRecord {
    pub const COLUMNS: [&'static str; 12] = [
        TOWN_COLUMN,
        STREET_NAME_COLUMN,
        "BLOCK_NUMBER",
        "ROAD_NAME",
        "BUILDING_NAME",
        "FORMATTED_ADDRESS",
        "POSTAL_CODE",
        "PROJECTED_X",
        "PROJECTED_Y",
        "LATITUDE",
        "LONGITUDE",
        UPDATE_DT_COLUMN,
    ];

    pub fn from_match(key: AddressKey, found: GeocodedAddress, enriched_at: DateTime<Utc>) -> Self {
        Self {
            key,
            block_number: found.block_number,
            road_name: found.road_name,
            building_name: found.building_name,
            formatted_address: found.formatted_address,
            postal_code: found.postal_code,
            projected_x: found.projected_x,
            projected_y: found.projected_y,
            latitude: found.latitude,
            longitude: found.longitude,
            enriched_at,
        }
    }

    pub fn to_row(&self) -> Vec<Value> {
        vec![
            Value::Text(self.key.town.clone()),
            Value::Text(self.key.street_name.clone()),
            Value::Text(self.block_number.clone()),
            Value::Text(self.road_name.clone()),
            Value::Text(self.building_name.clone()),
            Value::Text(self.formatted_address.clone()),
            Value::Text(self.postal_code.clone()),
            Value::Real(self.projected_x),
            Value::Real(self.projected_y),
            Value::Real(self.latitude),
            Value::Real(self.longitude),
            Value::Text(format_timestamp(self.enriched_at)),
        ]
    }

    pub fn to_table(records: &[AddressDetailRecord]) -> Table {
        Table {
            columns: Self::COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows: records.iter().map(Self::to_row).collect(),
        }
    }
}

/// A single cell of a [`Table`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Value {
    /// Type a raw CSV cell. Values with a significant leading zero stay text.
    pub fn infer(raw: &str) -> Value {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        let leading_zero = trimmed.len() > 1 && trimmed.starts_with('0') && !trimmed.starts_with("0.");
        if !leading_zero {
            if let Ok(v) = trimmed.parse::<i64>() {
                return Value::Integer(v);
            }
            if let Ok(v) = trimmed.parse::<f64>() {
                if v.is_finite() {
                    return Value::Real(v);
                }
            }
        }
        Value::Text(trimmed.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Text rendering of a non-null cell.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Integer(v) => Some(v.to_string()),
            Value::Real(v) => Some(v.to_string()),
            Value::Text(v) => Some(v.clone()),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TableError {
    #[error("row has {got} cells but table has {expected} columns")]
    Arity { expected: usize, got: usize },
    #[error("column {0} already exists")]
    DuplicateColumn(String),
}

/// Column-named rows exchanged with the persistence layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), TableError> {
        if row.len() != self.columns.len() {
            return Err(TableError::Arity {
                expected: self.columns.len(),
                got: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Case-insensitive column lookup.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Append a column holding the same value on every row.
    pub fn with_constant_column(mut self, name: &str, value: Value) -> Result<Self, TableError> {
        if self.has_column(name) {
            return Err(TableError::DuplicateColumn(name.to_string()));
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(value.clone());
        }
        Ok(self)
    }

    /// Keep only the listed columns (case-insensitive), in the listed order.
    /// Columns this table does not carry are skipped.
    pub fn project(&self, keep: &[String]) -> Table {
        let picks: Vec<(usize, &String)> = keep
            .iter()
            .filter_map(|name| self.column_index(name).map(|idx| (idx, name)))
            .collect();
        Table {
            columns: picks.iter().map(|(_, name)| (*name).clone()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| picks.iter().map(|(idx, _)| row[*idx].clone()).collect())
                .collect(),
        }
    }
}
