//! SQLite persistence for the HDB pipeline.

mod store;

pub use store::{
    chunk_len, quote_identifier, Store, StoreConfig, StoreError, WriteReport, DEFAULT_CHUNK_SIZE,
    SQLITE_MAX_PARAMETERS,
};

pub const CRATE_NAME: &str = "hdb-storage";
