#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Storage for events, home/work classifications, spatial units and job
//! results.
//!
//! The pipeline talks to the store only through the traits in [`store`];
//! [`DuckDbStore`] implements all of them on a single `DuckDB` file.
//! Spatial predicates run in Rust after a bounding-box pre-filter in SQL.

pub mod duckdb_store;
pub mod paths;
pub mod store;

pub use duckdb_store::DuckDbStore;
pub use store::{
    ActorStore, BatchReport, CellUpdate, EventFilter, EventStore, HomeFilter, ItemFailure,
    ResultRecord, ResultStore, UnitStore,
};

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `DuckDB` error.
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// I/O error (e.g. creating the data directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored payload failed to (de)serialize.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A destination name is not a plain SQL identifier or is reserved.
    #[error("Invalid destination name: {name:?}")]
    InvalidIdentifier {
        /// The rejected name.
        name: String,
    },

    /// An atomic batch was rolled back because one item failed.
    #[error("Batch rejected at {target_id}: {message}")]
    BatchRejected {
        /// The item that failed.
        target_id: String,
        /// The underlying failure.
        message: String,
    },

    /// Data conversion error.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },
}
