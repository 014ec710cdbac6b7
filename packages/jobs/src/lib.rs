#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Checkpointed batch jobs for the mobility pipeline.
//!
//! [`engine`] holds the generic machinery: pending sets rebuilt from the
//! destination on every run, chunked computation with one atomic commit
//! per chunk, an in-place fill mode, and optional claim leases. The job
//! drivers ([`homes`], [`units`], [`cells`]) wire the inference engine and
//! residency classifier to a store through it.

pub mod cells;
pub mod engine;
pub mod homes;
pub mod pending;
pub mod progress;
pub mod units;

pub use engine::{
    ClassificationDestination, DEFAULT_CHUNK_SIZE, Destination, FillDestination, JobOptions,
    JobReport, LeaseConfig, ResultDestination, run_chunked, run_fill_missing,
};
pub use pending::{JobTarget, Pending, pending};

use mobility_database::DbError;

/// Errors that stop a job run.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Computing one target's result failed; the chunk was not committed.
    #[error("Failed to compute target {target}: {source}")]
    Compute {
        /// Id of the failing target.
        target: String,
        #[source]
        source: Box<dyn std::error::Error>,
    },

    /// Reading, claiming or committing failed.
    #[error(transparent)]
    Store(#[from] DbError),

    /// The fill mode stopped making progress.
    #[error("Fill of {destination} made no progress with {remaining} targets still missing")]
    Stalled {
        destination: String,
        remaining: u64,
    },

    /// A target's geometry or cell id could not be resolved.
    #[error(transparent)]
    Spatial(#[from] mobility_spatial::SpatialError),
}
