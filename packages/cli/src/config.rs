//! TOML configuration for the `mobility` binary.
//!
//! Every section and field is optional. The store path resolves with
//! precedence `--db` > `MOBILITY_DB` > `[store] path` > the built-in
//! default under the project root.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mobility_database::paths::{db_path_from_env, default_db_path};
use mobility_home::InferenceConfig;
use mobility_jobs::cells::DEFAULT_BATCH_SIZE;
use mobility_jobs::units::ResidencyParams;
use mobility_jobs::{DEFAULT_CHUNK_SIZE, JobOptions, LeaseConfig};
use mobility_models::{BucketFrequency, InferenceMethod};
use serde::{Deserialize, Serialize};

/// Config file read from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "mobility.toml";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

/// Which homes define residency and how events are bucketed in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResidencyConfig {
    pub method: InferenceMethod,
    pub neighbor_ring: u32,
    pub frequency: BucketFrequency,
    /// H3 resolution of cell units.
    pub cell_resolution: u8,
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        let params = ResidencyParams::default();
        Self {
            method: params.method,
            neighbor_ring: params.neighbor_ring,
            frequency: params.frequency,
            cell_resolution: 9,
        }
    }
}

impl ResidencyConfig {
    #[must_use]
    pub const fn params(&self) -> ResidencyParams {
        ResidencyParams {
            method: self.method,
            neighbor_ring: self.neighbor_ring,
            frequency: self.frequency,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub chunk_size: usize,
    /// Records per round in the in-place fill mode.
    pub fill_batch_size: usize,
    /// Events per batch when backfilling cells.
    pub cell_batch_size: usize,
    /// Worker id for claim leases. No worker means no leases.
    pub worker: Option<String>,
    pub lease_seconds: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            fill_batch_size: 50,
            cell_batch_size: DEFAULT_BATCH_SIZE,
            worker: None,
            lease_seconds: 600,
        }
    }
}

impl JobsConfig {
    #[must_use]
    pub fn options(&self) -> JobOptions {
        JobOptions {
            chunk_size: self.chunk_size,
            lease: self.worker.clone().map(|worker| LeaseConfig {
                worker,
                ttl: Duration::from_secs(self.lease_seconds),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MobilityConfig {
    pub store: StoreConfig,
    pub inference: InferenceConfig,
    pub residency: ResidencyConfig,
    pub jobs: JobsConfig,
}

impl MobilityConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is not valid TOML or
    /// a field has the wrong type.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Loads `path`, or [`DEFAULT_CONFIG_FILE`] if it exists, or the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit file cannot be read or any
    /// file does not parse.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !fallback.exists() {
                    log::debug!("No {DEFAULT_CONFIG_FILE}, using defaults");
                    return Ok(Self::default());
                }
                fallback
            }
        };

        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        log::info!("Loaded config from {}", path.display());
        Self::from_toml_str(&text)
    }

    /// The store path after applying overrides.
    #[must_use]
    pub fn db_path(&self, cli: Option<PathBuf>) -> PathBuf {
        self.resolve_db_path(cli, db_path_from_env())
    }

    fn resolve_db_path(&self, cli: Option<PathBuf>, env: Option<PathBuf>) -> PathBuf {
        cli.or(env)
            .or_else(|| self.store.path.clone())
            .unwrap_or_else(default_db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_all_defaults() {
        let config = MobilityConfig::from_toml_str("").unwrap();
        assert_eq!(config, MobilityConfig::default());
        assert_eq!(config.inference.min_events, 30);
        assert_eq!(config.jobs.chunk_size, 20);
        assert_eq!(config.residency.frequency, BucketFrequency::Quarterly);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = MobilityConfig::from_toml_str(
            r#"
            [inference]
            min_events = 50
            utc_offset_seconds = -10800

            [residency]
            method = "latlon"
            frequency = "monthly"

            [jobs]
            worker = "box-1"
            "#,
        )
        .unwrap();

        assert_eq!(config.inference.min_events, 50);
        assert_eq!(config.inference.utc_offset_seconds, -10_800);
        assert!((config.inference.candidate_ratio - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.residency.method, InferenceMethod::LatLon);
        assert_eq!(config.residency.frequency, BucketFrequency::Monthly);
        assert_eq!(config.residency.neighbor_ring, 1);

        let options = config.jobs.options();
        assert_eq!(options.chunk_size, 20);
        let lease = options.lease.unwrap();
        assert_eq!(lease.worker, "box-1");
        assert_eq!(lease.ttl, Duration::from_secs(600));
    }

    #[test]
    fn rejects_unknown_method() {
        assert!(matches!(
            MobilityConfig::from_toml_str("[residency]\nmethod = \"hexes\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn store_path_precedence() {
        let config = MobilityConfig::from_toml_str("[store]\npath = \"file.duckdb\"").unwrap();
        let cli = Some(PathBuf::from("cli.duckdb"));
        let env = Some(PathBuf::from("env.duckdb"));

        assert_eq!(
            config.resolve_db_path(cli.clone(), env.clone()),
            PathBuf::from("cli.duckdb")
        );
        assert_eq!(
            config.resolve_db_path(None, env),
            PathBuf::from("env.duckdb")
        );
        assert_eq!(
            config.resolve_db_path(None, None),
            PathBuf::from("file.duckdb")
        );
        assert_eq!(
            MobilityConfig::default().resolve_db_path(None, None),
            default_db_path()
        );
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        assert!(matches!(
            MobilityConfig::load(Some(Path::new("does/not/exist.toml"))),
            Err(ConfigError::Read { .. })
        ));
    }
}
