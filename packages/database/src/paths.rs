#![allow(clippy::module_name_repetitions)]
//! Canonical file paths for the `DuckDB` data directory.
//!
//! All paths are relative to the project root's `data/` directory.

use std::path::{Path, PathBuf};

/// Environment variable overriding the store location.
pub const DB_PATH_ENV: &str = "MOBILITY_DB";

/// Returns the workspace root directory.
///
/// Resolved at compile time from `CARGO_MANIFEST_DIR`. Falls back to the
/// manifest directory itself if it is not nested two levels deep.
#[must_use]
pub fn project_root() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest.ancestors().nth(2).unwrap_or(manifest).to_path_buf()
}

/// Returns the `data/` directory path.
#[must_use]
pub fn data_dir() -> PathBuf {
    project_root().join("data")
}

/// Returns the default store file, `data/mobility.duckdb`.
#[must_use]
pub fn default_db_path() -> PathBuf {
    data_dir().join("mobility.duckdb")
}

/// Returns the store path from `MOBILITY_DB`, if set and non-empty.
#[must_use]
pub fn db_path_from_env() -> Option<PathBuf> {
    std::env::var(DB_PATH_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

/// Ensures a directory exists, creating it if necessary.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_lives_under_data_dir() {
        let path = default_db_path();
        assert!(path.starts_with(data_dir()));
        assert_eq!(path.file_name().unwrap(), "mobility.duckdb");
    }

    #[test]
    fn ensure_dir_creates_nested_directories() {
        let dir = std::env::temp_dir().join(format!("mobility-paths-{}", std::process::id()));
        let nested = dir.join("a").join("b");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
