//! Configuration and data directories for mailsync
//!
//! Config files live in `~/.config/mailsync/`, the database and spool in
//! `~/.local/share/mailsync/` (platform equivalents via `dirs`). Both can be
//! redirected with `MAILSYNC_CONFIG_DIR` / `MAILSYNC_DATA_DIR`.
//!
//! Call [`init`] at startup to create the directories.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "mailsync";

/// Create the config and data directories if missing
pub fn init() -> Result<PathBuf> {
    ensure_data_dir()?;
    ensure_config_dir()
}

/// The config directory, honoring `MAILSYNC_CONFIG_DIR`
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("MAILSYNC_CONFIG_DIR") {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|p| p.join(APP_DIR))
}

/// The data directory, honoring `MAILSYNC_DATA_DIR`
pub fn data_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("MAILSYNC_DATA_DIR") {
        return Some(PathBuf::from(dir));
    }
    dirs::data_dir().map(|p| p.join(APP_DIR))
}

/// Path of a file within the config directory
pub fn config_path(filename: &str) -> Option<PathBuf> {
    config_dir().map(|p| p.join(filename))
}

/// Path of a file within the data directory
pub fn data_path(filename: &str) -> Option<PathBuf> {
    data_dir().map(|p| p.join(filename))
}

/// Load a JSON file from the config directory; a missing file yields `T::default()`
pub fn load_json_or_default<T: DeserializeOwned + Default>(filename: &str) -> Result<T> {
    match config_path(filename) {
        Some(path) if path.exists() => load_json_file(&path),
        _ => Ok(T::default()),
    }
}

/// Load and parse a JSON file from an arbitrary path
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Ensure the config directory exists
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir().context("Could not determine config directory")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
    Ok(dir)
}

/// Ensure the data directory exists
pub fn ensure_data_dir() -> Result<PathBuf> {
    let dir = data_dir().context("Could not determine data directory")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create data directory: {}", dir.display()))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_under_config_dir() {
        let dir = config_dir().unwrap();
        let path = config_path("mailsync.json").unwrap();
        assert_eq!(path, dir.join("mailsync.json"));
    }

    #[test]
    fn test_data_path_under_data_dir() {
        let dir = data_dir().unwrap();
        let path = data_path("mailsync.db").unwrap();
        assert!(path.starts_with(dir));
        assert!(path.ends_with("mailsync.db"));
    }

    #[test]
    fn test_load_json_file_reports_path() {
        let path = std::env::temp_dir().join("mailsync-config-test-missing.json");
        let err = load_json_file::<serde_json::Value>(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("mailsync-config-test-missing.json"));
    }
}
