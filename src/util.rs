//! Small persistence helpers shared by config, preferences and cache snapshots.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SyncError;

/// Directory holding config, preferences and snapshots (~/.practice-hub).
pub fn state_dir() -> Result<PathBuf, SyncError> {
    let home = dirs::home_dir()
        .ok_or_else(|| SyncError::Config("Could not find home directory".to_string()))?;
    Ok(home.join(".practice-hub"))
}

/// Read and decode a JSON file. Missing files are `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, SyncError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value = serde_json::from_str(&content)
        .map_err(|e| SyncError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    Ok(Some(value))
}

/// Write JSON through a temp file in the same directory, then rename over `path`.
///
/// Readers either see the previous file or the complete new one.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), SyncError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if !parent.exists() {
        fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(value)
        .map_err(|e| SyncError::Io(format!("Serialize error: {}", e)))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| SyncError::Io(e.error.to_string()))?;
    Ok(())
}
