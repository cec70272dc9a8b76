//! User-scoped local preferences (~/.practice-hub/preferences.json).
//!
//! Read-only inputs to the sync core, except demo mode which swaps the
//! derived actions for fixed illustrative ones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::util;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default)]
    pub demo_mode: bool,
    /// Whether the immediate-actions bar is collapsed.
    #[serde(default)]
    pub actions_collapsed: bool,
    #[serde(default)]
    pub features: HashMap<String, bool>,
}

pub fn preferences_path() -> Result<PathBuf, SyncError> {
    Ok(util::state_dir()?.join("preferences.json"))
}

/// Load preferences; a missing or unreadable file yields defaults.
pub fn load_preferences(path: &Path) -> Preferences {
    match util::read_json(path) {
        Ok(Some(prefs)) => prefs,
        Ok(None) => Preferences::default(),
        Err(e) => {
            log::warn!("Preferences: ignoring {}: {}", path.display(), e);
            Preferences::default()
        }
    }
}

pub fn save_preferences(path: &Path, prefs: &Preferences) -> Result<(), SyncError> {
    util::write_json_atomic(path, prefs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("preferences.json");
        std::fs::write(&path, "[1, 2").expect("write");
        assert_eq!(load_preferences(&path), Preferences::default());
    }

    #[test]
    fn test_demo_mode_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("preferences.json");
        let prefs = Preferences {
            demo_mode: true,
            ..Default::default()
        };
        save_preferences(&path, &prefs).expect("save");
        let loaded = load_preferences(&path);
        assert!(loaded.demo_mode);
        assert!(loaded.features.is_empty());
    }
}
