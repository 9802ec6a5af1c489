//! Shared JSON-directory loading for the registries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Read and parse a single JSON file.
pub(crate) fn read_json_file<T: DeserializeOwned>(path: &Path) -> ConfigResult<T> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Load every `*.json` file in a directory into a map keyed by file stem.
///
/// A missing directory yields an empty map; registries come and go as the
/// deployment grows.
pub(crate) fn load_json_dir<T: DeserializeOwned>(dir: &Path) -> ConfigResult<HashMap<String, T>> {
    let mut entries = HashMap::new();
    if !dir.is_dir() {
        return Ok(entries);
    }
    let listing = std::fs::read_dir(dir).map_err(|source| ConfigError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    for entry in listing {
        let entry = entry.map_err(|source| ConfigError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let value: T = read_json_file(&path)?;
        entries.insert(stem.to_owned(), value);
    }
    Ok(entries)
}

/// A directory of JSON files, one entry per file, swapped atomically on
/// reload.
#[derive(Debug)]
pub(crate) struct JsonDirRegistry<T> {
    dir: PathBuf,
    entries: RwLock<Arc<HashMap<String, T>>>,
}

impl<T: DeserializeOwned> JsonDirRegistry<T> {
    /// Load the directory.
    pub(crate) fn open(dir: impl Into<PathBuf>) -> ConfigResult<Self> {
        let dir = dir.into();
        let entries = load_json_dir(&dir)?;
        debug!(dir = %dir.display(), count = entries.len(), "registry loaded");
        Ok(Self {
            dir,
            entries: RwLock::new(Arc::new(entries)),
        })
    }

    /// Rebuild the map from disk and install it atomically.
    ///
    /// On failure the previous map stays in place.
    pub(crate) fn reload(&self) -> ConfigResult<usize> {
        let fresh = load_json_dir(&self.dir)?;
        let count = fresh.len();
        let mut guard = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Arc::new(fresh);
        Ok(count)
    }

    /// Snapshot of the current map.
    pub(crate) fn snapshot(&self) -> Arc<HashMap<String, T>> {
        Arc::clone(
            &self
                .entries
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    /// The watched directory.
    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }
}

impl<T: DeserializeOwned + Clone> JsonDirRegistry<T> {
    /// Clone out a single entry.
    pub(crate) fn get(&self, id: &str) -> Option<T> {
        self.snapshot().get(id).cloned()
    }
}
