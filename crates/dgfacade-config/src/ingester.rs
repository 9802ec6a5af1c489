//! Ingester definitions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::loader::JsonDirRegistry;

fn default_true() -> bool {
    true
}

/// One ingester definition (`config/ingesters/<id>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngesterConfig {
    /// The input channel this ingester consumes from.
    pub input_channel: String,
    /// Disabled ingesters are not started.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Highest-precedence property overrides in the resolution chain.
    #[serde(default)]
    pub overrides: serde_json::Map<String, serde_json::Value>,
}

/// Registry over `config/ingesters/`.
#[derive(Debug)]
pub struct IngesterRegistry {
    inner: JsonDirRegistry<IngesterConfig>,
}

impl IngesterRegistry {
    /// Load the ingester directory.
    pub fn open(dir: impl AsRef<Path>) -> ConfigResult<Self> {
        Ok(Self {
            inner: JsonDirRegistry::open(dir.as_ref())?,
        })
    }

    /// Look up an ingester by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<IngesterConfig> {
        self.inner.get(id)
    }

    /// Snapshot of all ingesters.
    #[must_use]
    pub fn snapshot(&self) -> Arc<HashMap<String, IngesterConfig>> {
        self.inner.snapshot()
    }

    /// Rebuild from disk.
    pub fn reload(&self) -> ConfigResult<usize> {
        self.inner.reload()
    }

    /// The watched directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.inner.dir()
    }
}
