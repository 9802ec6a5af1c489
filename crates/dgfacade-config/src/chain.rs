//! Chain definitions.
//!
//! A chain names an ordered sequence of request types. The registry loads
//! and hot-reloads chain files alongside the other catalogues; execution of
//! chains is owned by the dispatch layer's callers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::loader::JsonDirRegistry;

fn default_true() -> bool {
    true
}

/// One chain definition (`config/chains/<id>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Ordered request types the chain runs through.
    #[serde(default)]
    pub request_types: Vec<String>,
    /// Disabled chains do not resolve.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Additional chain properties.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Registry over `config/chains/`.
#[derive(Debug)]
pub struct ChainRegistry {
    inner: JsonDirRegistry<ChainConfig>,
}

impl ChainRegistry {
    /// Load the chain directory.
    pub fn open(dir: impl AsRef<Path>) -> ConfigResult<Self> {
        Ok(Self {
            inner: JsonDirRegistry::open(dir.as_ref())?,
        })
    }

    /// Look up a chain by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ChainConfig> {
        self.inner.get(id)
    }

    /// Snapshot of all chains.
    #[must_use]
    pub fn snapshot(&self) -> Arc<HashMap<String, ChainConfig>> {
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
