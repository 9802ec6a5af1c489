//! Handler catalogues.
//!
//! One JSON map per user (`config/handlers/<user_id>.json`), keyed by
//! request type, with `default.json` as the shared fallback.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigResult;
use crate::loader;

/// The file stem of the shared fallback catalogue.
pub const DEFAULT_CATALOGUE: &str = "default";

fn default_true() -> bool {
    true
}

/// Fallback TTL applied when neither the request, the catalogue entry,
/// nor the handler declares one.
pub const DEFAULT_TTL_MINUTES: u64 = 30;

/// One handler entry within a catalogue file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Request type the entry answers; normally equals its map key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_type: Option<String>,
    /// Opaque identifier of the code unit implementing the handler.
    pub handler_class: String,
    /// Handler construction parameters.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    /// Execution deadline; overridable per request, falling back to the
    /// handler's declared default, then [`DEFAULT_TTL_MINUTES`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_minutes: Option<u64>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Disabled entries do not resolve.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Route through the foreign-worker adapter instead of the native catalog.
    #[serde(default)]
    pub is_python: bool,
}

type Catalogues = HashMap<String, HashMap<String, HandlerConfig>>;

/// Registry over `config/handlers/`.
#[derive(Debug)]
pub struct HandlerRegistry {
    dir: PathBuf,
    catalogues: RwLock<Arc<Catalogues>>,
}

impl HandlerRegistry {
    /// Load the handler directory.
    pub fn open(dir: impl Into<PathBuf>) -> ConfigResult<Self> {
        let dir = dir.into();
        let catalogues = loader::load_json_dir(&dir)?;
        debug!(dir = %dir.display(), users = catalogues.len(), "handler catalogues loaded");
        Ok(Self {
            dir,
            catalogues: RwLock::new(Arc::new(catalogues)),
        })
    }

    /// Resolve the handler configuration for a request type and user.
    ///
    /// The per-user catalogue wins over `default.json`; disabled entries do
    /// not resolve.
    #[must_use]
    pub fn resolve(&self, request_type: &str, user_id: Option<&str>) -> Option<HandlerConfig> {
        let catalogues = self.snapshot();
        let from_user = user_id
            .and_then(|user| catalogues.get(user))
            .and_then(|catalogue| catalogue.get(request_type));
        let entry = from_user.or_else(|| {
            catalogues
                .get(DEFAULT_CATALOGUE)
                .and_then(|catalogue| catalogue.get(request_type))
        })?;
        if entry.enabled { Some(entry.clone()) } else { None }
    }

    /// Snapshot of every catalogue.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Catalogues> {
        Arc::clone(
            &self
                .catalogues
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    /// Rebuild every catalogue from disk and install atomically.
    pub fn reload(&self) -> ConfigResult<usize> {
        let fresh: Catalogues = loader::load_json_dir(&self.dir)?;
        let count = fresh.len();
        let mut guard = self
            .catalogues
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Arc::new(fresh);
        Ok(count)
    }

    /// The watched directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_catalogue(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(format!("{name}.json")), body).unwrap();
    }

    #[test]
    fn user_catalogue_wins_over_default() {
        let tmp = tempfile::tempdir().unwrap();
        write_catalogue(
            tmp.path(),
            "default",
            r#"{"ECHO": {"handler_class": "echo", "ttl_minutes": 30}}"#,
        );
        write_catalogue(
            tmp.path(),
            "alice",
            r#"{"ECHO": {"handler_class": "echo-v2", "ttl_minutes": 5}}"#,
        );

        let registry = HandlerRegistry::open(tmp.path()).unwrap();

        let from_alice = registry.resolve("ECHO", Some("alice")).unwrap();
        assert_eq!(from_alice.handler_class, "echo-v2");
        assert_eq!(from_alice.ttl_minutes, Some(5));

        let from_bob = registry.resolve("ECHO", Some("bob")).unwrap();
        assert_eq!(from_bob.handler_class, "echo");

        let anonymous = registry.resolve("ECHO", None).unwrap();
        assert_eq!(anonymous.handler_class, "echo");
    }

    #[test]
    fn disabled_entries_do_not_resolve() {
        let tmp = tempfile::tempdir().unwrap();
        write_catalogue(
            tmp.path(),
            "default",
            r#"{"ECHO": {"handler_class": "echo", "enabled": false}}"#,
        );
        let registry = HandlerRegistry::open(tmp.path()).unwrap();
        assert!(registry.resolve("ECHO", None).is_none());
    }

    #[test]
    fn reload_picks_up_new_entries() {
        let tmp = tempfile::tempdir().unwrap();
        write_catalogue(tmp.path(), "default", "{}");
        let registry = HandlerRegistry::open(tmp.path()).unwrap();
        assert!(registry.resolve("ECHO", None).is_none());

        write_catalogue(
            tmp.path(),
            "default",
            r#"{"ECHO": {"handler_class": "echo"}}"#,
        );
        registry.reload().unwrap();
        assert!(registry.resolve("ECHO", None).is_some());
    }
}
