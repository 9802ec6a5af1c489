//! User and API key stores (`config/users.json`, `config/apikeys.json`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigResult;
use crate::loader::read_json_file;

fn default_true() -> bool {
    true
}

/// One user record, keyed by user id in `users.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Disabled users cannot authenticate.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Assigned roles.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// One API key record, keyed by the key string in `apikeys.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// The user the key resolves to.
    pub user: String,
    /// Disabled keys cannot authenticate.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Default)]
struct CredentialMaps {
    users: HashMap<String, UserRecord>,
    keys: HashMap<String, ApiKeyRecord>,
}

/// Credential lookup over the user and API key files.
#[derive(Debug)]
pub struct CredentialStore {
    users_path: PathBuf,
    keys_path: PathBuf,
    maps: RwLock<Arc<CredentialMaps>>,
}

impl CredentialStore {
    /// Load both files; a missing file yields an empty map.
    pub fn open(users_path: impl Into<PathBuf>, keys_path: impl Into<PathBuf>) -> ConfigResult<Self> {
        let users_path = users_path.into();
        let keys_path = keys_path.into();
        let maps = Self::load(&users_path, &keys_path)?;
        Ok(Self {
            users_path,
            keys_path,
            maps: RwLock::new(Arc::new(maps)),
        })
    }

    fn load(users_path: &Path, keys_path: &Path) -> ConfigResult<CredentialMaps> {
        let users = if users_path.is_file() {
            read_json_file(users_path)?
        } else {
            HashMap::new()
        };
        let keys = if keys_path.is_file() {
            read_json_file(keys_path)?
        } else {
            HashMap::new()
        };
        debug!(users = users.len(), keys = keys.len(), "credentials loaded");
        Ok(CredentialMaps { users, keys })
    }

    /// Resolve an API key to its user id.
    ///
    /// Returns `None` when the key is unknown, disabled, or points at a
    /// disabled user.
    #[must_use]
    pub fn resolve_key(&self, api_key: &str) -> Option<String> {
        let maps = self.snapshot();
        let record = maps.keys.get(api_key).filter(|record| record.enabled)?;
        let user_enabled = maps
            .users
            .get(&record.user)
            .is_none_or(|user| user.enabled);
        user_enabled.then(|| record.user.clone())
    }

    /// Look up a user record.
    #[must_use]
    pub fn user(&self, user_id: &str) -> Option<UserRecord> {
        self.snapshot().users.get(user_id).cloned()
    }

    /// Rebuild both maps from disk and install atomically.
    pub fn reload(&self) -> ConfigResult<()> {
        let fresh = Self::load(&self.users_path, &self.keys_path)?;
        let mut guard = self
            .maps
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Arc::new(fresh);
        Ok(())
    }

    fn snapshot(&self) -> Arc<CredentialMaps> {
        Arc::clone(
            &self
                .maps
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(users: &str, keys: &str) -> CredentialStore {
        let tmp = tempfile::tempdir().unwrap();
        let users_path = tmp.path().join("users.json");
        let keys_path = tmp.path().join("apikeys.json");
        std::fs::write(&users_path, users).unwrap();
        std::fs::write(&keys_path, keys).unwrap();
        // Leak the tempdir so the files outlive the store under test.
        std::mem::forget(tmp);
        CredentialStore::open(users_path, keys_path).unwrap()
    }

    #[test]
    fn resolves_enabled_key() {
        let store = store_with(
            r#"{"alice": {"name": "Alice", "enabled": true}}"#,
            r#"{"dgf-k1": {"user": "alice"}}"#,
        );
        assert_eq!(store.resolve_key("dgf-k1").as_deref(), Some("alice"));
        assert!(store.resolve_key("dgf-unknown").is_none());
    }

    #[test]
    fn disabled_key_or_user_fails() {
        let store = store_with(
            r#"{"bob": {"enabled": false}}"#,
            r#"{
                "dgf-k2": {"user": "bob"},
                "dgf-k3": {"user": "carol", "enabled": false}
            }"#,
        );
        assert!(store.resolve_key("dgf-k2").is_none());
        assert!(store.resolve_key("dgf-k3").is_none());
    }

    #[test]
    fn key_without_user_record_resolves() {
        let store = store_with("{}", r#"{"dgf-k4": {"user": "dave"}}"#);
        assert_eq!(store.resolve_key("dgf-k4").as_deref(), Some("dave"));
    }
}
