//! Directory fingerprinting and the auto-reload scheduler.

use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Invoked when a watched directory's fingerprint changes.
pub type ReloadCallback = Arc<dyn Fn() + Send + Sync>;

/// Default scan interval in seconds.
pub const DEFAULT_INTERVAL_SECONDS: u64 = 300;

/// Compute a cheap deterministic fingerprint over a directory's file
/// metadata: file count plus each entry's {name, size, last-modified}.
///
/// A missing directory fingerprints to zero, so creating it later counts
/// as a change.
#[must_use]
pub fn fingerprint_dir(dir: &Path) -> u64 {
    let Ok(listing) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut entries: Vec<(String, u64, Option<std::time::SystemTime>)> = Vec::new();
    for entry in listing.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        entries.push((
            entry.file_name().to_string_lossy().into_owned(),
            metadata.len(),
            metadata.modified().ok(),
        ));
    }
    entries.sort();

    let mut hasher = std::hash::DefaultHasher::new();
    entries.len().hash(&mut hasher);
    for (name, size, modified) in entries {
        name.hash(&mut hasher);
        size.hash(&mut hasher);
        if let Some(time) = modified
            && let Ok(elapsed) = time.duration_since(std::time::UNIX_EPOCH)
        {
            elapsed.as_nanos().hash(&mut hasher);
        }
    }
    hasher.finish()
}

struct WatchedDir {
    name: String,
    dir: PathBuf,
    fingerprint: u64,
    callback: ReloadCallback,
}

/// Periodically fingerprints registered directories and invokes reload
/// callbacks when the fingerprint changes.
pub struct AutoReloadService {
    interval: Duration,
    watched: Mutex<Vec<WatchedDir>>,
}

impl AutoReloadService {
    /// Create a service with the given scan interval.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            watched: Mutex::new(Vec::new()),
        }
    }

    /// Register a directory with its reload callback.
    ///
    /// The initial fingerprint is taken at registration, so the first scan
    /// only fires the callback if the directory changed afterwards.
    pub fn register(&self, name: impl Into<String>, dir: impl Into<PathBuf>, callback: ReloadCallback) {
        let name = name.into();
        let dir = dir.into();
        let fingerprint = fingerprint_dir(&dir);
        debug!(registry = %name, dir = %dir.display(), "auto-reload registered");
        self.watched
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(WatchedDir {
                name,
                dir,
                fingerprint,
                callback,
            });
    }

    /// Scan every registered directory once; returns the names whose
    /// callbacks fired.
    pub fn check_once(&self) -> Vec<String> {
        let mut fired = Vec::new();
        let mut watched = self
            .watched
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for entry in watched.iter_mut() {
            let current = fingerprint_dir(&entry.dir);
            if current != entry.fingerprint {
                info!(registry = %entry.name, "config change detected, reloading");
                entry.fingerprint = current;
                (entry.callback)();
                fired.push(entry.name.clone());
            }
        }
        fired
    }

    /// Invoke a registry's callback regardless of its fingerprint.
    ///
    /// Returns false when no registry with that name is registered.
    pub fn force_reload(&self, name: &str) -> bool {
        let mut watched = self
            .watched
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for entry in watched.iter_mut() {
            if entry.name == name {
                info!(registry = %name, "forced reload");
                entry.fingerprint = fingerprint_dir(&entry.dir);
                (entry.callback)();
                return true;
            }
        }
        error!(registry = %name, "forced reload of unknown registry");
        false
    }

    /// Spawn the scan loop; it runs until the token is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so registration
            // fingerprints stay authoritative.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("auto-reload scheduler stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let _ = self.check_once();
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for AutoReloadService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoReloadService")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn unchanged_directory_does_not_fire() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.json"), "{}").unwrap();

        let service = AutoReloadService::new(Duration::from_secs(300));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        service.register(
            "handlers",
            tmp.path(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(service.check_once().is_empty());
        assert!(service.check_once().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn changed_directory_fires_once() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.json"), "{}").unwrap();

        let service = AutoReloadService::new(Duration::from_secs(300));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        service.register(
            "brokers",
            tmp.path(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        std::fs::write(tmp.path().join("b.json"), "{\"type\": \"kafka\"}").unwrap();
        assert_eq!(service.check_once(), vec!["brokers".to_owned()]);
        // Stable afterwards.
        assert!(service.check_once().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn force_reload_ignores_fingerprint() {
        let tmp = tempfile::tempdir().unwrap();
        let service = AutoReloadService::new(Duration::from_secs(300));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        service.register(
            "chains",
            tmp.path(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(service.force_reload("chains"));
        assert!(!service.force_reload("unknown"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_directory_fingerprints_to_zero() {
        assert_eq!(fingerprint_dir(Path::new("/definitely/not/here")), 0);
    }
}
