//! Owner of the persisted host configuration.
//!
//! A single `ConfigStore` holds the latest value behind one mutex; every
//! mutation is a transform applied under that lock followed by a save, and
//! subscribers learn about changes over a broadcast channel. The lockout
//! engine composes its updates with the same lock so auth bookkeeping and
//! config writes never interleave.

use anyhow::{Context, Result};
use p2prd_protocol::HostConfig;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

const CONFIG_FILE: &str = "config.json";

pub struct ConfigStore {
    dir: PathBuf,
    inner: Mutex<HostConfig>,
    changes: broadcast::Sender<HostConfig>,
}

impl ConfigStore {
    /// Default configuration directory: `<CommonAppData>/P2PRD` on Windows,
    /// `/var/lib/P2PRD` elsewhere.
    pub fn default_dir() -> PathBuf {
        #[cfg(windows)]
        {
            let base = std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".into());
            Path::new(&base).join("P2PRD")
        }
        #[cfg(not(windows))]
        {
            PathBuf::from("/var/lib/P2PRD")
        }
    }

    /// Open (or initialize) the store. Creates the directory, restricts it to
    /// the service account on Unix, loads the existing file, and generates the
    /// host identity on first boot. Failure here is fatal for the process.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
                .with_context(|| format!("Failed to restrict {}", dir.display()))?;
        }
        // On Windows the installer applies the SYSTEM+Administrators ACL to
        // the directory before the service first starts.

        let path = dir.join(CONFIG_FILE);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<HostConfig>(&text).unwrap_or_else(|e| {
                warn!("Config file unreadable, starting from defaults: {e}");
                HostConfig::default()
            }),
            Err(_) => HostConfig::default(),
        };

        let mut dirty = false;
        if config.host_id.is_empty() {
            config.host_id = Uuid::new_v4().to_string();
            info!(host_id = %config.host_id, "Generated host identity");
            dirty = true;
        }

        let (changes, _) = broadcast::channel(8);
        let store = Self {
            dir: dir.to_path_buf(),
            inner: Mutex::new(config),
            changes,
        };
        if dirty || !path.exists() {
            let snapshot = store.snapshot();
            store
                .save(&snapshot)
                .context("Failed to persist config at startup")?;
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot(&self) -> HostConfig {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostConfig> {
        self.changes.subscribe()
    }

    /// Apply a transform under the lock, persist the result, and notify
    /// subscribers. Returns the updated snapshot.
    pub fn update<F>(&self, transform: F) -> Result<HostConfig>
    where
        F: FnOnce(&mut HostConfig),
    {
        let snapshot = {
            let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            transform(&mut guard);
            let snapshot = guard.clone();
            // Save while still holding the lock: read-modify-write cycles
            // from concurrent callers must serialize against the file too.
            self.save(&snapshot)?;
            snapshot
        };
        let _ = self.changes.send(snapshot.clone());
        Ok(snapshot)
    }

    fn save(&self, config: &HostConfig) -> Result<()> {
        let path = self.dir.join(CONFIG_FILE);
        let tmp = self.dir.join(format!("{CONFIG_FILE}.tmp"));
        let json = serde_json::to_string_pretty(config).context("Failed to encode config")?;
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("p2prd-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn first_boot_generates_identity_and_persists() {
        let dir = temp_dir();
        let store = ConfigStore::open(&dir).unwrap();
        let id = store.snapshot().host_id;
        assert!(Uuid::parse_str(&id).is_ok());

        // Reopen: identity is stable.
        drop(store);
        let store = ConfigStore::open(&dir).unwrap();
        assert_eq!(store.snapshot().host_id, id);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn update_persists_and_notifies() {
        let dir = temp_dir();
        let store = ConfigStore::open(&dir).unwrap();
        let mut rx = store.subscribe();

        store
            .update(|c| c.signaling_resolver_url = "wss://relay.example/ws".to_string())
            .unwrap();

        let seen = rx.try_recv().unwrap();
        assert_eq!(seen.signaling_resolver_url, "wss://relay.example/ws");

        let text = std::fs::read_to_string(dir.join(CONFIG_FILE)).unwrap();
        assert!(text.contains("wss://relay.example/ws"));
        // Pretty-printed per the on-disk contract.
        assert!(text.contains('\n'));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = temp_dir();
        std::fs::write(dir.join(CONFIG_FILE), "not json {{{").unwrap();
        let store = ConfigStore::open(&dir).unwrap();
        assert!(!store.snapshot().host_id.is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }
}
