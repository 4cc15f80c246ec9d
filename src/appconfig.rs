//! Application configuration registry
//!
//! Scoped key/value settings per application, plus the enabled flag
//! that registers an application. The re-encryption run mutates this
//! registry only after the decrypt phase has finished without failures.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Encryption application id
pub const ENCRYPTION_APP: &str = "encryption";

/// Legacy encryption application id
pub const LEGACY_ENCRYPTION_APP: &str = "files_encryption";

/// Legacy install marker key
pub const INSTALLED_VERSION: &str = "installed_version";

/// Master-key mode flag key (under [`ENCRYPTION_APP`])
pub const USE_MASTER_KEY: &str = "useMasterKey";

/// Key holding an application's enabled state
pub const ENABLED: &str = "enabled";

/// Configuration capability consumed by the orchestrator
pub trait AppConfig: Send + Sync {
    /// Whether `app` is registered and enabled
    fn is_enabled(&self, app: &str) -> bool {
        self.get_value(app, ENABLED).as_deref() == Some("yes")
    }

    /// Register and enable `app`
    fn enable_app(&self, app: &str) -> Result<()> {
        self.set_value(app, ENABLED, "yes")
    }

    /// Deregister `app`, dropping every value stored under it
    fn delete_app(&self, app: &str) -> Result<()>;

    fn get_value(&self, app: &str, key: &str) -> Option<String>;

    fn set_value(&self, app: &str, key: &str, value: &str) -> Result<()>;

    fn delete_value(&self, app: &str, key: &str) -> Result<()>;

    /// Drop all values of `app` (including its enabled flag)
    fn delete_app_values(&self, app: &str) -> Result<()>;

    /// Whether files are encrypted under a single master key
    fn master_key_enabled(&self) -> bool {
        self.get_value(ENCRYPTION_APP, USE_MASTER_KEY).as_deref() == Some("1")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Registry {
    apps: BTreeMap<String, BTreeMap<String, String>>,
}

/// JSON-file backed registry
///
/// Every mutation is written through to disk (temp file + rename).
/// An in-memory instance never touches the filesystem.
pub struct JsonAppConfig {
    path: Option<PathBuf>,
    registry: Mutex<Registry>,
}

impl JsonAppConfig {
    /// Open the registry at `path`, starting empty if the file is absent
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let registry = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| {
                Error::Config(format!("Failed to read app config {:?}: {}", path, e))
            })?;
            serde_json::from_str(&content)?
        } else {
            Registry::default()
        };

        Ok(Self {
            path: Some(path),
            registry: Mutex::new(registry),
        })
    }

    /// Registry that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            path: None,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// All values, keyed by application
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.registry.lock().apps.clone()
    }

    fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Registry),
    {
        let mut registry = self.registry.lock();
        f(&mut registry);
        self.persist(&registry)
    }

    fn persist(&self, registry: &Registry) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(serde_json::to_string_pretty(registry)?.as_bytes())?;
            file.flush()?;
        }
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

impl AppConfig for JsonAppConfig {
    fn delete_app(&self, app: &str) -> Result<()> {
        self.mutate(|r| {
            r.apps.remove(app);
        })
    }

    fn get_value(&self, app: &str, key: &str) -> Option<String> {
        self.registry
            .lock()
            .apps
            .get(app)
            .and_then(|values| values.get(key))
            .cloned()
    }

    fn set_value(&self, app: &str, key: &str, value: &str) -> Result<()> {
        self.mutate(|r| {
            r.apps
                .entry(app.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string());
        })
    }

    fn delete_value(&self, app: &str, key: &str) -> Result<()> {
        self.mutate(|r| {
            if let Some(values) = r.apps.get_mut(app) {
                values.remove(key);
                if values.is_empty() {
                    r.apps.remove(app);
                }
            }
        })
    }

    fn delete_app_values(&self, app: &str) -> Result<()> {
        self.delete_app(app)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_enable_and_master_key_flag() {
        let config = JsonAppConfig::in_memory();
        assert!(!config.is_enabled(ENCRYPTION_APP));
        assert!(!config.master_key_enabled());

        config.enable_app(ENCRYPTION_APP).unwrap();
        config.set_value(ENCRYPTION_APP, USE_MASTER_KEY, "1").unwrap();

        assert!(config.is_enabled(ENCRYPTION_APP));
        assert!(config.master_key_enabled());
    }

    #[test]
    fn test_delete_value_drops_empty_app() {
        let config = JsonAppConfig::in_memory();
        config
            .set_value(LEGACY_ENCRYPTION_APP, INSTALLED_VERSION, "0.7.1")
            .unwrap();
        config
            .delete_value(LEGACY_ENCRYPTION_APP, INSTALLED_VERSION)
            .unwrap();

        assert!(config.snapshot().is_empty());
    }

    #[test]
    fn test_persists_across_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("appconfig.json");

        {
            let config = JsonAppConfig::open(&path).unwrap();
            config.enable_app(ENCRYPTION_APP).unwrap();
            config.set_value(ENCRYPTION_APP, "mode", "legacy").unwrap();
        }

        let reopened = JsonAppConfig::open(&path).unwrap();
        assert!(reopened.is_enabled(ENCRYPTION_APP));
        assert_eq!(
            reopened.get_value(ENCRYPTION_APP, "mode").as_deref(),
            Some("legacy")
        );
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_delete_app_values() {
        let config = JsonAppConfig::in_memory();
        config.enable_app(ENCRYPTION_APP).unwrap();
        config.set_value(ENCRYPTION_APP, "recoveryKeyId", "abc").unwrap();
        config.enable_app("calendar").unwrap();

        config.delete_app_values(ENCRYPTION_APP).unwrap();

        assert!(!config.is_enabled(ENCRYPTION_APP));
        assert!(config.get_value(ENCRYPTION_APP, "recoveryKeyId").is_none());
        assert!(config.is_enabled("calendar"));
    }
}
