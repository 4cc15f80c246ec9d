//! Configuration management for masterkey-migrate

use crate::error::{Error, Result};
use crate::reencrypt::ReencryptOptions;
use crate::users::PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the app configuration registry inside the data root
pub const APP_CONFIG_FILE: &str = "appconfig.json";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage root holding `<uid>/files` trees and key material
    pub data_root: PathBuf,

    /// App configuration registry (JSON)
    pub app_config_path: PathBuf,

    /// Users requested per backend page
    pub page_size: usize,

    /// Users processed in parallel (1 = sequential)
    pub max_concurrent_users: usize,

    /// Per-user time budget in seconds (0 = unlimited)
    pub user_timeout_secs: u64,

    /// Fixed user list; replaces discovery under the data root when set
    pub users: Option<Vec<String>>,

    /// Walk and count without changing anything
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("masterkey-migrate");

        Config {
            app_config_path: data_root.join(APP_CONFIG_FILE),
            data_root,
            page_size: PAGE_SIZE,
            max_concurrent_users: 1,
            user_timeout_secs: 0,
            users: None,
            dry_run: false,
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("MKM_DATA_ROOT") {
            let root = root.trim();
            if !root.is_empty() {
                self.data_root = PathBuf::from(root);
            }
        }

        if let Ok(workers) = std::env::var("MKM_MAX_CONCURRENT_USERS") {
            if let Ok(n) = workers.trim().parse::<usize>() {
                self.max_concurrent_users = n;
            }
        }

        if let Ok(timeout) = std::env::var("MKM_USER_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.trim().parse::<u64>() {
                self.user_timeout_secs = secs;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.data_root.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "Data root is required".to_string(),
            ));
        }

        if self.page_size == 0 {
            return Err(Error::InvalidConfig(
                "Page size must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_users == 0 {
            return Err(Error::InvalidConfig(
                "At least one concurrent user is required".to_string(),
            ));
        }

        Ok(())
    }

    /// Run options derived from this configuration
    pub fn reencrypt_options(&self) -> ReencryptOptions {
        ReencryptOptions {
            max_concurrent_users: self.max_concurrent_users,
            user_timeout: (self.user_timeout_secs > 0)
                .then(|| Duration::from_secs(self.user_timeout_secs)),
            dry_run: self.dry_run,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.page_size, 500);
        assert_eq!(config.max_concurrent_users, 1);
        assert!(config.app_config_path.ends_with(APP_CONFIG_FILE));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = Config {
            page_size: 50,
            users: Some(vec!["alice".to_string()]),
            dry_run: true,
            ..Config::default()
        };
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.page_size, 50);
        assert_eq!(loaded.users, Some(vec!["alice".to_string()]));
        assert!(loaded.dry_run);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "page_size": 10 }"#).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.page_size, 10);
        assert!(!loaded.dry_run);
    }

    #[test]
    fn test_validate_rejects_zero_page_size() {
        let config = Config {
            page_size: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_reencrypt_options() {
        let config = Config {
            max_concurrent_users: 4,
            user_timeout_secs: 30,
            ..Config::default()
        };
        let options = config.reencrypt_options();
        assert_eq!(options.max_concurrent_users, 4);
        assert_eq!(options.user_timeout, Some(Duration::from_secs(30)));
        assert!(Config::default().reencrypt_options().user_timeout.is_none());
    }
}
