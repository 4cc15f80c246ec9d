//! Key storage on the local data root
//!
//! Layout under the data root:
//!
//! ```text
//! <root>/
//!   files_encryption/master.key      # master key (master-key mode)
//!   <uid>/files_encryption/user.key  # legacy per-user key
//! ```
//!
//! Keys are 32 random bytes stored hex-encoded.

use super::{generate_key, KEY_SIZE};
use crate::appconfig::AppConfig;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

/// Directory holding encryption key material, both system-wide and per user
pub const KEY_DIR: &str = "files_encryption";

/// Legacy per-user key file name
pub const USER_KEY_FILE: &str = "user.key";

/// Master key file name
pub const MASTER_KEY_FILE: &str = "master.key";

/// Reads and creates key files under a data root
#[derive(Debug, Clone)]
pub struct KeyStore {
    root: PathBuf,
}

impl KeyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Legacy per-user key storage directory
    pub fn user_key_dir(&self, uid: &str) -> PathBuf {
        self.root.join(uid).join(KEY_DIR)
    }

    pub fn user_key_path(&self, uid: &str) -> PathBuf {
        self.user_key_dir(uid).join(USER_KEY_FILE)
    }

    pub fn master_key_path(&self) -> PathBuf {
        self.root.join(KEY_DIR).join(MASTER_KEY_FILE)
    }

    /// Load the legacy key of `uid`
    pub fn user_key(&self, uid: &str) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        load_key(&self.user_key_path(uid))
            .map_err(|e| map_missing(e, format!("user key for '{}'", uid)))
    }

    /// Load the legacy key of `uid`, creating it if absent
    pub fn ensure_user_key(&self, uid: &str) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        ensure_key(&self.user_key_path(uid))
    }

    /// Load the master key
    pub fn master_key(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        load_key(&self.master_key_path()).map_err(|e| map_missing(e, "master key".to_string()))
    }

    /// Load the master key, creating it if absent
    pub fn ensure_master_key(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        ensure_key(&self.master_key_path())
    }
}

fn map_missing(err: Error, what: String) -> Error {
    match err {
        Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => Error::KeyNotFound(what),
        other => other,
    }
}

fn load_key(path: &Path) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let encoded = Zeroizing::new(fs::read_to_string(path)?);
    let decoded = Zeroizing::new(
        hex::decode(encoded.trim())
            .map_err(|e| Error::Crypto(format!("Malformed key file {:?}: {}", path, e)))?,
    );

    if decoded.len() != KEY_SIZE {
        return Err(Error::Crypto(format!(
            "Key file {:?} holds {} bytes, need {}",
            path,
            decoded.len(),
            KEY_SIZE
        )));
    }

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&decoded);
    Ok(key)
}

fn ensure_key(path: &Path) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    if path.exists() {
        return load_key(path);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let key = Zeroizing::new(generate_key());
    fs::write(path, Zeroizing::new(hex::encode(key.as_slice())).as_bytes())?;
    info!("Generated new key at {:?}", path);
    Ok(key)
}

/// Key-management capability consumed before the encrypt phase
pub trait KeyManager: Send + Sync {
    /// Ensure master-key mode is configured and a master key is available
    fn validate_master_key(&self) -> Result<()>;
}

/// [`KeyManager`] over a local [`KeyStore`]
pub struct LocalKeyManager {
    keys: KeyStore,
    app_config: Arc<dyn AppConfig>,
}

impl LocalKeyManager {
    pub fn new(keys: KeyStore, app_config: Arc<dyn AppConfig>) -> Self {
        Self { keys, app_config }
    }
}

impl KeyManager for LocalKeyManager {
    fn validate_master_key(&self) -> Result<()> {
        if !self.app_config.master_key_enabled() {
            return Err(Error::InvalidConfig(
                "Master-key mode is not enabled; run the decrypt phase first".to_string(),
            ));
        }

        self.keys.ensure_master_key()?;
        Ok(())
    }
}
