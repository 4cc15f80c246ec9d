//! Local filesystem storage backend
//!
//! Maps virtual paths (`/<uid>/files/...`) under a data root. Shares are
//! symlinks whose target lies outside the walking user's root; renames
//! onto a share replace the link target, never the link itself.

use super::{user_home, DirEntry, NodeKind, OwnerKind, Storage, TransformMode};
use crate::appconfig::AppConfig;
use crate::crypto::{self, EncryptedData, KeyKind, KeyStore, HEADER_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage rooted at a local directory
pub struct LocalStorage {
    /// Canonical data root
    root: PathBuf,
    keys: KeyStore,
    app_config: Arc<dyn AppConfig>,
}

impl LocalStorage {
    /// Open storage rooted at `root`
    pub fn new(root: impl AsRef<Path>, app_config: Arc<dyn AppConfig>) -> Result<Self> {
        let root = root.as_ref();
        if !root.exists() {
            return Err(Error::PathNotFound(root.to_string_lossy().to_string()));
        }
        let root = root.canonicalize()?;

        Ok(Self {
            keys: KeyStore::new(&root),
            root,
            app_config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    /// Resolve a virtual path to an absolute path under the root
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        self.root.join(relative)
    }

    /// Read a file with every encryption layer removed
    pub fn read_plain(&self, path: &Path) -> Result<Vec<u8>> {
        let real = self.resolve(path);
        let data = fs::read(&real)?;
        self.peel(path, &real, data)
    }

    /// Write `plaintext` to `path`, sealed under the current scheme
    pub fn write_encrypted(&self, path: &Path, plaintext: &[u8]) -> Result<()> {
        let real = self.resolve(path);
        if let Some(parent) = real.parent() {
            fs::create_dir_all(parent)?;
        }
        let sealed = self.seal(path, &real, plaintext.to_vec())?;
        fs::write(&real, sealed)?;
        Ok(())
    }

    /// User owning a real path (first component below the root)
    fn owner_of(&self, real: &Path) -> Option<String> {
        let canonical = fs::canonicalize(real).unwrap_or_else(|_| real.to_path_buf());
        let relative = canonical.strip_prefix(&self.root).ok()?;
        match relative.components().next() {
            Some(Component::Normal(uid)) => uid.to_str().map(str::to_string),
            _ => None,
        }
    }

    fn owner_key(&self, path: &Path, real: &Path) -> Result<zeroize::Zeroizing<[u8; crypto::KEY_SIZE]>> {
        let owner = self
            .owner_of(real)
            .ok_or_else(|| Error::transform(path, "file has no owning user"))?;
        self.keys
            .user_key(&owner)
            .map_err(|e| Error::transform(path, e.to_string()))
    }

    /// Strip every envelope layer from `data`
    fn peel(&self, path: &Path, real: &Path, mut data: Vec<u8>) -> Result<Vec<u8>> {
        while crypto::is_envelope(&data) {
            let envelope =
                EncryptedData::from_bytes(&data).map_err(|e| Error::transform(path, e.to_string()))?;

            let key = match envelope.kind {
                KeyKind::Master => self
                    .keys
                    .master_key()
                    .map_err(|e| Error::transform(path, e.to_string()))?,
                KeyKind::User => self.owner_key(path, real)?,
            };

            data = crypto::decrypt(&key, &envelope)
                .map_err(|e| Error::transform(path, e.to_string()))?;
        }
        Ok(data)
    }

    /// Seal `data` under the master key in master-key mode, else the owner's key
    fn seal(&self, path: &Path, real: &Path, data: Vec<u8>) -> Result<Vec<u8>> {
        let (key, kind) = if self.app_config.master_key_enabled() {
            let key = self
                .keys
                .master_key()
                .map_err(|e| Error::transform(path, e.to_string()))?;
            (key, KeyKind::Master)
        } else {
            (self.owner_key(path, real)?, KeyKind::User)
        };

        let sealed =
            crypto::encrypt(&key, kind, &data).map_err(|e| Error::transform(path, e.to_string()))?;
        Ok(sealed.to_bytes())
    }

    fn sniff_encrypted(real: &Path) -> bool {
        let mut head = Vec::with_capacity(HEADER_SIZE + TAG_SIZE);
        match fs::File::open(real) {
            Ok(file) => {
                file.take((HEADER_SIZE + TAG_SIZE) as u64)
                    .read_to_end(&mut head)
                    .is_ok()
                    && crypto::is_envelope(&head)
            }
            Err(_) => false,
        }
    }

    fn walking_user(path: &Path) -> Option<&str> {
        path.components().find_map(|c| match c {
            Component::Normal(uid) => uid.to_str(),
            _ => None,
        })
    }
}

impl Storage for LocalStorage {
    fn setup_user(&self, uid: &str) -> Result<bool> {
        Ok(self.resolve(&user_home(uid)).is_dir())
    }

    fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let real = self.resolve(path);
        let home = Self::walking_user(path).map(|uid| self.root.join(uid));
        let mut entries = Vec::new();

        for entry in fs::read_dir(&real)? {
            let entry = entry?;
            let name = entry.file_name();
            let entry_path = entry.path();

            let (owner, target) = if entry.file_type()?.is_symlink() {
                match fs::canonicalize(&entry_path) {
                    Ok(target) => {
                        let own = home.as_ref().is_some_and(|h| target.starts_with(h));
                        let owner = if own { OwnerKind::Home } else { OwnerKind::Shared };
                        (owner, target)
                    }
                    Err(e) => {
                        warn!(path = %entry_path.display(), error = %e, "Skipping dangling link");
                        continue;
                    }
                }
            } else {
                (OwnerKind::Home, entry_path)
            };

            let kind = if fs::metadata(&target)?.is_dir() {
                NodeKind::Directory
            } else {
                NodeKind::File
            };
            let encrypted = kind == NodeKind::File && Self::sniff_encrypted(&target);

            entries.push(DirEntry {
                name,
                kind,
                owner,
                encrypted,
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn directory_id(&self, path: &Path) -> Option<PathBuf> {
        fs::canonicalize(self.resolve(path)).ok()
    }

    fn copy(&self, src: &Path, dst: &Path, mode: TransformMode) -> Result<()> {
        let src_real = self.resolve(src);
        let dst_real = self.resolve(dst);

        let data = fs::read(&src_real)?;
        let data = match mode {
            TransformMode::Plain => data,
            TransformMode::Decrypt => self.peel(src, &src_real, data)?,
            TransformMode::Encrypt => self.seal(src, &src_real, data)?,
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dst_real)?;
        file.write_all(&data)?;
        file.sync_all()?;

        debug!(src = %src.display(), dst = %dst.display(), ?mode, "Copied");
        Ok(())
    }

    fn rename(&self, src: &Path, dst: &Path) -> Result<()> {
        let src_real = self.resolve(src);
        let mut dst_real = self.resolve(dst);

        let is_link = fs::symlink_metadata(&dst_real)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_link {
            dst_real = fs::canonicalize(&dst_real)?;
        }

        fs::rename(&src_real, &dst_real)?;
        Ok(())
    }

    fn delete_all(&self, path: &Path) -> Result<()> {
        let real = self.resolve(path);
        match fs::symlink_metadata(&real) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&real)?,
            Ok(_) => fs::remove_file(&real)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(self.resolve(path)).is_ok()
    }

    fn delete(&self, path: &Path) -> Result<()> {
        fs::remove_file(self.resolve(path))?;
        Ok(())
    }
}
