//! Storage capability
//!
//! The orchestrator sees storage only through the [`Storage`] trait:
//! directory listings annotated with ownership and encryption state,
//! and the copy/rename/delete primitives the atomic rewrite is built on.
//! The transform applied while copying is selected explicitly per call.

mod local;

pub use local::LocalStorage;

use crate::error::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Directory holding a user's files, relative to the user root
pub const FILES_DIR: &str = "files";

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

/// Which storage physically owns an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    /// The walking user's own storage
    Home,
    /// Storage shared in from another user
    Shared,
}

/// Transform applied by [`Storage::copy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    /// Byte-for-byte copy
    Plain,
    /// Write the plaintext of the source
    Decrypt,
    /// Write the source sealed under the current scheme
    Encrypt,
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Raw entry name; not necessarily UTF-8
    pub name: OsString,
    pub kind: NodeKind,
    pub owner: OwnerKind,
    pub encrypted: bool,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_shared(&self) -> bool {
        self.owner == OwnerKind::Shared
    }
}

/// Storage backend consumed by the walker and the rewriter
///
/// Paths are virtual and absolute: `/<uid>/files/...`.
pub trait Storage: Send + Sync {
    /// Prepare the storage view of `uid`; returns false if the user has no files
    fn setup_user(&self, uid: &str) -> Result<bool>;

    /// Immediate children of `path`
    fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>>;

    /// Physical identity of the directory at `path`
    ///
    /// Two virtual paths reaching the same directory through links return
    /// the same identity. Backends without links return `None`.
    fn directory_id(&self, _path: &Path) -> Option<PathBuf> {
        None
    }

    /// Copy `src` to a new file `dst`, applying `mode`
    ///
    /// Fails with [`crate::Error::Transform`] if the content cannot be
    /// transformed; `dst` may then hold a partial write.
    fn copy(&self, src: &Path, dst: &Path, mode: TransformMode) -> Result<()>;

    /// Move `src` over `dst`, replacing it
    fn rename(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Recursively delete `path`; a missing path is not an error
    fn delete_all(&self, path: &Path) -> Result<()>;

    fn exists(&self, path: &Path) -> bool;

    /// Delete a single file
    fn delete(&self, path: &Path) -> Result<()>;
}

/// Root of a user's file tree
pub fn user_home(uid: &str) -> PathBuf {
    PathBuf::from("/").join(uid).join(FILES_DIR)
}

/// Legacy per-user key storage directory
pub fn legacy_key_storage(uid: &str) -> PathBuf {
    PathBuf::from("/").join(uid).join(crate::crypto::KEY_DIR)
}

/// System-wide legacy encryption working storage
pub fn legacy_working_storage() -> PathBuf {
    PathBuf::from("/").join(crate::crypto::KEY_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_paths() {
        assert_eq!(user_home("alice"), PathBuf::from("/alice/files"));
        assert_eq!(
            legacy_key_storage("alice"),
            PathBuf::from("/alice/files_encryption")
        );
        assert_eq!(legacy_working_storage(), PathBuf::from("/files_encryption"));
    }
}
