//! Depth-first traversal of a user's file tree
//!
//! The walker keeps its own stack of directories instead of recursing,
//! so tree depth is bounded by memory rather than the call stack. It is
//! a one-shot iterator: start a new walker to walk again.
//!
//! Directories are visited at most once per walk, keyed by the physical
//! identity the storage reports, so link cycles terminate.

use crate::error::{Error, Result};
use crate::storage::{NodeKind, OwnerKind, Storage};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::debug;

/// Which entries a walk yields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkMode {
    /// Skip everything owned by shared storage
    Decrypt,
    /// Yield every file
    Full,
}

/// A file discovered by the walker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub path: PathBuf,
    pub kind: NodeKind,
    pub owner: OwnerKind,
    pub encrypted: bool,
}

/// Iterator over the files below a root directory
pub struct FileTreeWalker<'a> {
    storage: &'a dyn Storage,
    mode: WalkMode,
    stack: Vec<PathBuf>,
    pending: std::vec::IntoIter<FileNode>,
    visited: HashSet<PathBuf>,
    skipped_shared: usize,
}

impl<'a> FileTreeWalker<'a> {
    pub fn new(storage: &'a dyn Storage, root: impl Into<PathBuf>, mode: WalkMode) -> Self {
        Self {
            storage,
            mode,
            stack: vec![root.into()],
            pending: Vec::new().into_iter(),
            visited: HashSet::new(),
            skipped_shared: 0,
        }
    }

    /// Shared entries skipped so far
    pub fn skipped_shared(&self) -> usize {
        self.skipped_shared
    }
}

impl Iterator for FileTreeWalker<'_> {
    type Item = Result<FileNode>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(node) = self.pending.next() {
                return Some(Ok(node));
            }

            let dir = self.stack.pop()?;
            if let Some(id) = self.storage.directory_id(&dir) {
                if !self.visited.insert(id) {
                    debug!(path = %dir.display(), "Directory already walked, skipping");
                    continue;
                }
            }

            let entries = match self.storage.list_directory(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    return Some(Err(Error::Listing {
                        reason: e.to_string(),
                        path: dir,
                    }))
                }
            };

            let mut files = Vec::new();
            for entry in entries {
                let path = dir.join(&entry.name);

                // Shared entries are handled when walking their owner's tree
                if self.mode == WalkMode::Decrypt && entry.is_shared() {
                    debug!(path = %path.display(), "Skipping shared entry");
                    self.skipped_shared += 1;
                    continue;
                }

                if entry.is_dir() {
                    self.stack.push(path);
                } else {
                    files.push(FileNode {
                        path,
                        kind: entry.kind,
                        owner: entry.owner,
                        encrypted: entry.encrypted,
                    });
                }
            }
            self.pending = files.into_iter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DirEntry, TransformMode};
    use std::collections::HashMap;
    use std::path::Path;

    /// Read-only tree held in memory
    #[derive(Default)]
    struct TreeStorage {
        dirs: HashMap<PathBuf, Vec<DirEntry>>,
    }

    impl TreeStorage {
        fn add(&mut self, dir: &str, name: &str, kind: NodeKind, owner: OwnerKind) {
            self.dirs
                .entry(PathBuf::from(dir))
                .or_default()
                .push(DirEntry {
                    name: name.into(),
                    kind,
                    owner,
                    encrypted: kind == NodeKind::File,
                });
        }
    }

    impl Storage for TreeStorage {
        fn setup_user(&self, _uid: &str) -> Result<bool> {
            Ok(true)
        }

        fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>> {
            self.dirs
                .get(path)
                .cloned()
                .ok_or_else(|| Error::PathNotFound(path.display().to_string()))
        }

        fn copy(&self, _src: &Path, _dst: &Path, _mode: TransformMode) -> Result<()> {
            unreachable!("walker never copies")
        }

        fn rename(&self, _src: &Path, _dst: &Path) -> Result<()> {
            unreachable!("walker never renames")
        }

        fn delete_all(&self, _path: &Path) -> Result<()> {
            unreachable!("walker never deletes")
        }

        fn exists(&self, path: &Path) -> bool {
            self.dirs.contains_key(path)
        }

        fn delete(&self, _path: &Path) -> Result<()> {
            unreachable!("walker never deletes")
        }
    }

    /// Generates a chain of nested directories on demand
    struct DeepStorage {
        depth: usize,
    }

    impl Storage for DeepStorage {
        fn setup_user(&self, _uid: &str) -> Result<bool> {
            Ok(true)
        }

        fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>> {
            let level = path.components().count();
            let mut entries = vec![DirEntry {
                name: "f".into(),
                kind: NodeKind::File,
                owner: OwnerKind::Home,
                encrypted: true,
            }];
            if level < self.depth {
                entries.push(DirEntry {
                    name: "d".into(),
                    kind: NodeKind::Directory,
                    owner: OwnerKind::Home,
                    encrypted: false,
                });
            }
            Ok(entries)
        }

        fn copy(&self, _src: &Path, _dst: &Path, _mode: TransformMode) -> Result<()> {
            Ok(())
        }

        fn rename(&self, _src: &Path, _dst: &Path) -> Result<()> {
            Ok(())
        }

        fn delete_all(&self, _path: &Path) -> Result<()> {
            Ok(())
        }

        fn exists(&self, _path: &Path) -> bool {
            true
        }

        fn delete(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    /// `/alice/files/loop` leads back to `/alice/files`
    struct CyclicStorage;

    impl Storage for CyclicStorage {
        fn setup_user(&self, _uid: &str) -> Result<bool> {
            Ok(true)
        }

        fn list_directory(&self, _path: &Path) -> Result<Vec<DirEntry>> {
            Ok(vec![
                DirEntry {
                    name: "a.txt".into(),
                    kind: NodeKind::File,
                    owner: OwnerKind::Home,
                    encrypted: true,
                },
                DirEntry {
                    name: "loop".into(),
                    kind: NodeKind::Directory,
                    owner: OwnerKind::Home,
                    encrypted: false,
                },
            ])
        }

        fn directory_id(&self, _path: &Path) -> Option<PathBuf> {
            Some(PathBuf::from("/alice/files"))
        }

        fn copy(&self, _src: &Path, _dst: &Path, _mode: TransformMode) -> Result<()> {
            unreachable!("walker never copies")
        }

        fn rename(&self, _src: &Path, _dst: &Path) -> Result<()> {
            unreachable!("walker never renames")
        }

        fn delete_all(&self, _path: &Path) -> Result<()> {
            unreachable!("walker never deletes")
        }

        fn exists(&self, _path: &Path) -> bool {
            true
        }

        fn delete(&self, _path: &Path) -> Result<()> {
            unreachable!("walker never deletes")
        }
    }

    fn sample_tree() -> TreeStorage {
        let mut tree = TreeStorage::default();
        tree.add("/alice/files", "a.txt", NodeKind::File, OwnerKind::Home);
        tree.add("/alice/files", "docs", NodeKind::Directory, OwnerKind::Home);
        tree.add("/alice/files", "from-bob.txt", NodeKind::File, OwnerKind::Shared);
        tree.add("/alice/files/docs", "b.txt", NodeKind::File, OwnerKind::Home);
        tree.add("/alice/files/docs", "shared-dir", NodeKind::Directory, OwnerKind::Shared);
        tree.add("/alice/files/docs/shared-dir", "c.txt", NodeKind::File, OwnerKind::Home);
        tree
    }

    fn paths(storage: &dyn Storage, mode: WalkMode) -> Vec<String> {
        let mut out: Vec<String> = FileTreeWalker::new(storage, "/alice/files", mode)
            .map(|n| n.unwrap().path.display().to_string())
            .collect();
        out.sort();
        out
    }

    #[test]
    fn test_decrypt_walk_skips_shared() {
        let tree = sample_tree();
        assert_eq!(
            paths(&tree, WalkMode::Decrypt),
            vec!["/alice/files/a.txt", "/alice/files/docs/b.txt"]
        );

        let mut walker = FileTreeWalker::new(&tree, "/alice/files", WalkMode::Decrypt);
        assert_eq!(walker.by_ref().count(), 2);
        assert_eq!(walker.skipped_shared(), 2);
    }

    #[test]
    fn test_full_walk_includes_shared() {
        let tree = sample_tree();
        assert_eq!(
            paths(&tree, WalkMode::Full),
            vec![
                "/alice/files/a.txt",
                "/alice/files/docs/b.txt",
                "/alice/files/docs/shared-dir/c.txt",
                "/alice/files/from-bob.txt",
            ]
        );
    }

    #[test]
    fn test_listing_failure_is_reported() {
        let mut tree = TreeStorage::default();
        tree.add("/alice/files", "gone", NodeKind::Directory, OwnerKind::Home);
        tree.add("/alice/files", "a.txt", NodeKind::File, OwnerKind::Home);

        let results: Vec<_> = FileTreeWalker::new(&tree, "/alice/files", WalkMode::Full).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(
            &results[1],
            Err(Error::Listing { path, .. }) if path == Path::new("/alice/files/gone")
        ));
    }

    #[test]
    fn test_deep_tree_does_not_recurse() {
        let storage = DeepStorage { depth: 5_000 };
        let walker = FileTreeWalker::new(&storage, "/", WalkMode::Full);

        let mut count = 0;
        for node in walker {
            assert_eq!(node.unwrap().kind, NodeKind::File);
            count += 1;
        }
        assert_eq!(count, 5_000);
    }

    #[test]
    fn test_directory_cycle_is_walked_once() {
        for mode in [WalkMode::Decrypt, WalkMode::Full] {
            let nodes: Vec<_> = FileTreeWalker::new(&CyclicStorage, "/alice/files", mode)
                .take(10)
                .map(|n| n.unwrap().path)
                .collect();
            assert_eq!(nodes, vec![PathBuf::from("/alice/files/a.txt")]);
        }
    }
}
