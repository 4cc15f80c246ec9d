//! User enumeration across authentication backends
//!
//! Each backend is paged with a fixed page size. A page shorter than the
//! page size ends that backend; an empty page is just the shortest case.

use crate::error::{Error, Result};
use crate::storage::FILES_DIR;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Users requested per backend call
pub const PAGE_SIZE: usize = 500;

/// A user known to one backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub uid: String,
    pub backend: String,
}

/// Paginated user source
pub trait UserBackend: Send + Sync {
    /// Backend name used in logs and reports
    fn name(&self) -> &str;

    /// Up to `limit` user ids matching `prefix`, starting at `offset`
    fn get_users(&self, prefix: &str, limit: usize, offset: usize) -> Result<Vec<String>>;
}

/// Fixed list of users
#[derive(Debug, Clone)]
pub struct StaticUserBackend {
    name: String,
    users: Vec<String>,
}

impl StaticUserBackend {
    pub fn new(name: impl Into<String>, users: Vec<String>) -> Self {
        Self {
            name: name.into(),
            users,
        }
    }
}

impl UserBackend for StaticUserBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_users(&self, prefix: &str, limit: usize, offset: usize) -> Result<Vec<String>> {
        Ok(self
            .users
            .iter()
            .filter(|u| u.starts_with(prefix))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Users discovered as `<root>/<uid>/files` directories
#[derive(Debug, Clone)]
pub struct DirectoryUserBackend {
    root: PathBuf,
}

impl DirectoryUserBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl UserBackend for DirectoryUserBackend {
    fn name(&self) -> &str {
        "directory"
    }

    fn get_users(&self, prefix: &str, limit: usize, offset: usize) -> Result<Vec<String>> {
        let mut uids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().join(FILES_DIR).is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str() {
                Some(uid) if uid.starts_with(prefix) => uids.push(uid.to_string()),
                Some(_) => {}
                None => warn!(
                    path = %entry.path().display(),
                    "Skipping user directory with non-UTF-8 name"
                ),
            }
        }

        uids.sort();
        Ok(uids.into_iter().skip(offset).take(limit).collect())
    }
}

/// Enumerates every user of every backend
#[derive(Clone)]
pub struct UserEnumerator {
    backends: Vec<Arc<dyn UserBackend>>,
    page_size: usize,
}

impl UserEnumerator {
    pub fn new(backends: Vec<Arc<dyn UserBackend>>) -> Self {
        Self {
            backends,
            page_size: PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn backends(&self) -> &[Arc<dyn UserBackend>] {
        &self.backends
    }

    /// Lazy sequence of all users; each call starts from the first page
    pub fn users(&self) -> Users<'_> {
        Users {
            backends: &self.backends,
            page_size: self.page_size,
            backend_index: 0,
            offset: 0,
            backend_done: false,
            last_page_head: None,
            page: Vec::new().into_iter(),
        }
    }
}

/// Iterator returned by [`UserEnumerator::users`]
///
/// A backend error is yielded once and ends that backend; iteration
/// continues with the next backend.
pub struct Users<'a> {
    backends: &'a [Arc<dyn UserBackend>],
    page_size: usize,
    backend_index: usize,
    offset: usize,
    backend_done: bool,
    last_page_head: Option<String>,
    page: std::vec::IntoIter<String>,
}

impl Users<'_> {
    fn advance_backend(&mut self) {
        self.backend_index += 1;
        self.offset = 0;
        self.backend_done = false;
        self.last_page_head = None;
    }
}

impl Iterator for Users<'_> {
    type Item = Result<User>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let backends = self.backends;
            let backend = backends.get(self.backend_index)?;

            if let Some(uid) = self.page.next() {
                return Some(Ok(User {
                    uid,
                    backend: backend.name().to_string(),
                }));
            }

            if self.backend_done {
                self.advance_backend();
                continue;
            }

            let page = match backend.get_users("", self.page_size, self.offset) {
                Ok(page) => page,
                Err(e) => {
                    self.backend_done = true;
                    return Some(Err(Error::Backend {
                        backend: backend.name().to_string(),
                        reason: e.to_string(),
                    }));
                }
            };

            debug!(
                backend = backend.name(),
                offset = self.offset,
                count = page.len(),
                "Fetched user page"
            );

            if page.len() < self.page_size {
                self.backend_done = true;
            } else if self.offset > 0 && page.first() == self.last_page_head.as_ref() {
                warn!(
                    backend = backend.name(),
                    offset = self.offset,
                    "Backend returned the same page twice, stopping pagination"
                );
                self.backend_done = true;
                continue;
            }

            self.last_page_head = page.first().cloned();
            self.offset += self.page_size;
            self.page = page.into_iter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingBackend {
        inner: StaticUserBackend,
        calls: AtomicUsize,
    }

    impl CountingBackend {
        fn with_users(n: usize) -> Self {
            let users = (0..n).map(|i| format!("user{:05}", i)).collect();
            Self {
                inner: StaticUserBackend::new("counting", users),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl UserBackend for CountingBackend {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn get_users(&self, prefix: &str, limit: usize, offset: usize) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get_users(prefix, limit, offset)
        }
    }

    /// Ignores the offset and always returns a full page
    struct StuckBackend;

    impl UserBackend for StuckBackend {
        fn name(&self) -> &str {
            "stuck"
        }

        fn get_users(&self, _prefix: &str, limit: usize, _offset: usize) -> Result<Vec<String>> {
            Ok((0..limit).map(|i| format!("u{}", i)).collect())
        }
    }

    struct BrokenBackend;

    impl UserBackend for BrokenBackend {
        fn name(&self) -> &str {
            "broken"
        }

        fn get_users(&self, _prefix: &str, _limit: usize, _offset: usize) -> Result<Vec<String>> {
            Err(Error::Internal("ldap unreachable".to_string()))
        }
    }

    #[test]
    fn test_pagination_stops_on_short_page() {
        let backend = Arc::new(CountingBackend::with_users(1003));
        let shared: Arc<dyn UserBackend> = backend.clone();
        let enumerator = UserEnumerator::new(vec![shared]);

        let users: Vec<User> = enumerator.users().collect::<Result<_>>().unwrap();

        assert_eq!(users.len(), 1003);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(users[0].uid, "user00000");
        assert_eq!(users[1002].uid, "user01002");
        assert!(users.iter().all(|u| u.backend == "counting"));
    }

    #[test]
    fn test_exact_multiple_needs_empty_page() {
        let backend = Arc::new(CountingBackend::with_users(1000));
        let shared: Arc<dyn UserBackend> = backend.clone();
        let enumerator = UserEnumerator::new(vec![shared]);

        assert_eq!(enumerator.users().count(), 1000);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_restartable() {
        let backend: Arc<dyn UserBackend> = Arc::new(CountingBackend::with_users(7));
        let enumerator = UserEnumerator::new(vec![backend]).with_page_size(3);

        assert_eq!(enumerator.users().count(), 7);
        assert_eq!(enumerator.users().count(), 7);
    }

    #[test]
    fn test_stuck_backend_terminates() {
        let backend: Arc<dyn UserBackend> = Arc::new(StuckBackend);
        let enumerator = UserEnumerator::new(vec![backend]).with_page_size(10);
        assert_eq!(enumerator.users().count(), 10);
    }

    #[test]
    fn test_backend_error_continues_with_next() {
        let enumerator = UserEnumerator::new(vec![
            Arc::new(BrokenBackend) as Arc<dyn UserBackend>,
            Arc::new(StaticUserBackend::new(
                "static",
                vec!["alice".into(), "bob".into()],
            )),
        ]);

        let results: Vec<_> = enumerator.users().collect();
        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], Err(Error::Backend { .. })));
        assert_eq!(results[1].as_ref().unwrap().uid, "alice");
        assert_eq!(results[2].as_ref().unwrap().backend, "static");
    }

    #[test]
    fn test_directory_backend() {
        let dir = tempdir().unwrap();
        for uid in ["carol", "alice", "bob"] {
            fs::create_dir_all(dir.path().join(uid).join(FILES_DIR)).unwrap();
        }
        fs::create_dir_all(dir.path().join("files_encryption")).unwrap();

        let backend = DirectoryUserBackend::new(dir.path());
        assert_eq!(
            backend.get_users("", 10, 0).unwrap(),
            vec!["alice", "bob", "carol"]
        );
        assert_eq!(backend.get_users("", 2, 1).unwrap(), vec!["bob", "carol"]);
        assert_eq!(backend.get_users("c", 10, 0).unwrap(), vec!["carol"]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_directory_backend_skips_non_utf8_uid() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("alice").join(FILES_DIR)).unwrap();
        fs::create_dir_all(
            dir.path()
                .join(OsStr::from_bytes(b"ren\xe9"))
                .join(FILES_DIR),
        )
        .unwrap();

        let backend = DirectoryUserBackend::new(dir.path());
        assert_eq!(backend.get_users("", 10, 0).unwrap(), vec!["alice"]);
    }
}
