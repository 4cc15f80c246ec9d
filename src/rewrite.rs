//! Atomic per-file rewrite
//!
//! A file is transformed by copying it to a fresh sibling target with the
//! transform applied, then renaming the target over the source. If either
//! step fails the target is removed again, so after every call exactly one
//! of {source, target} exists.

use crate::error::{Error, Result};
use crate::session::{SessionFlags, DECRYPT_ALL_FLAG, ENCRYPT_ALL_FLAG};
use crate::storage::{Storage, TransformMode};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bulk operation applied to each file
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Decrypt,
    Encrypt,
}

impl Operation {
    /// Tag inserted into temporary target names
    pub fn tag(self) -> &'static str {
        match self {
            Operation::Decrypt => "decrypted",
            Operation::Encrypt => "encrypted",
        }
    }

    /// Transform the storage applies while copying
    pub fn mode(self) -> TransformMode {
        match self {
            Operation::Decrypt => TransformMode::Decrypt,
            Operation::Encrypt => TransformMode::Encrypt,
        }
    }

    /// Session flag raised while the operation runs
    pub fn session_flag(self) -> &'static str {
        match self {
            Operation::Decrypt => DECRYPT_ALL_FLAG,
            Operation::Encrypt => ENCRYPT_ALL_FLAG,
        }
    }
}

/// Source of Unix timestamps for target names
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A failed rewrite; the source is untouched
#[derive(Debug)]
pub struct RewriteFailure {
    pub source: PathBuf,
    pub target: PathBuf,
    pub error: Error,
    /// Set if the stray target could not be removed
    pub cleanup: Option<Error>,
}

/// Performs copy-then-rename rewrites through a [`Storage`]
pub struct AtomicRewriter {
    storage: Arc<dyn Storage>,
    session: Arc<dyn SessionFlags>,
    clock: Arc<dyn Clock>,
}

impl AtomicRewriter {
    pub fn new(
        storage: Arc<dyn Storage>,
        session: Arc<dyn SessionFlags>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            session,
            clock,
        }
    }

    /// Target path for `source`: `<source>.<tag>.<timestamp>`
    ///
    /// The timestamp is bumped past any existing sibling so repeated
    /// rewrites within one second still get a fresh target.
    pub fn target_path(&self, source: &Path, op: Operation) -> PathBuf {
        let mut timestamp = self.clock.now();
        loop {
            let target = tagged(source, op.tag(), timestamp);
            if !self.storage.exists(&target) {
                return target;
            }
            timestamp += 1;
        }
    }

    /// Transform `source` in place
    pub fn rewrite(&self, source: &Path, op: Operation) -> std::result::Result<(), RewriteFailure> {
        let target = self.target_path(source, op);

        self.session.set(op.session_flag());
        let result = self.swap(source, &target, op);
        // Encrypt leaves its flag raised for the whole batch
        if op == Operation::Decrypt {
            self.session.remove(DECRYPT_ALL_FLAG);
        }

        match result {
            Ok(()) => {
                debug!(path = %source.display(), op = op.tag(), "Rewrote file");
                Ok(())
            }
            Err(error) => {
                let cleanup = self.cleanup(&target).err();
                Err(RewriteFailure {
                    source: source.to_path_buf(),
                    target,
                    error,
                    cleanup,
                })
            }
        }
    }

    fn swap(&self, source: &Path, target: &Path, op: Operation) -> Result<()> {
        self.storage.copy(source, target, op.mode())?;
        self.storage.rename(target, source)
    }

    /// Best-effort removal of a stray target
    fn cleanup(&self, target: &Path) -> Result<()> {
        if !self.storage.exists(target) {
            return Ok(());
        }

        self.storage.delete(target).map_err(|e| {
            let err = Error::CleanupFailed {
                path: target.to_path_buf(),
                reason: e.to_string(),
            };
            warn!(path = %target.display(), error = %e, "Orphaned temporary target");
            err
        })
    }
}

fn tagged(source: &Path, tag: &str, timestamp: i64) -> PathBuf {
    let mut name = OsString::from(source.as_os_str());
    name.push(format!(".{}.{}", tag, timestamp));
    PathBuf::from(name)
}
