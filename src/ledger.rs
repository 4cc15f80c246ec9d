//! Per-user failure bookkeeping
//!
//! The ledger is append-only for the duration of a run. It is consulted
//! after each user's decrypt pass (legacy key cleanup) and once at the
//! phase boundary (reconfiguration gate).

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Failed paths keyed by user, in the order they failed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailureLedger {
    failures: BTreeMap<String, Vec<PathBuf>>,
}

impl FailureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, uid: &str, path: impl Into<PathBuf>) {
        self.failures
            .entry(uid.to_string())
            .or_default()
            .push(path.into());
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failed paths of `uid`; empty if the user had none
    pub fn failures_for(&self, uid: &str) -> &[PathBuf] {
        self.failures.get(uid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Users with at least one failure
    pub fn users(&self) -> impl Iterator<Item = &str> {
        self.failures.keys().map(String::as_str)
    }

    /// Total failed paths across all users
    pub fn total(&self) -> usize {
        self.failures.values().map(Vec::len).sum()
    }

    /// Append every entry of `other`
    pub fn merge(&mut self, other: FailureLedger) {
        for (uid, paths) in other.failures {
            self.failures.entry(uid).or_default().extend(paths);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[PathBuf])> {
        self.failures
            .iter()
            .map(|(uid, paths)| (uid.as_str(), paths.as_slice()))
    }
}

/// Temporary targets that could not be cleaned up
///
/// Tracked separately from the ledger: an orphan never blocks the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Orphans {
    paths: Vec<PathBuf>,
}

impl Orphans {
    pub fn push(&mut self, path: &Path) {
        self.paths.push(path.to_path_buf());
    }

    pub fn extend(&mut self, other: Orphans) {
        self.paths.extend(other.paths);
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_query() {
        let mut ledger = FailureLedger::new();
        assert!(ledger.is_empty());
        assert!(ledger.failures_for("alice").is_empty());

        ledger.record("bob", "/bob/files/b.txt");
        ledger.record("alice", "/alice/files/z.txt");
        ledger.record("alice", "/alice/files/a.txt");

        assert!(!ledger.is_empty());
        assert!(!ledger.failures_for("alice").is_empty());
        assert!(ledger.failures_for("carol").is_empty());
        assert_eq!(ledger.total(), 3);
        assert_eq!(
            ledger.failures_for("alice"),
            &[
                PathBuf::from("/alice/files/z.txt"),
                PathBuf::from("/alice/files/a.txt")
            ]
        );
        assert_eq!(ledger.users().collect::<Vec<_>>(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_merge_appends() {
        let mut left = FailureLedger::new();
        left.record("alice", "/alice/files/1");

        let mut right = FailureLedger::new();
        right.record("alice", "/alice/files/2");
        right.record("bob", "/bob/files/1");

        left.merge(right);
        assert_eq!(left.total(), 3);
        assert_eq!(left.failures_for("alice").len(), 2);
        assert_eq!(left.failures_for("alice")[1], PathBuf::from("/alice/files/2"));
    }
}
