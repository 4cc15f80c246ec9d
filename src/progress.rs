//! Progress reporting for re-encryption runs

use crate::rewrite::Operation;
use std::path::Path;
use tracing::{error, info};

/// Callback for run progress
pub trait ProgressCallback: Send + Sync {
    /// Called when a phase starts
    fn on_phase(&self, phase: &str);

    /// Called when a user's pass starts; `total` is known only for decrypt
    fn on_user_start(&self, op: Operation, uid: &str, number: usize, total: Option<usize>);

    /// Called when a file could not be rewritten
    fn on_file_failed(&self, uid: &str, path: &Path, reason: &str);

    /// Called when a user's pass completes
    fn on_user_complete(&self, op: Operation, uid: &str, rewritten: usize, failed: usize);
}

/// Default no-op callback
pub struct NoOpCallback;

impl ProgressCallback for NoOpCallback {
    fn on_phase(&self, _phase: &str) {}
    fn on_user_start(&self, _op: Operation, _uid: &str, _number: usize, _total: Option<usize>) {}
    fn on_file_failed(&self, _uid: &str, _path: &Path, _reason: &str) {}
    fn on_user_complete(&self, _op: Operation, _uid: &str, _rewritten: usize, _failed: usize) {}
}

/// Logging callback that uses tracing
pub struct LoggingCallback;

impl ProgressCallback for LoggingCallback {
    fn on_phase(&self, phase: &str) {
        info!(phase = phase, "Entering phase");
    }

    fn on_user_start(&self, op: Operation, uid: &str, number: usize, total: Option<usize>) {
        let position = match total {
            Some(total) => format!("{} ({} of {})", uid, number, total),
            None => format!("{} ({})", uid, number),
        };
        info!(op = op.tag(), "Entering user {}", position);
    }

    fn on_file_failed(&self, uid: &str, path: &Path, reason: &str) {
        error!(user = uid, path = %path.display(), reason = reason, "File rewrite failed");
    }

    fn on_user_complete(&self, op: Operation, uid: &str, rewritten: usize, failed: usize) {
        if failed == 0 {
            info!(op = op.tag(), user = uid, rewritten = rewritten, "User complete");
        } else {
            error!(
                op = op.tag(),
                user = uid,
                rewritten = rewritten,
                failed = failed,
                "User completed with failures"
            );
        }
    }
}
