//! Fleet-wide re-encryption under a single master key
//!
//! A run moves through three phases:
//!
//! ```text
//! decrypting ──(no failures)──► reconfiguring ──► encrypting ──► done
//!      │
//!      └──(any failure, cancel)──► aborted
//! ```
//!
//! Every file of every user is decrypted in place, the encryption app is
//! re-registered in master-key mode, then every file is encrypted again.
//! Reconfiguration is irreversible, so it only happens when the decrypt
//! phase recorded no failure anywhere. Within one user's tree files are
//! rewritten one at a time; with `max_concurrent_users > 1` distinct users
//! are processed by a bounded pool of worker threads, and each phase is
//! fully joined before the next begins.

use crate::appconfig::{AppConfig, ENCRYPTION_APP, INSTALLED_VERSION, LEGACY_ENCRYPTION_APP, USE_MASTER_KEY};
use crate::crypto::KeyManager;
use crate::error::{Error, Result};
use crate::ledger::{FailureLedger, Orphans};
use crate::progress::{LoggingCallback, ProgressCallback};
use crate::rewrite::{AtomicRewriter, Clock, Operation, SystemClock};
use crate::session::{MemorySession, SessionFlags};
use crate::storage::{legacy_key_storage, legacy_working_storage, user_home, Storage};
use crate::users::{User, UserEnumerator};
use crate::walker::{FileTreeWalker, WalkMode};
use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Overall state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Decrypting,
    Reconfiguring,
    Encrypting,
    Done,
    Aborted,
}

/// Live view of the active (or last) run
#[derive(Debug, Clone, Serialize)]
pub struct ReencryptionRun {
    pub id: Option<Uuid>,
    pub state: RunState,
    /// Known once the decrypt phase has counted its users
    pub total_users: Option<usize>,
    /// Highest user number started in the current phase
    pub current_user: usize,
}

impl Default for ReencryptionRun {
    fn default() -> Self {
        Self {
            id: None,
            state: RunState::NotStarted,
            total_users: None,
            current_user: 0,
        }
    }
}

/// Counters for one phase
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub operation: Operation,
    pub users: usize,
    pub rewritten: usize,
    /// Files that needed no rewrite (plaintext during decrypt)
    pub skipped: usize,
    /// Entries left to their owner's pass
    pub shared_skipped: usize,
    pub failed: usize,
    /// User backends that failed to enumerate
    pub backend_errors: Vec<String>,
    pub cancelled: bool,
}

impl PhaseReport {
    fn new(operation: Operation) -> Self {
        Self {
            operation,
            users: 0,
            rewritten: 0,
            skipped: 0,
            shared_skipped: 0,
            failed: 0,
            backend_errors: Vec::new(),
            cancelled: false,
        }
    }
}

/// Outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub id: Uuid,
    pub state: RunState,
    pub dry_run: bool,
    pub total_users: Option<usize>,
    pub decrypt: Option<PhaseReport>,
    pub encrypt: Option<PhaseReport>,
    /// Failed paths per user, across both phases
    pub failures: FailureLedger,
    /// Temporary targets left behind by failed cleanups
    pub orphans: Orphans,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    fn new(id: Uuid, dry_run: bool) -> Self {
        Self {
            id,
            state: RunState::NotStarted,
            dry_run,
            total_users: None,
            decrypt: None,
            encrypt: None,
            failures: FailureLedger::new(),
            orphans: Orphans::default(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Finished every requested phase without a single failure
    pub fn is_clean(&self) -> bool {
        self.state == RunState::Done && self.failures.is_empty()
    }
}

/// Run tuning
#[derive(Debug, Clone)]
pub struct ReencryptOptions {
    /// Users processed in parallel; 1 is fully sequential
    pub max_concurrent_users: usize,
    /// Time budget per user pass, checked between files
    pub user_timeout: Option<Duration>,
    /// Walk and count without rewriting or reconfiguring
    pub dry_run: bool,
}

impl Default for ReencryptOptions {
    fn default() -> Self {
        Self {
            max_concurrent_users: 1,
            user_timeout: None,
            dry_run: false,
        }
    }
}

/// Result of one user's pass
#[derive(Debug, Default)]
struct UserPass {
    rewritten: usize,
    skipped: usize,
    shared_skipped: usize,
    failed: usize,
    ledger: FailureLedger,
    orphans: Orphans,
    cancelled: bool,
}

/// Accumulated results of a phase
struct PhaseTally {
    report: PhaseReport,
    ledger: FailureLedger,
    orphans: Orphans,
}

impl PhaseTally {
    fn new(op: Operation) -> Self {
        Self {
            report: PhaseReport::new(op),
            ledger: FailureLedger::new(),
            orphans: Orphans::default(),
        }
    }

    fn absorb(&mut self, pass: UserPass) {
        self.report.users += 1;
        self.report.rewritten += pass.rewritten;
        self.report.skipped += pass.skipped;
        self.report.shared_skipped += pass.shared_skipped;
        self.report.failed += pass.failed;
        self.report.cancelled |= pass.cancelled;
        self.ledger.merge(pass.ledger);
        self.orphans.extend(pass.orphans);
    }
}

/// Clears the running flag when a run ends, however it ends
struct RunGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Drives the decrypt, reconfigure and encrypt phases
pub struct Reencryptor {
    storage: Arc<dyn Storage>,
    users: UserEnumerator,
    app_config: Arc<dyn AppConfig>,
    key_manager: Arc<dyn KeyManager>,
    session: Arc<dyn SessionFlags>,
    clock: Arc<dyn Clock>,
    callback: Arc<dyn ProgressCallback>,
    options: ReencryptOptions,
    shutdown: Arc<AtomicBool>,
    running: AtomicBool,
    run: Mutex<ReencryptionRun>,
}

impl Reencryptor {
    pub fn new(
        storage: Arc<dyn Storage>,
        users: UserEnumerator,
        app_config: Arc<dyn AppConfig>,
        key_manager: Arc<dyn KeyManager>,
    ) -> Self {
        Self {
            storage,
            users,
            app_config,
            key_manager,
            session: Arc::new(MemorySession::new()),
            clock: Arc::new(SystemClock),
            callback: Arc::new(LoggingCallback),
            options: ReencryptOptions::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            run: Mutex::new(ReencryptionRun::default()),
        }
    }

    pub fn with_options(mut self, options: ReencryptOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_session(mut self, session: Arc<dyn SessionFlags>) -> Self {
        self.session = session;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the progress callback
    pub fn with_callback(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Flag that stops the run at the next file boundary once set
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Snapshot of the active or last run
    pub fn status(&self) -> ReencryptionRun {
        self.run.lock().clone()
    }

    /// Decrypt every file, then reconfigure for master-key mode
    ///
    /// Reconfiguration is skipped (state `Aborted`) if any file failed.
    pub fn decrypt_and_reconfigure(&self) -> Result<RunReport> {
        let _guard = self.begin()?;
        let mut report = self.start_report();

        if self.decrypt_phase(&mut report)? {
            self.reconfigure_phase(&mut report)?;
            self.finish(&mut report, RunState::Done);
        }
        Ok(report)
    }

    /// Validate the master key, then encrypt every file under it
    pub fn reencrypt(&self) -> Result<RunReport> {
        let _guard = self.begin()?;
        let mut report = self.start_report();

        self.encrypt_phase(&mut report)?;
        Ok(report)
    }

    /// Full migration: decrypt, reconfigure, encrypt
    pub fn run(&self) -> Result<RunReport> {
        let _guard = self.begin()?;
        let mut report = self.start_report();

        if self.decrypt_phase(&mut report)? {
            self.reconfigure_phase(&mut report)?;
            self.encrypt_phase(&mut report)?;
        }
        Ok(report)
    }

    fn begin(&self) -> Result<RunGuard<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::RunInProgress);
        }
        Ok(RunGuard {
            running: &self.running,
        })
    }

    fn start_report(&self) -> RunReport {
        let id = Uuid::new_v4();
        *self.run.lock() = ReencryptionRun {
            id: Some(id),
            ..ReencryptionRun::default()
        };
        info!(run = %id, dry_run = self.options.dry_run, "Starting re-encryption run");
        RunReport::new(id, self.options.dry_run)
    }

    fn set_state(&self, report: &mut RunReport, state: RunState) {
        report.state = state;
        let mut run = self.run.lock();
        run.state = state;
        run.current_user = 0;
    }

    fn finish(&self, report: &mut RunReport, state: RunState) {
        self.set_state(report, state);
        report.finished_at = Some(Utc::now());
        info!(
            run = %report.id,
            state = ?state,
            failures = report.failures.total(),
            orphans = report.orphans.len(),
            "Re-encryption run finished"
        );
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Returns true if the run may proceed to reconfiguration
    fn decrypt_phase(&self, report: &mut RunReport) -> Result<bool> {
        self.set_state(report, RunState::Decrypting);
        self.callback.on_phase("decrypting");

        // Decrypt numbers users as "n of total", so enumerate up front
        let users: Vec<Result<User>> = self.users.users().collect();
        let total = users.iter().filter(|u| u.is_ok()).count();
        report.total_users = Some(total);
        self.run.lock().total_users = Some(total);

        let tally = self.dispatch(Operation::Decrypt, users.into_iter(), Some(total))?;
        let proceed = tally.ledger.is_empty()
            && tally.report.backend_errors.is_empty()
            && !tally.report.cancelled;

        report.failures.merge(tally.ledger);
        report.orphans.extend(tally.orphans);
        report.decrypt = Some(tally.report);

        if !proceed {
            for (uid, paths) in report.failures.iter() {
                for path in paths {
                    error!(user = uid, path = %path.display(), "Could not decrypt");
                }
            }
            warn!(
                failures = report.failures.total(),
                "Decrypt phase incomplete, leaving configuration untouched"
            );
            self.finish(report, RunState::Aborted);
        }
        Ok(proceed)
    }

    fn reconfigure_phase(&self, report: &mut RunReport) -> Result<()> {
        self.set_state(report, RunState::Reconfiguring);
        self.callback.on_phase("reconfiguring");

        self.reconfigure().map_err(|e| {
            error!(error = %e, "Reconfiguration failed");
            self.finish(report, RunState::Aborted);
            e
        })
    }

    /// Re-register the encryption app in master-key mode
    fn reconfigure(&self) -> Result<()> {
        if self.options.dry_run {
            info!("DRY RUN: Would reconfigure encryption for master-key mode");
            return Ok(());
        }

        self.app_config.delete_app(ENCRYPTION_APP)?;
        self.storage.delete_all(&legacy_working_storage())?;
        self.app_config
            .delete_value(LEGACY_ENCRYPTION_APP, INSTALLED_VERSION)?;
        self.app_config.delete_app_values(ENCRYPTION_APP)?;
        self.app_config.enable_app(ENCRYPTION_APP)?;
        self.app_config.set_value(ENCRYPTION_APP, USE_MASTER_KEY, "1")?;

        info!("Encryption reconfigured for master-key mode");
        Ok(())
    }

    fn encrypt_phase(&self, report: &mut RunReport) -> Result<()> {
        if self.options.dry_run {
            info!("DRY RUN: Skipping master key validation");
        } else if let Err(e) = self.key_manager.validate_master_key() {
            error!(error = %e, "Master key validation failed");
            self.finish(report, RunState::Aborted);
            return Err(e);
        }

        self.set_state(report, RunState::Encrypting);
        self.callback.on_phase("encrypting");

        let tally = self.dispatch(Operation::Encrypt, self.users.users(), None)?;
        let cancelled = tally.report.cancelled;

        report.failures.merge(tally.ledger);
        report.orphans.extend(tally.orphans);
        report.encrypt = Some(tally.report);

        let state = if cancelled {
            RunState::Aborted
        } else {
            RunState::Done
        };
        self.finish(report, state);
        Ok(())
    }

    /// Feed users to one or more workers and collect their passes
    fn dispatch<I>(&self, op: Operation, users: I, total: Option<usize>) -> Result<PhaseTally>
    where
        I: Iterator<Item = Result<User>>,
    {
        let rewriter = AtomicRewriter::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.session),
            Arc::clone(&self.clock),
        );
        let tally = Mutex::new(PhaseTally::new(op));
        let workers = self.options.max_concurrent_users.max(1);

        if workers == 1 {
            let mut number = 0;
            for user in users {
                if self.is_cancelled() {
                    tally.lock().report.cancelled = true;
                    break;
                }
                match user {
                    Ok(user) => {
                        number += 1;
                        self.handle_user(&rewriter, op, &user.uid, number, total, &tally);
                    }
                    Err(e) => self.backend_failed(e, &tally),
                }
            }
            return Ok(tally.into_inner());
        }

        thread::scope(|scope| -> Result<()> {
            let (tx, rx) = bounded::<(usize, String)>(workers);
            let mut handles = Vec::with_capacity(workers);

            for id in 0..workers {
                let rx = rx.clone();
                let rewriter = &rewriter;
                let tally = &tally;
                let handle = thread::Builder::new()
                    .name(format!("reencrypt-{}", id))
                    .spawn_scoped(scope, move || {
                        for (number, uid) in rx.iter() {
                            self.handle_user(rewriter, op, &uid, number, total, tally);
                        }
                    })?;
                handles.push(handle);
            }
            drop(rx);

            let mut number = 0;
            for user in users {
                if self.is_cancelled() {
                    tally.lock().report.cancelled = true;
                    break;
                }
                match user {
                    Ok(user) => {
                        number += 1;
                        if tx.send((number, user.uid)).is_err() {
                            break;
                        }
                    }
                    Err(e) => self.backend_failed(e, &tally),
                }
            }
            drop(tx);

            for handle in handles {
                handle
                    .join()
                    .map_err(|_| Error::Internal("Re-encryption worker panicked".to_string()))?;
            }
            Ok(())
        })?;

        Ok(tally.into_inner())
    }

    fn backend_failed(&self, err: Error, tally: &Mutex<PhaseTally>) {
        error!(error = %err, "User enumeration failed");
        tally.lock().report.backend_errors.push(err.to_string());
    }

    fn handle_user(
        &self,
        rewriter: &AtomicRewriter,
        op: Operation,
        uid: &str,
        number: usize,
        total: Option<usize>,
        tally: &Mutex<PhaseTally>,
    ) {
        self.callback.on_user_start(op, uid, number, total);
        {
            let mut run = self.run.lock();
            run.current_user = run.current_user.max(number);
        }

        let pass = self.process_user(rewriter, op, uid);
        self.callback.on_user_complete(op, uid, pass.rewritten, pass.failed);
        tally.lock().absorb(pass);
    }

    /// Walk one user's tree and rewrite every eligible file
    fn process_user(&self, rewriter: &AtomicRewriter, op: Operation, uid: &str) -> UserPass {
        let mut pass = UserPass::default();
        let home = user_home(uid);

        match self.storage.setup_user(uid) {
            Ok(true) => {}
            Ok(false) => {
                debug!(user = uid, "User has no files");
                return pass;
            }
            Err(e) => {
                self.record_failure(&mut pass, uid, home, &e);
                return pass;
            }
        }

        let deadline = self.options.user_timeout.map(|t| Instant::now() + t);
        let mode = match op {
            Operation::Decrypt => WalkMode::Decrypt,
            Operation::Encrypt => WalkMode::Full,
        };
        let mut walker = FileTreeWalker::new(self.storage.as_ref(), home.clone(), mode);

        while let Some(node) = walker.next() {
            if self.is_cancelled() {
                info!(user = uid, "Shutdown requested, stopping user pass");
                pass.cancelled = true;
                break;
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                let secs = self.options.user_timeout.map_or(0, |t| t.as_secs());
                let err = Error::Timeout {
                    user: uid.to_string(),
                    secs,
                };
                self.record_failure(&mut pass, uid, home.clone(), &err);
                break;
            }

            let node = match node {
                Ok(node) => node,
                Err(e) => {
                    // A listing failure ends this user's pass
                    let path = match &e {
                        Error::Listing { path, .. } => path.clone(),
                        _ => home.clone(),
                    };
                    self.record_failure(&mut pass, uid, path, &e);
                    break;
                }
            };

            if op == Operation::Decrypt && !node.encrypted {
                debug!(path = %node.path.display(), "File not encrypted, skipping");
                pass.skipped += 1;
                continue;
            }

            if self.options.dry_run {
                debug!(path = %node.path.display(), op = op.tag(), "DRY RUN: Would rewrite");
                pass.rewritten += 1;
                continue;
            }

            match rewriter.rewrite(&node.path, op) {
                Ok(()) => pass.rewritten += 1,
                Err(failure) => {
                    if failure.cleanup.is_some() {
                        pass.orphans.push(&failure.target);
                    }
                    self.record_failure(&mut pass, uid, failure.source, &failure.error);
                }
            }
        }
        pass.shared_skipped = walker.skipped_shared();

        if op == Operation::Decrypt
            && pass.ledger.is_empty()
            && !pass.cancelled
            && !self.options.dry_run
        {
            self.delete_legacy_keys(uid);
        }
        pass
    }

    fn record_failure(&self, pass: &mut UserPass, uid: &str, path: PathBuf, err: &Error) {
        self.callback.on_file_failed(uid, &path, &err.to_string());
        pass.failed += 1;
        pass.ledger.record(uid, path);
    }

    fn delete_legacy_keys(&self, uid: &str) {
        let keys = legacy_key_storage(uid);
        match self.storage.delete_all(&keys) {
            Ok(()) => debug!(user = uid, "Deleted legacy key storage"),
            Err(e) => warn!(
                user = uid,
                path = %keys.display(),
                error = %e,
                "Failed to delete legacy key storage"
            ),
        }
    }
}
