//! The reconciler: one incremental backup run.
//!
//! A run lists the live remote messages once, maps each one to its local
//! path, downloads what is missing, and finally moves every local file that
//! no live message accounts for into quarantine. The filesystem is the only
//! state carried between runs.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{validate_quarantine_name, DEFAULT_QUARANTINE_DIR};
use crate::error::{BackupError, Result};
use crate::model::message::MessageRef;
use crate::remote::{FolderFilter, RemoteInventory};
use crate::store::live::LivePathSet;
use crate::store::path;
use crate::store::quarantine::QuarantineSweeper;
use crate::store::writer::MessageWriter;

/// Parameters of one run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Backup root directory.
    pub root: PathBuf,
    /// Name of the quarantine sub-directory.
    pub quarantine_dir: String,
    /// Folder restriction and exclusions.
    pub filter: FolderFilter,
    /// `fsync` each message before renaming it into place.
    pub fsync: bool,
}

impl SyncOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quarantine_dir: DEFAULT_QUARANTINE_DIR.to_string(),
            filter: FolderFilter::default(),
            fsync: true,
        }
    }

    /// Directory the sweep covers: the whole root, or the single folder's
    /// subtree when the run is restricted to one folder.
    pub fn sweep_root(&self) -> PathBuf {
        match &self.filter.only {
            Some(folder) => self.root.join(path::local_folder_name(folder)),
            None => self.root.clone(),
        }
    }
}

/// Phases of a run, in the only order they may occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunPhase {
    Listing,
    Reconciling,
    Sweeping,
    Reporting,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Listing => "listing",
            Self::Reconciling => "reconciling",
            Self::Sweeping => "sweeping",
            Self::Reporting => "reporting",
        };
        f.write_str(name)
    }
}

/// Counters accumulated during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    /// (A) messages fetched and written in this run.
    pub downloaded: u64,
    /// (B) messages whose file was already present.
    pub already_existing: u64,
    /// (C) files found live by the sweep.
    pub kept: u64,
    /// (D) files moved to quarantine.
    pub moved_to_quarantine: u64,
    /// Listed messages that mapped to an already registered path.
    pub duplicates: u64,
    /// Messages skipped because of a message-scoped error.
    pub failed: u64,
    /// Downloads that needed the serialization repair.
    pub repaired: u64,
    /// Total bytes of the files written in this run.
    pub bytes_written: u64,
}

impl RunCounters {
    /// `downloaded + already_existing == kept`.
    pub fn is_consistent(&self) -> bool {
        self.downloaded + self.already_existing == self.kept
    }
}

/// Outcome of the consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Success,
    Failed,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        })
    }
}

/// Everything a finished run reports.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub counters: RunCounters,
    pub verdict: Verdict,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.verdict == Verdict::Success
    }
}

/// Drives one backup run against a [`RemoteInventory`].
pub struct SyncReconciler<'a, R: RemoteInventory + ?Sized> {
    remote: &'a mut R,
    options: SyncOptions,
    phase: RunPhase,
}

impl<'a, R: RemoteInventory + ?Sized> SyncReconciler<'a, R> {
    pub fn new(remote: &'a mut R, options: SyncOptions) -> Self {
        Self {
            remote,
            options,
            phase: RunPhase::Listing,
        }
    }

    /// Execute the run.
    ///
    /// `progress` receives `(processed, total)` after each listed message.
    /// A listing failure or a filesystem error aborts the run; the local tree
    /// is left untouched when the listing fails.
    pub fn run(mut self, progress: Option<&dyn Fn(u64, u64)>) -> Result<RunReport> {
        let start = Instant::now();
        self.check_options()?;

        info!(
            phase = %self.phase,
            root = %self.options.root.display(),
            folder = self.options.filter.only.as_deref().unwrap_or("*"),
            "Starting backup run"
        );
        let refs = self.remote.list_live(&self.options.filter)?;
        info!(messages = refs.len(), "Remote listing complete");

        self.enter(RunPhase::Reconciling);
        fs::create_dir_all(&self.options.root)
            .map_err(|e| BackupError::io(&self.options.root, e))?;

        let writer = MessageWriter::new(self.options.fsync);
        let mut live = LivePathSet::new();
        let mut counters = RunCounters::default();
        let total = refs.len() as u64;

        for (i, reference) in refs.iter().enumerate() {
            match self.reconcile_one(reference, &writer, &mut live, &mut counters) {
                Ok(()) => {}
                Err(e) if e.is_message_scoped() => {
                    counters.failed += 1;
                    warn!(
                        folder = %reference.folder,
                        message_id = %reference.message_id,
                        error = %e,
                        "Skipping message"
                    );
                }
                Err(e) => return Err(e),
            }
            if let Some(cb) = progress {
                cb(i as u64 + 1, total);
            }
        }

        self.enter(RunPhase::Sweeping);
        let sweep_root = self.options.sweep_root();
        let live = live.seal(&sweep_root);
        let stats = if sweep_root
            .try_exists()
            .map_err(|e| BackupError::io(&sweep_root, e))?
        {
            let sweeper = QuarantineSweeper::new(&sweep_root, &live, &self.options.quarantine_dir);
            if self.options.filter.only.is_some() {
                sweeper.folder_only().sweep()?
            } else {
                sweeper.protect(self.ignored_dirs()).sweep()?
            }
        } else {
            debug!(dir = %sweep_root.display(), "Nothing to sweep");
            Default::default()
        };
        counters.kept = stats.kept;
        counters.moved_to_quarantine = stats.moved;

        self.enter(RunPhase::Reporting);
        let verdict = if counters.is_consistent() {
            Verdict::Success
        } else {
            Verdict::Failed
        };
        let elapsed = start.elapsed();
        info!(
            downloaded = counters.downloaded,
            already_existing = counters.already_existing,
            kept = counters.kept,
            moved = counters.moved_to_quarantine,
            duplicates = counters.duplicates,
            failed = counters.failed,
            verdict = %verdict,
            elapsed_ms = elapsed.as_millis() as u64,
            "Backup run finished"
        );

        Ok(RunReport {
            counters,
            verdict,
            elapsed,
        })
    }

    fn check_options(&self) -> Result<()> {
        let filter = &self.options.filter;
        if let Some(only) = &filter.only {
            if filter.ignore.contains(only) {
                return Err(BackupError::Config(format!(
                    "folder '{only}' is both selected and ignored"
                )));
            }
        }
        validate_quarantine_name(&self.options.quarantine_dir)
    }

    fn enter(&mut self, next: RunPhase) {
        debug_assert!(next > self.phase, "phase {next} after {}", self.phase);
        debug!(from = %self.phase, to = %next, "Phase transition");
        self.phase = next;
    }

    /// Local directories of the ignored folders, relative to the root.
    fn ignored_dirs(&self) -> BTreeSet<PathBuf> {
        self.options
            .filter
            .ignore
            .iter()
            .map(|f| PathBuf::from(path::local_folder_name(f)))
            .collect()
    }

    fn reconcile_one(
        &mut self,
        reference: &MessageRef,
        writer: &MessageWriter,
        live: &mut LivePathSet,
        counters: &mut RunCounters,
    ) -> Result<()> {
        let relative = path::derive(reference)?;
        let target = self.options.root.join(&relative);

        if !live.insert(target.clone()) {
            counters.duplicates += 1;
            warn!(
                folder = %reference.folder,
                message_id = %reference.message_id,
                path = %relative.display(),
                "Duplicate message, already mapped in this run"
            );
            return Ok(());
        }

        let result = self.store(reference, &relative, &target, writer, counters);
        if result.is_err() {
            live.remove(&target);
        }
        result
    }

    fn store(
        &mut self,
        reference: &MessageRef,
        relative: &Path,
        target: &Path,
        writer: &MessageWriter,
        counters: &mut RunCounters,
    ) -> Result<()> {
        if target.try_exists().map_err(|e| BackupError::io(target, e))? {
            counters.already_existing += 1;
            debug!(path = %relative.display(), "Already backed up");
            return Ok(());
        }

        let fetched = self
            .remote
            .fetch_body(&reference.folder, &reference.message_id)?;
        let fetched_path = path::derive(&fetched.reference)?;
        if fetched_path != relative {
            return Err(BackupError::PathMismatch {
                expected: relative.to_path_buf(),
                fetched: fetched_path,
            });
        }

        let outcome = writer.write(target, fetched.body)?;
        counters.downloaded += 1;
        counters.bytes_written += outcome.bytes;
        if outcome.repaired.is_some() {
            counters.repaired += 1;
        }
        info!(
            folder = %reference.folder,
            path = %relative.display(),
            subject = %reference.subject,
            "Downloaded"
        );
        Ok(())
    }
}
