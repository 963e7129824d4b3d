//! Quarantine sweep: moves local files that are no longer backed by a live
//! remote message into a `<quarantine>` directory next to them.
//!
//! Each directory is handled in two passes (enumerate, then act), so moving
//! files never disturbs the listing being walked. Files at a level are
//! handled before descending into sub-directories.
//!
//! A folder's own files live directly in its directory and in its
//! four-digit year directories. Other sub-directories belong to nested
//! folders and are scoped separately.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{BackupError, Result};
use crate::store::live::LivePaths;

/// Counters produced by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepStats {
    /// Files left in place because they are live.
    pub kept: u64,
    /// Files moved into quarantine.
    pub moved: u64,
}

/// `true` for a year directory of the backup layout (`2024`).
pub fn is_year_dir(name: &OsStr) -> bool {
    name.to_str()
        .is_some_and(|n| n.len() == 4 && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Walks a backup tree and quarantines everything not in the live set.
pub struct QuarantineSweeper<'a> {
    root: &'a Path,
    live: &'a LivePaths,
    quarantine_dir: &'a str,
    /// Folder directories, relative to `root`, whose own files are left alone.
    protected: BTreeSet<PathBuf>,
    /// Only sweep the files of the folder at `root`, not nested folders.
    folder_only: bool,
}

impl<'a> QuarantineSweeper<'a> {
    pub fn new(root: &'a Path, live: &'a LivePaths, quarantine_dir: &'a str) -> Self {
        Self {
            root,
            live,
            quarantine_dir,
            protected: BTreeSet::new(),
            folder_only: false,
        }
    }

    /// Leave the own files of these folder directories (relative to the
    /// root) untouched. Folders nested below them are still swept.
    pub fn protect(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.protected.extend(dirs);
        self
    }

    /// Treat `root` as one folder: sweep its files and year directories and
    /// do not enter any other sub-directory.
    pub fn folder_only(mut self) -> Self {
        self.folder_only = true;
        self
    }

    /// Run the sweep once over the scoped tree below `root`.
    pub fn sweep(&self) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        self.sweep_dir(self.root, Path::new(""), &mut stats)?;
        info!(
            root = %self.root.display(),
            kept = stats.kept,
            moved = stats.moved,
            "Quarantine sweep finished"
        );
        Ok(stats)
    }

    fn sweep_dir(&self, dir: &Path, rel: &Path, stats: &mut SweepStats) -> Result<()> {
        let own_files = !self.protected.contains(rel);
        let mut files: Vec<PathBuf> = Vec::new();
        let mut dirs: Vec<(PathBuf, PathBuf)> = Vec::new();

        for entry in fs::read_dir(dir).map_err(|e| BackupError::io(dir, e))? {
            let entry = entry.map_err(|e| BackupError::io(dir, e))?;
            let name = entry.file_name();
            if name == OsStr::new(self.quarantine_dir) {
                continue;
            }
            let file_type = entry
                .file_type()
                .map_err(|e| BackupError::io(entry.path(), e))?;
            if !file_type.is_dir() {
                if own_files {
                    files.push(entry.path());
                }
                continue;
            }

            let year = is_year_dir(&name);
            if year && !own_files {
                continue;
            }
            if self.folder_only && !(year && rel.as_os_str().is_empty()) {
                continue;
            }
            dirs.push((entry.path(), rel.join(&name)));
        }

        if !own_files {
            debug!(dir = %dir.display(), "Skipping ignored folder");
        }

        files.sort();
        dirs.sort();

        for file in &files {
            if self.live.contains(file) {
                stats.kept += 1;
            } else {
                self.quarantine(file)?;
                stats.moved += 1;
            }
        }

        for (sub, sub_rel) in &dirs {
            self.sweep_dir(sub, sub_rel, stats)?;
        }

        Ok(())
    }

    /// Move `file` to `<parent>/<quarantine_dir>/<basename>`. An existing file
    /// with that name is replaced.
    fn quarantine(&self, file: &Path) -> Result<PathBuf> {
        let parent = file.parent().unwrap_or(self.root);
        let target_dir = parent.join(self.quarantine_dir);
        fs::create_dir_all(&target_dir).map_err(|e| BackupError::io(&target_dir, e))?;

        // Paths come from read_dir, so they always end in a file name.
        let target = target_dir.join(file.file_name().unwrap_or_default());
        fs::rename(file, &target).map_err(|e| BackupError::io(file, e))?;

        let shown = file.strip_prefix(self.root).unwrap_or(file);
        info!(
            file = %shown.display(),
            quarantine = self.quarantine_dir,
            "Removed from server, moved to quarantine"
        );
        Ok(target)
    }
}
