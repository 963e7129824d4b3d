//! The set of paths backed by a live remote message during one run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Paths registered while reconciling. Mutable until sealed.
#[derive(Debug, Default)]
pub struct LivePathSet {
    paths: HashSet<PathBuf>,
}

impl LivePathSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a path. Returns `false` if it was already present.
    pub fn insert(&mut self, path: PathBuf) -> bool {
        self.paths.insert(path)
    }

    /// Withdraw a path whose message could not be stored.
    pub fn remove(&mut self, path: &Path) -> bool {
        self.paths.remove(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Freeze the set, adding every ancestor directory of every member down
    /// to (and including) `root`.
    pub fn seal(self, root: &Path) -> LivePaths {
        let files = self.paths.len();
        let mut all = self.paths;
        let ancestors: Vec<PathBuf> = all
            .iter()
            .flat_map(|p| p.ancestors().skip(1))
            .filter(|a| a.starts_with(root))
            .map(Path::to_path_buf)
            .collect();
        all.extend(ancestors);
        LivePaths { paths: all, files }
    }
}

/// Frozen live set used by the quarantine sweep.
#[derive(Debug, Clone, Default)]
pub struct LivePaths {
    paths: HashSet<PathBuf>,
    files: usize,
}

impl LivePaths {
    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    /// Number of message files (ancestors excluded).
    pub fn file_count(&self) -> usize {
        self.files
    }

    /// Number of entries including ancestor directories.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_adds_ancestors_within_root() {
        let root = Path::new("/backup");
        let mut set = LivePathSet::new();
        assert!(set.insert(root.join("INBOX/2024/a.eml")));
        assert!(set.insert(root.join("Sent/2023/b.eml")));
        assert!(!set.insert(root.join("INBOX/2024/a.eml")));

        let live = set.seal(root);
        assert_eq!(live.file_count(), 2);
        for p in [
            "/backup",
            "/backup/INBOX",
            "/backup/INBOX/2024",
            "/backup/INBOX/2024/a.eml",
            "/backup/Sent",
            "/backup/Sent/2023",
        ] {
            assert!(live.contains(Path::new(p)), "missing {p}");
        }
        assert!(!live.contains(Path::new("/")));
        assert_eq!(live.len(), 7);
    }

    #[test]
    fn test_remove_withdraws_path() {
        let mut set = LivePathSet::new();
        let p = PathBuf::from("/backup/INBOX/2024/a.eml");
        set.insert(p.clone());
        assert!(set.remove(&p));
        assert!(set.is_empty());
        assert!(set.seal(Path::new("/backup")).is_empty());
    }
}
