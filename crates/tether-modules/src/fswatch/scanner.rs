//! Polling change detection over a set of watched roots.
//!
//! Each scan walks the roots, stamps every file (mtime, size, inode) and
//! diffs the result against the previous scan. A path that disappeared and a
//! path that appeared with the same inode in one scan are reported as a
//! single rename.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use strum_macros::Display;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum WatchOp {
    Create,
    Write,
    Remove,
    Rename,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub op: WatchOp,
    pub path: PathBuf,
    /// Set for renames only.
    pub old_path: Option<PathBuf>,
}

impl Change {
    fn new(op: WatchOp, path: PathBuf) -> Self {
        Self {
            op,
            path,
            old_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
    inode: u64,
}

impl FileStamp {
    fn of(metadata: &fs::Metadata) -> Self {
        Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
            inode: inode(metadata),
        }
    }
}

#[cfg(unix)]
fn inode(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn inode(_metadata: &fs::Metadata) -> u64 {
    0
}

pub struct TreeScanner {
    roots: Vec<PathBuf>,
    recursive: bool,
    extensions: Vec<String>,
    cached_state: HashMap<PathBuf, FileStamp>,
}

impl TreeScanner {
    /// Start watching `roots`. Files already present are not reported.
    pub fn new(roots: Vec<PathBuf>, recursive: bool, extensions: Vec<String>) -> Self {
        let mut scanner = Self {
            roots,
            recursive,
            extensions: extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_string())
                .collect(),
            cached_state: HashMap::new(),
        };
        scanner.cached_state = scanner.snapshot();
        scanner
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Returns false if `root` was already watched.
    pub fn add_root(&mut self, root: PathBuf) -> bool {
        if self.roots.contains(&root) {
            return false;
        }
        let mut files = HashMap::new();
        self.collect(&root, &mut files);
        self.cached_state.extend(files);
        self.roots.push(root);
        true
    }

    /// Returns false if `root` was not watched.
    pub fn remove_root(&mut self, root: &Path) -> bool {
        let Some(index) = self.roots.iter().position(|r| r == root) else {
            return false;
        };
        self.roots.remove(index);

        let roots = &self.roots;
        self.cached_state
            .retain(|path, _| roots.iter().any(|r| path.starts_with(r)));
        true
    }

    pub fn tracked_files(&self) -> usize {
        self.cached_state.len()
    }

    pub fn scan_changes(&mut self) -> Vec<Change> {
        let current = self.snapshot();
        let mut created = Vec::new();
        // Paths whose file was swapped for another one (e.g. `mv -f` onto it).
        let mut replaced = Vec::new();
        let mut removed = Vec::new();
        let mut changes = Vec::new();

        for (path, stamp) in &current {
            match self.cached_state.get(path) {
                Some(cached) if cached.inode != 0 && cached.inode != stamp.inode => {
                    replaced.push(path.clone());
                }
                Some(cached) if cached.modified != stamp.modified || cached.len != stamp.len => {
                    debug!(target: "fswatch", "Changed: {}", path.display());
                    changes.push(Change::new(WatchOp::Write, path.clone()));
                }
                Some(_) => {}
                None => created.push(path.clone()),
            }
        }

        for (path, stamp) in &self.cached_state {
            if !current.contains_key(path) {
                removed.push((path.clone(), stamp.inode));
            }
        }

        // Pair removals with creations or replacements of the same inode.
        let mut renamed_to = Vec::new();
        removed.retain(|(old, inode)| {
            if *inode == 0 {
                return true;
            }
            let same_inode = |new: &PathBuf| current.get(new).is_some_and(|s| s.inode == *inode);
            let found = if let Some(index) = created.iter().position(same_inode) {
                Some(created.swap_remove(index))
            } else {
                let index = replaced.iter().position(same_inode);
                index.map(|index| replaced.swap_remove(index))
            };
            match found {
                Some(new) => {
                    debug!(target: "fswatch", "Renamed: {} -> {}", old.display(), new.display());
                    renamed_to.push(Change {
                        op: WatchOp::Rename,
                        path: new,
                        old_path: Some(old.clone()),
                    });
                    false
                }
                None => true,
            }
        });

        changes.extend(renamed_to);
        changes.extend(replaced.into_iter().map(|path| {
            debug!(target: "fswatch", "Replaced: {}", path.display());
            Change::new(WatchOp::Write, path)
        }));
        changes.extend(created.into_iter().map(|path| {
            debug!(target: "fswatch", "Created: {}", path.display());
            Change::new(WatchOp::Create, path)
        }));
        changes.extend(removed.into_iter().map(|(path, _)| {
            debug!(target: "fswatch", "Removed: {}", path.display());
            Change::new(WatchOp::Remove, path)
        }));
        changes.sort_by(|a, b| a.path.cmp(&b.path));

        self.cached_state = current;
        changes
    }

    fn snapshot(&self) -> HashMap<PathBuf, FileStamp> {
        let mut files = HashMap::new();
        for root in &self.roots {
            self.collect(root, &mut files);
        }
        files
    }

    fn collect(&self, root: &Path, files: &mut HashMap<PathBuf, FileStamp>) {
        let metadata = match fs::metadata(root) {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(target: "fswatch", "Cannot stat {}: {}", root.display(), e);
                return;
            }
        };

        if metadata.is_file() {
            files.insert(root.to_path_buf(), FileStamp::of(&metadata));
            return;
        }
        self.walk(root, files);
    }

    fn walk(&self, dir: &Path, files: &mut HashMap<PathBuf, FileStamp>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(target: "fswatch", "Failed to read directory {}: {}", dir.display(), e);
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if metadata.is_dir() {
                if self.recursive {
                    self.walk(&path, files);
                }
                continue;
            }
            if self.matches_extension(&path) {
                files.insert(path, FileStamp::of(&metadata));
            }
        }
    }

    fn matches_extension(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e == ext))
    }
}
