//! Kiln Snapshotter - turns declared file values into snapshot trees
//!
//! Features:
//! - `Snapshotter` seam: the decision core only ever sees snapshot trees
//! - `DiskSnapshotter`: BLAKE3 content hashes, parallel with Rayon
//! - Deterministic child order (walkdir sorted by file name)
//! - Include/exclude patterns for file trees plus configured default excludes
//! - Symlinks followed; dangling links and missing roots reported as `Missing`
//! - Symlink cycles and other IO failures propagated

use glob::Pattern;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::error::SnapshotError;
use crate::hasher::{hash_content, HashCode};
use crate::property::{FileTree, FileValue, LineEndingSensitivity};
use crate::snapshot::FileSystemLocationSnapshot;

/// Produces one snapshot per declared root, in declaration order
pub trait Snapshotter: Send + Sync {
    fn snapshot(
        &self,
        value: &FileValue,
        line_endings: LineEndingSensitivity,
    ) -> Result<Vec<FileSystemLocationSnapshot>, SnapshotError>;
}

/// Snapshots the real file system
#[derive(Debug, Clone, Default)]
pub struct DiskSnapshotter {
    default_excludes: Vec<Pattern>,
}

enum Entry {
    Directory(PathBuf),
    File(PathBuf),
    /// A symlink whose target does not exist
    Missing(PathBuf),
}

impl DiskSnapshotter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshotter that drops anything matching one of `patterns`
    pub fn with_default_excludes(patterns: &[String]) -> Result<Self, SnapshotError> {
        let default_excludes = patterns
            .iter()
            .map(|pattern| {
                Pattern::new(pattern).map_err(|source| SnapshotError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { default_excludes })
    }

    fn excluded(&self, relative: &str, tree: Option<&FileTree>) -> bool {
        self.default_excludes.iter().any(|p| p.matches(relative))
            || tree.is_some_and(|t| t.excludes.iter().any(|p| p.matches(relative)))
    }

    fn snapshot_root(
        &self,
        root: &Path,
        tree: Option<&FileTree>,
        normalize: bool,
    ) -> Result<FileSystemLocationSnapshot, SnapshotError> {
        let metadata = match fs::metadata(root) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(root = %root.display(), "root missing");
                return Ok(FileSystemLocationSnapshot::missing(path_string(root)));
            }
            Err(source) => {
                return Err(SnapshotError::Io {
                    path: root.to_path_buf(),
                    source,
                })
            }
        };

        if !metadata.is_dir() {
            let hash = hash_file(root, normalize)?;
            return Ok(FileSystemLocationSnapshot::file(path_string(root), hash));
        }

        // Pre-order walk through symlinks; excluded directories are pruned with their subtree
        let mut entries = Vec::new();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.excluded(&relative_path(root, e.path()), tree));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let Some(link) = dangling_link(&err) else {
                        return Err(SnapshotError::Walk {
                            path: root.to_path_buf(),
                            source: err,
                        });
                    };
                    let relative = relative_path(root, &link);
                    if !self.excluded(&relative, tree) && tree.map_or(true, |t| t.matches(&relative)) {
                        debug!(link = %link.display(), "dangling symlink");
                        entries.push((err.depth(), Entry::Missing(link)));
                    }
                    continue;
                }
            };
            let depth = entry.depth();
            if entry.file_type().is_dir() {
                entries.push((depth, Entry::Directory(entry.into_path())));
            } else if tree.map_or(true, |t| t.matches(&relative_path(root, entry.path()))) {
                entries.push((depth, Entry::File(entry.into_path())));
            }
        }

        // Hash all files in parallel
        let hashes: HashMap<&Path, HashCode> = entries
            .par_iter()
            .filter_map(|(_, entry)| match entry {
                Entry::File(path) => Some(path.as_path()),
                Entry::Directory(_) | Entry::Missing(_) => None,
            })
            .map(|path| hash_file(path, normalize).map(|hash| (path, hash)))
            .collect::<Result<_, _>>()?;

        debug!(
            root = %root.display(),
            entries = entries.len(),
            files = hashes.len(),
            "snapshotted directory"
        );

        Ok(assemble(root, &entries, &hashes))
    }
}

impl Snapshotter for DiskSnapshotter {
    #[instrument(skip_all, fields(roots = value.roots().len()))]
    fn snapshot(
        &self,
        value: &FileValue,
        line_endings: LineEndingSensitivity,
    ) -> Result<Vec<FileSystemLocationSnapshot>, SnapshotError> {
        let normalize = line_endings.normalizes();
        let tree = match value {
            FileValue::Tree(tree) => Some(tree),
            _ => None,
        };
        value
            .roots()
            .into_iter()
            .map(|root| self.snapshot_root(root, tree, normalize))
            .collect()
    }
}

/// Rebuild the nested tree from a pre-order list of (depth, entry)
fn assemble(
    root: &Path,
    entries: &[(usize, Entry)],
    hashes: &HashMap<&Path, HashCode>,
) -> FileSystemLocationSnapshot {
    let mut stack: Vec<(&Path, Vec<FileSystemLocationSnapshot>)> = vec![(root, Vec::new())];

    // Never called on the root frame
    fn close(stack: &mut Vec<(&Path, Vec<FileSystemLocationSnapshot>)>) {
        if let Some((path, children)) = stack.pop() {
            let dir = FileSystemLocationSnapshot::directory(path_string(path), children);
            if let Some((_, parent)) = stack.last_mut() {
                parent.push(dir);
            }
        }
    }

    for (depth, entry) in entries {
        while stack.len() > *depth {
            close(&mut stack);
        }
        match entry {
            Entry::Directory(path) => stack.push((path.as_path(), Vec::new())),
            Entry::File(path) => {
                if let (Some(hash), Some((_, children))) = (hashes.get(path.as_path()), stack.last_mut()) {
                    children.push(FileSystemLocationSnapshot::file(path_string(path), *hash));
                }
            }
            Entry::Missing(path) => {
                if let Some((_, children)) = stack.last_mut() {
                    children.push(FileSystemLocationSnapshot::missing(path_string(path)));
                }
            }
        }
    }
    while stack.len() > 1 {
        close(&mut stack);
    }

    let (_, children) = stack.pop().unwrap_or((root, Vec::new()));
    FileSystemLocationSnapshot::directory(path_string(root), children)
}

/// Path of a symlink found during the walk whose target does not exist
fn dangling_link(err: &walkdir::Error) -> Option<PathBuf> {
    let path = err.path()?;
    let not_found = err.io_error().is_some_and(|io| io.kind() == ErrorKind::NotFound);
    let is_link = fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink());
    (not_found && is_link).then(|| path.to_path_buf())
}

fn hash_file(path: &Path, normalize: bool) -> Result<HashCode, SnapshotError> {
    let content = fs::read(path).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hash_content(&content, normalize))
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// `/`-separated path of `path` below `root`
fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Serves pre-built snapshot trees keyed by root path.
///
/// Roots without a registered tree are reported missing.
#[derive(Debug, Clone, Default)]
pub struct StaticSnapshotter {
    trees: HashMap<PathBuf, FileSystemLocationSnapshot>,
}

impl StaticSnapshotter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, snapshot: FileSystemLocationSnapshot) -> Self {
        self.insert(snapshot);
        self
    }

    pub fn insert(&mut self, snapshot: FileSystemLocationSnapshot) {
        self.trees
            .insert(PathBuf::from(snapshot.absolute_path()), snapshot);
    }
}

impl Snapshotter for StaticSnapshotter {
    fn snapshot(
        &self,
        value: &FileValue,
        _line_endings: LineEndingSensitivity,
    ) -> Result<Vec<FileSystemLocationSnapshot>, SnapshotError> {
        Ok(value
            .roots()
            .into_iter()
            .map(|root| {
                self.trees
                    .get(root)
                    .cloned()
                    .unwrap_or_else(|| FileSystemLocationSnapshot::missing(path_string(root)))
            })
            .collect())
    }
}
