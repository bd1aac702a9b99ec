//! Immutable file system snapshots
//!
//! A snapshot tree is produced once per declared root by a [`Snapshotter`](crate::snapshotter::Snapshotter)
//! and only ever read afterwards. Content hashes are computed by the producer.

use serde::{Deserialize, Serialize};

use crate::hasher::HashCode;

/// Hash recorded for directory entries in fingerprints
pub fn directory_signature() -> HashCode {
    HashCode::of(b"kiln:directory")
}

/// Hash recorded for missing roots in fingerprints
pub fn missing_signature() -> HashCode {
    HashCode::of(b"kiln:missing")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    RegularFile,
    Directory,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub absolute_path: String,
    pub name: String,
    pub content_hash: HashCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub absolute_path: String,
    pub name: String,
    /// Children in producer order (the disk snapshotter sorts by name)
    pub children: Vec<FileSystemLocationSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingSnapshot {
    pub absolute_path: String,
    pub name: String,
}

/// One node of a snapshot tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileSystemLocationSnapshot {
    File(FileSnapshot),
    Directory(DirectorySnapshot),
    Missing(MissingSnapshot),
}

fn name_of(path: &str) -> String {
    path.trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .to_string()
}

impl FileSystemLocationSnapshot {
    pub fn file(absolute_path: impl Into<String>, content_hash: HashCode) -> Self {
        let absolute_path = absolute_path.into();
        Self::File(FileSnapshot {
            name: name_of(&absolute_path),
            absolute_path,
            content_hash,
        })
    }

    pub fn directory(
        absolute_path: impl Into<String>,
        children: Vec<FileSystemLocationSnapshot>,
    ) -> Self {
        let absolute_path = absolute_path.into();
        Self::Directory(DirectorySnapshot {
            name: name_of(&absolute_path),
            absolute_path,
            children,
        })
    }

    pub fn missing(absolute_path: impl Into<String>) -> Self {
        let absolute_path = absolute_path.into();
        Self::Missing(MissingSnapshot {
            name: name_of(&absolute_path),
            absolute_path,
        })
    }

    pub fn absolute_path(&self) -> &str {
        match self {
            Self::File(file) => &file.absolute_path,
            Self::Directory(dir) => &dir.absolute_path,
            Self::Missing(missing) => &missing.absolute_path,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::File(file) => &file.name,
            Self::Directory(dir) => &dir.name,
            Self::Missing(missing) => &missing.name,
        }
    }

    pub fn file_type(&self) -> FileType {
        match self {
            Self::File(_) => FileType::RegularFile,
            Self::Directory(_) => FileType::Directory,
            Self::Missing(_) => FileType::Missing,
        }
    }

    /// Content hash as seen by the producer; directories and missing
    /// locations map to their fixed signatures
    pub fn content_hash(&self) -> HashCode {
        match self {
            Self::File(file) => file.content_hash,
            Self::Directory(_) => directory_signature(),
            Self::Missing(_) => missing_signature(),
        }
    }

    /// Walk the tree depth-first, children in stored order.
    ///
    /// Uses an explicit stack; deep trees do not grow the call stack.
    pub fn accept<V: SnapshotVisitor + ?Sized>(&self, visitor: &mut V) {
        enum Step<'a> {
            Enter(&'a FileSystemLocationSnapshot),
            Leave(&'a DirectorySnapshot),
        }

        let mut stack = vec![Step::Enter(self)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(FileSystemLocationSnapshot::Directory(dir)) => {
                    if visitor.pre_visit_directory(dir) {
                        stack.push(Step::Leave(dir));
                        for child in dir.children.iter().rev() {
                            stack.push(Step::Enter(child));
                        }
                    }
                }
                Step::Enter(leaf) => visitor.visit_leaf(leaf),
                Step::Leave(dir) => visitor.post_visit_directory(dir),
            }
        }
    }

    /// Count of regular files in the tree
    pub fn file_count(&self) -> usize {
        let mut counter = FileCounter(0);
        self.accept(&mut counter);
        counter.0
    }
}

/// Callbacks for [`FileSystemLocationSnapshot::accept`]
pub trait SnapshotVisitor {
    /// Return `false` to skip the directory's children (and its post visit)
    fn pre_visit_directory(&mut self, directory: &DirectorySnapshot) -> bool;

    /// Called for regular files and missing locations
    fn visit_leaf(&mut self, snapshot: &FileSystemLocationSnapshot);

    fn post_visit_directory(&mut self, directory: &DirectorySnapshot);
}

struct FileCounter(usize);

impl SnapshotVisitor for FileCounter {
    fn pre_visit_directory(&mut self, _directory: &DirectorySnapshot) -> bool {
        true
    }

    fn visit_leaf(&mut self, snapshot: &FileSystemLocationSnapshot) {
        if snapshot.file_type() == FileType::RegularFile {
            self.0 += 1;
        }
    }

    fn post_visit_directory(&mut self, _directory: &DirectorySnapshot) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Vec<String>);

    impl SnapshotVisitor for Recorder {
        fn pre_visit_directory(&mut self, directory: &DirectorySnapshot) -> bool {
            self.0.push(format!("enter {}", directory.name));
            directory.name != "skipped"
        }

        fn visit_leaf(&mut self, snapshot: &FileSystemLocationSnapshot) {
            self.0.push(format!("leaf {}", snapshot.name()));
        }

        fn post_visit_directory(&mut self, directory: &DirectorySnapshot) {
            self.0.push(format!("leave {}", directory.name));
        }
    }

    fn tree() -> FileSystemLocationSnapshot {
        FileSystemLocationSnapshot::directory(
            "/w/root",
            vec![
                FileSystemLocationSnapshot::file("/w/root/a.txt", HashCode::of(b"a")),
                FileSystemLocationSnapshot::directory(
                    "/w/root/skipped",
                    vec![FileSystemLocationSnapshot::file(
                        "/w/root/skipped/x",
                        HashCode::of(b"x"),
                    )],
                ),
                FileSystemLocationSnapshot::directory(
                    "/w/root/sub",
                    vec![FileSystemLocationSnapshot::file(
                        "/w/root/sub/b.txt",
                        HashCode::of(b"b"),
                    )],
                ),
            ],
        )
    }

    #[test]
    fn test_names_derived_from_paths() {
        let snapshot = FileSystemLocationSnapshot::file("/w/root/a.txt", HashCode::of(b"a"));
        assert_eq!(snapshot.name(), "a.txt");
        let dir = FileSystemLocationSnapshot::directory("/w/root/", vec![]);
        assert_eq!(dir.name(), "root");
    }

    #[test]
    fn test_depth_first_order_and_skip() {
        let mut recorder = Recorder(Vec::new());
        tree().accept(&mut recorder);
        assert_eq!(
            recorder.0,
            vec![
                "enter root",
                "leaf a.txt",
                "enter skipped",
                "enter sub",
                "leaf b.txt",
                "leave sub",
                "leave root",
            ]
        );
    }

    #[test]
    fn test_file_count() {
        assert_eq!(tree().file_count(), 3);
    }

    #[test]
    fn test_signatures_are_distinct() {
        assert_ne!(directory_signature(), missing_signature());
    }
}
