//! Kiln Fingerprint - normalized digests of file collections
//!
//! Features:
//! - One strategy per `Normalizer`, selected by a total match
//! - Unordered normalizers sort entries, classpath normalizers keep root order
//! - Directory sensitivity decides whether directories become entries
//! - Entry-level comparison for up-to-date checks

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::hasher::{HashCode, Hasher};
use crate::property::{DirectorySensitivity, FileSpec, LineEndingSensitivity, Normalizer};
use crate::snapshot::{
    directory_signature, DirectorySnapshot, FileSystemLocationSnapshot, FileType, SnapshotVisitor,
};

/// One fingerprinted file system location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub absolute_path: String,
    /// The part of the path that participates in the fingerprint
    pub normalized_path: String,
    pub file_type: FileType,
    pub content_hash: HashCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCollectionFingerprint {
    pub property_name: String,
    pub normalizer: Normalizer,
    pub directory_sensitivity: DirectorySensitivity,
    pub line_ending_sensitivity: LineEndingSensitivity,
    pub hash: HashCode,
    /// Ordered as the normalizer defines
    pub entries: Vec<FingerprintEntry>,
    /// Snapshot trees the fingerprint was taken from; not persisted
    #[serde(skip)]
    pub roots: Vec<FileSystemLocationSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
}

impl FileCollectionFingerprint {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, absolute_path: &str) -> Option<&FingerprintEntry> {
        self.entries
            .iter()
            .find(|entry| entry.absolute_path == absolute_path)
    }

    /// Entries keyed by absolute path
    pub fn index(&self) -> HashMap<&str, &FingerprintEntry> {
        self.entries
            .iter()
            .map(|entry| (entry.absolute_path.as_str(), entry))
            .collect()
    }

    /// Entry-level differences against a previous fingerprint of the same property.
    ///
    /// Entries are matched by normalized path; for `IgnoredPath` that means
    /// only content changes are visible.
    pub fn changes_since(&self, previous: &FileCollectionFingerprint) -> Vec<FileChange> {
        if self.hash == previous.hash {
            return Vec::new();
        }
        let key = |e: &FingerprintEntry| match self.normalizer {
            Normalizer::IgnoredPath => e.content_hash.to_hex(),
            _ => e.normalized_path.clone(),
        };
        let before: HashMap<String, &FingerprintEntry> =
            previous.entries.iter().map(|e| (key(e), e)).collect();
        let after: HashMap<String, &FingerprintEntry> =
            self.entries.iter().map(|e| (key(e), e)).collect();

        let mut changes = Vec::new();
        for entry in &self.entries {
            let kind = match before.get(&key(entry)) {
                None if entry.file_type == FileType::Missing => continue,
                None => ChangeKind::Added,
                Some(old) if old.content_hash == entry.content_hash => continue,
                Some(old) if old.file_type == FileType::Missing => ChangeKind::Added,
                Some(_) if entry.file_type == FileType::Missing => ChangeKind::Removed,
                Some(_) => ChangeKind::Modified,
            };
            changes.push(FileChange {
                path: entry.absolute_path.clone(),
                kind,
            });
        }
        for entry in &previous.entries {
            if entry.file_type != FileType::Missing && !after.contains_key(&key(entry)) {
                changes.push(FileChange {
                    path: entry.absolute_path.clone(),
                    kind: ChangeKind::Removed,
                });
            }
        }
        if changes.is_empty() {
            // Same entries in a different order, only possible for classpaths
            changes.push(FileChange {
                path: String::new(),
                kind: ChangeKind::Modified,
            });
        }
        changes
    }
}

/// A node being considered for a fingerprint entry
pub struct Location<'a> {
    pub absolute_path: &'a str,
    pub name: &'a str,
    /// `/`-separated path below the declared root; the name for file and missing roots
    pub relative_path: &'a str,
    pub file_type: FileType,
}

pub trait FingerprintingStrategy: Send + Sync {
    fn normalizer(&self) -> Normalizer;

    /// Normalized path of a location, `None` to leave it out
    fn normalize(&self, location: &Location<'_>) -> Option<String>;

    fn records_directories(&self, sensitivity: DirectorySensitivity) -> bool {
        sensitivity == DirectorySensitivity::Default
    }

    fn records_missing(&self) -> bool {
        true
    }

    fn fingerprint(
        &self,
        property_name: &str,
        spec: &FileSpec,
        roots: Vec<FileSystemLocationSnapshot>,
    ) -> FileCollectionFingerprint {
        let mut collector = EntryCollector {
            strategy: self,
            directories: self.records_directories(spec.directory_sensitivity),
            seen: HashSet::new(),
            relative: Vec::new(),
            depth: 0,
            entries: Vec::new(),
        };

        let mut root_ranges = Vec::with_capacity(roots.len());
        for root in &roots {
            let start = collector.entries.len();
            collector.collect_root(root);
            root_ranges.push(start..collector.entries.len());
        }

        let mut entries = collector.entries;
        if self.normalizer().is_order_sensitive() {
            // Roots keep declaration order, a root's own entries are sorted
            for range in root_ranges {
                entries[range].sort_by(|a, b| a.normalized_path.cmp(&b.normalized_path));
            }
        } else {
            entries.sort_by(|a, b| {
                a.normalized_path
                    .cmp(&b.normalized_path)
                    .then_with(|| a.content_hash.cmp(&b.content_hash))
            });
        }

        let mut hasher = Hasher::new();
        hasher
            .put_str(self.normalizer().identifier())
            .put_usize(entries.len());
        for entry in &entries {
            hasher
                .put_str(&entry.normalized_path)
                .put_hash(&entry.content_hash);
        }

        FileCollectionFingerprint {
            property_name: property_name.to_string(),
            normalizer: self.normalizer(),
            directory_sensitivity: spec.directory_sensitivity,
            line_ending_sensitivity: spec.line_ending_sensitivity,
            hash: hasher.finish(),
            entries,
            roots,
        }
    }
}

struct EntryCollector<'s, S: ?Sized> {
    strategy: &'s S,
    directories: bool,
    seen: HashSet<String>,
    relative: Vec<String>,
    depth: usize,
    entries: Vec<FingerprintEntry>,
}

impl<S: FingerprintingStrategy + ?Sized> EntryCollector<'_, S> {
    fn collect_root(&mut self, root: &FileSystemLocationSnapshot) {
        match root {
            FileSystemLocationSnapshot::Directory(_) => root.accept(self),
            _ => self.record(
                root.absolute_path(),
                root.name(),
                root.name(),
                root.file_type(),
                root.content_hash(),
            ),
        }
    }

    fn record(
        &mut self,
        absolute_path: &str,
        name: &str,
        relative_path: &str,
        file_type: FileType,
        content_hash: HashCode,
    ) {
        if file_type == FileType::Missing && !self.strategy.records_missing() {
            return;
        }
        let location = Location {
            absolute_path,
            name,
            relative_path,
            file_type,
        };
        let Some(normalized_path) = self.strategy.normalize(&location) else {
            return;
        };
        // A location reachable through two roots is fingerprinted once
        if !self.seen.insert(absolute_path.to_string()) {
            return;
        }
        self.entries.push(FingerprintEntry {
            absolute_path: absolute_path.to_string(),
            normalized_path,
            file_type,
            content_hash,
        });
    }

    fn relative_to_root(&self, name: &str) -> String {
        let mut parts: Vec<&str> = self.relative.iter().map(String::as_str).collect();
        parts.push(name);
        parts.join("/")
    }
}

impl<S: FingerprintingStrategy + ?Sized> SnapshotVisitor for EntryCollector<'_, S> {
    fn pre_visit_directory(&mut self, directory: &DirectorySnapshot) -> bool {
        let relative = if self.depth == 0 {
            String::new()
        } else {
            let relative = self.relative_to_root(&directory.name);
            self.relative.push(directory.name.clone());
            relative
        };
        self.depth += 1;
        if self.directories {
            self.record(
                &directory.absolute_path,
                &directory.name,
                &relative,
                FileType::Directory,
                directory_signature(),
            );
        }
        true
    }

    fn visit_leaf(&mut self, snapshot: &FileSystemLocationSnapshot) {
        let relative = self.relative_to_root(snapshot.name());
        self.record(
            snapshot.absolute_path(),
            snapshot.name(),
            &relative,
            snapshot.file_type(),
            snapshot.content_hash(),
        );
    }

    fn post_visit_directory(&mut self, _directory: &DirectorySnapshot) {
        self.depth -= 1;
        if self.depth > 0 {
            self.relative.pop();
        }
    }
}

pub struct AbsolutePathStrategy;

impl FingerprintingStrategy for AbsolutePathStrategy {
    fn normalizer(&self) -> Normalizer {
        Normalizer::AbsolutePath
    }

    fn normalize(&self, location: &Location<'_>) -> Option<String> {
        Some(location.absolute_path.to_string())
    }
}

pub struct RelativePathStrategy;

impl FingerprintingStrategy for RelativePathStrategy {
    fn normalizer(&self) -> Normalizer {
        Normalizer::RelativePath
    }

    fn normalize(&self, location: &Location<'_>) -> Option<String> {
        Some(location.relative_path.to_string())
    }
}

pub struct NameOnlyStrategy;

impl FingerprintingStrategy for NameOnlyStrategy {
    fn normalizer(&self) -> Normalizer {
        Normalizer::NameOnly
    }

    fn normalize(&self, location: &Location<'_>) -> Option<String> {
        Some(location.name.to_string())
    }
}

/// Content only; the fingerprint is the multiset of file hashes
pub struct IgnoredPathStrategy;

impl FingerprintingStrategy for IgnoredPathStrategy {
    fn normalizer(&self) -> Normalizer {
        Normalizer::IgnoredPath
    }

    fn normalize(&self, location: &Location<'_>) -> Option<String> {
        (location.file_type == FileType::RegularFile).then(String::new)
    }

    fn records_directories(&self, _sensitivity: DirectorySensitivity) -> bool {
        false
    }

    fn records_missing(&self) -> bool {
        false
    }
}

/// Order-sensitive classpath entries. Files inside directory roots keep
/// their relative path, file roots (archives) their name.
pub struct ClasspathStrategy {
    compile: bool,
}

impl FingerprintingStrategy for ClasspathStrategy {
    fn normalizer(&self) -> Normalizer {
        if self.compile {
            Normalizer::CompileClasspath
        } else {
            Normalizer::Classpath
        }
    }

    fn normalize(&self, location: &Location<'_>) -> Option<String> {
        (location.file_type == FileType::RegularFile).then(|| location.relative_path.to_string())
    }

    fn records_directories(&self, _sensitivity: DirectorySensitivity) -> bool {
        false
    }

    fn records_missing(&self) -> bool {
        false
    }
}

static ABSOLUTE_PATH: AbsolutePathStrategy = AbsolutePathStrategy;
static RELATIVE_PATH: RelativePathStrategy = RelativePathStrategy;
static NAME_ONLY: NameOnlyStrategy = NameOnlyStrategy;
static IGNORED_PATH: IgnoredPathStrategy = IgnoredPathStrategy;
static CLASSPATH: ClasspathStrategy = ClasspathStrategy { compile: false };
static COMPILE_CLASSPATH: ClasspathStrategy = ClasspathStrategy { compile: true };

/// The strategy implementing `normalizer`
pub fn select_strategy(normalizer: Normalizer) -> &'static dyn FingerprintingStrategy {
    match normalizer {
        Normalizer::AbsolutePath => &ABSOLUTE_PATH,
        Normalizer::RelativePath => &RELATIVE_PATH,
        Normalizer::NameOnly => &NAME_ONLY,
        Normalizer::IgnoredPath => &IGNORED_PATH,
        Normalizer::Classpath => &CLASSPATH,
        Normalizer::CompileClasspath => &COMPILE_CLASSPATH,
    }
}

/// Fingerprint the snapshots of one file property
pub fn fingerprint_property(
    property_name: &str,
    spec: &FileSpec,
    roots: Vec<FileSystemLocationSnapshot>,
) -> FileCollectionFingerprint {
    select_strategy(spec.normalizer).fingerprint(property_name, spec, roots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::Cardinality;

    fn spec(normalizer: Normalizer, directories: DirectorySensitivity) -> FileSpec {
        let mut spec = FileSpec::input(Cardinality::Directory);
        spec.normalizer = normalizer;
        spec.directory_sensitivity = directories;
        spec
    }

    fn tree(base: &str) -> FileSystemLocationSnapshot {
        FileSystemLocationSnapshot::directory(
            format!("{}/root", base),
            vec![
                FileSystemLocationSnapshot::file(format!("{}/root/a.txt", base), HashCode::of(b"a")),
                FileSystemLocationSnapshot::directory(format!("{}/root/empty", base), vec![]),
                FileSystemLocationSnapshot::directory(
                    format!("{}/root/sub", base),
                    vec![FileSystemLocationSnapshot::file(
                        format!("{}/root/sub/b.txt", base),
                        HashCode::of(b"b"),
                    )],
                ),
            ],
        )
    }

    fn normalized(fingerprint: &FileCollectionFingerprint) -> Vec<&str> {
        fingerprint
            .entries
            .iter()
            .map(|e| e.normalized_path.as_str())
            .collect()
    }

    #[test]
    fn test_selection_is_total() {
        for normalizer in Normalizer::ALL {
            assert_eq!(select_strategy(normalizer).normalizer(), normalizer);
        }
    }

    #[test]
    fn test_relative_path_ignoring_directories() {
        let fp = fingerprint_property(
            "src",
            &spec(Normalizer::RelativePath, DirectorySensitivity::IgnoreDirectories),
            vec![tree("/w")],
        );
        assert_eq!(normalized(&fp), vec!["a.txt", "sub/b.txt"]);
    }

    #[test]
    fn test_default_directory_sensitivity_records_directories() {
        let fp = fingerprint_property(
            "src",
            &spec(Normalizer::RelativePath, DirectorySensitivity::Default),
            vec![tree("/w")],
        );
        assert_eq!(normalized(&fp), vec!["", "a.txt", "empty", "sub", "sub/b.txt"]);
        let empty = fp.entry("/w/root/empty").unwrap();
        assert_eq!(empty.content_hash, directory_signature());
    }

    #[test]
    fn test_relative_path_is_location_independent() {
        let s = spec(Normalizer::RelativePath, DirectorySensitivity::Default);
        let here = fingerprint_property("src", &s, vec![tree("/w")]);
        let there = fingerprint_property("src", &s, vec![tree("/elsewhere")]);
        assert_eq!(here.hash, there.hash);

        let s = spec(Normalizer::AbsolutePath, DirectorySensitivity::Default);
        let here = fingerprint_property("src", &s, vec![tree("/w")]);
        let there = fingerprint_property("src", &s, vec![tree("/elsewhere")]);
        assert_ne!(here.hash, there.hash);
    }

    #[test]
    fn test_ignored_path_keeps_content_only() {
        let s = spec(Normalizer::IgnoredPath, DirectorySensitivity::Default);
        let fp = fingerprint_property("res", &s, vec![tree("/w")]);
        assert_eq!(fp.entries.len(), 2);
        assert!(fp.entries.iter().all(|e| e.normalized_path.is_empty()));
        assert!(fp.entries[0].content_hash <= fp.entries[1].content_hash);
    }

    #[test]
    fn test_classpath_keeps_root_order() {
        let s = spec(Normalizer::Classpath, DirectorySensitivity::Default);
        let first = FileSystemLocationSnapshot::file("/libs/z.jar", HashCode::of(b"z"));
        let second = FileSystemLocationSnapshot::file("/libs/a.jar", HashCode::of(b"a"));
        let forward = fingerprint_property("cp", &s, vec![first.clone(), second.clone()]);
        let backward = fingerprint_property("cp", &s, vec![second, first]);
        assert_eq!(normalized(&forward), vec!["z.jar", "a.jar"]);
        assert_ne!(forward.hash, backward.hash);

        let s = spec(Normalizer::NameOnly, DirectorySensitivity::Default);
        let a = FileSystemLocationSnapshot::file("/libs/z.jar", HashCode::of(b"z"));
        let b = FileSystemLocationSnapshot::file("/libs/a.jar", HashCode::of(b"a"));
        assert_eq!(
            fingerprint_property("cp", &s, vec![a.clone(), b.clone()]).hash,
            fingerprint_property("cp", &s, vec![b, a]).hash
        );
    }

    #[test]
    fn test_missing_roots() {
        let missing = FileSystemLocationSnapshot::missing("/w/gone.txt");
        let absolute = fingerprint_property(
            "f",
            &spec(Normalizer::AbsolutePath, DirectorySensitivity::Default),
            vec![missing.clone()],
        );
        assert_eq!(absolute.entries.len(), 1);
        assert_eq!(absolute.entries[0].file_type, FileType::Missing);

        let classpath = fingerprint_property(
            "f",
            &spec(Normalizer::Classpath, DirectorySensitivity::Default),
            vec![missing],
        );
        assert!(classpath.is_empty());
    }

    #[test]
    fn test_changes_since() {
        let s = spec(Normalizer::RelativePath, DirectorySensitivity::IgnoreDirectories);
        let before = fingerprint_property("src", &s, vec![tree("/w")]);
        let after_tree = FileSystemLocationSnapshot::directory(
            "/w/root",
            vec![
                FileSystemLocationSnapshot::file("/w/root/a.txt", HashCode::of(b"a2")),
                FileSystemLocationSnapshot::file("/w/root/c.txt", HashCode::of(b"c")),
            ],
        );
        let after = fingerprint_property("src", &s, vec![after_tree]);
        let changes = after.changes_since(&before);
        assert_eq!(
            changes,
            vec![
                FileChange {
                    path: "/w/root/a.txt".into(),
                    kind: ChangeKind::Modified
                },
                FileChange {
                    path: "/w/root/c.txt".into(),
                    kind: ChangeKind::Added
                },
                FileChange {
                    path: "/w/root/sub/b.txt".into(),
                    kind: ChangeKind::Removed
                },
            ]
        );
        assert!(before.changes_since(&before).is_empty());
    }
}
