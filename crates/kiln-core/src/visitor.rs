//! Hierarchical traversal of input file fingerprints
//!
//! Replays the snapshot trees a fingerprint was taken from, emitting only the
//! nodes that are part of the fingerprint. A directory is announced lazily:
//! it stays pending until something at or below it turns out to be
//! fingerprinted, and is dropped silently otherwise.

use std::collections::HashMap;

use crate::fingerprint::{FileCollectionFingerprint, FingerprintEntry};
use crate::hasher::HashCode;
use crate::snapshot::{directory_signature, DirectorySnapshot, FileSystemLocationSnapshot, SnapshotVisitor};

/// The node an event refers to
#[derive(Debug, Clone, Copy)]
pub struct VisitState<'a> {
    pub property_name: &'a str,
    pub absolute_path: &'a str,
    pub name: &'a str,
    /// Fingerprinted hash, which may differ from the raw content hash
    pub hash: HashCode,
}

/// Receives the pruned event stream; every method defaults to a no-op
pub trait InputFilePropertyVisitor {
    fn pre_property(&mut self, _fingerprint: &FileCollectionFingerprint) {}

    fn pre_root(&mut self, _state: &VisitState<'_>) {}

    fn pre_directory(&mut self, _state: &VisitState<'_>) {}

    fn file(&mut self, _state: &VisitState<'_>) {}

    fn post_directory(&mut self) {}

    fn post_root(&mut self) {}

    fn post_property(&mut self) {}
}

struct PendingDirectory {
    absolute_path: String,
    name: String,
    emitted: bool,
}

struct PruningWalker<'v, 'f, V: ?Sized> {
    visitor: &'v mut V,
    property_name: &'f str,
    entries: HashMap<&'f str, &'f FingerprintEntry>,
    depth: usize,
    pending: Vec<PendingDirectory>,
}

impl<V: InputFilePropertyVisitor + ?Sized> PruningWalker<'_, '_, V> {
    /// Announce every pending directory, outermost first
    fn flush(&mut self) {
        let first_pending = self
            .pending
            .iter()
            .rposition(|dir| dir.emitted)
            .map_or(0, |i| i + 1);
        for dir in &mut self.pending[first_pending..] {
            let hash = self
                .entries
                .get(dir.absolute_path.as_str())
                .map_or_else(directory_signature, |entry| entry.content_hash);
            self.visitor.pre_directory(&VisitState {
                property_name: self.property_name,
                absolute_path: &dir.absolute_path,
                name: &dir.name,
                hash,
            });
            dir.emitted = true;
        }
    }
}

impl<V: InputFilePropertyVisitor + ?Sized> SnapshotVisitor for PruningWalker<'_, '_, V> {
    fn pre_visit_directory(&mut self, directory: &DirectorySnapshot) -> bool {
        self.depth += 1;
        if self.depth == 1 {
            // The root is announced by pre_root
            return true;
        }
        self.pending.push(PendingDirectory {
            absolute_path: directory.absolute_path.clone(),
            name: directory.name.clone(),
            emitted: false,
        });
        if self.entries.contains_key(directory.absolute_path.as_str()) {
            self.flush();
        }
        true
    }

    fn visit_leaf(&mut self, snapshot: &FileSystemLocationSnapshot) {
        let Some(entry) = self.entries.get(snapshot.absolute_path()).copied() else {
            return;
        };
        self.flush();
        self.visitor.file(&VisitState {
            property_name: self.property_name,
            absolute_path: snapshot.absolute_path(),
            name: snapshot.name(),
            hash: entry.content_hash,
        });
    }

    fn post_visit_directory(&mut self, _directory: &DirectorySnapshot) {
        self.depth -= 1;
        if self.depth == 0 {
            return;
        }
        if let Some(dir) = self.pending.pop() {
            if dir.emitted {
                self.visitor.post_directory();
            }
        }
    }
}

/// Replay one property's fingerprint
pub fn visit_fingerprint<V: InputFilePropertyVisitor + ?Sized>(
    fingerprint: &FileCollectionFingerprint,
    visitor: &mut V,
) {
    visitor.pre_property(fingerprint);
    for root in &fingerprint.roots {
        let entry = fingerprint.entry(root.absolute_path());
        visitor.pre_root(&VisitState {
            property_name: &fingerprint.property_name,
            absolute_path: root.absolute_path(),
            name: root.name(),
            hash: entry.map_or_else(|| root.content_hash(), |e| e.content_hash),
        });

        match root {
            FileSystemLocationSnapshot::Directory(_) => {
                let mut walker = PruningWalker {
                    visitor: &mut *visitor,
                    property_name: &fingerprint.property_name,
                    entries: fingerprint.index(),
                    depth: 0,
                    pending: Vec::new(),
                };
                root.accept(&mut walker);
            }
            _ => {
                if let Some(entry) = entry {
                    visitor.file(&VisitState {
                        property_name: &fingerprint.property_name,
                        absolute_path: root.absolute_path(),
                        name: root.name(),
                        hash: entry.content_hash,
                    });
                }
            }
        }
        visitor.post_root();
    }
    visitor.post_property();
}

/// Replay several properties, in the given order
pub fn visit_input_file_properties<'a, V, I>(fingerprints: I, visitor: &mut V)
where
    V: InputFilePropertyVisitor + ?Sized,
    I: IntoIterator<Item = &'a FileCollectionFingerprint>,
{
    for fingerprint in fingerprints {
        visit_fingerprint(fingerprint, visitor);
    }
}
