//! Kiln Report - serializable snapshot of a task's inputs
//!
//! Features:
//! - Cache key, implementation and action identities
//! - Per-property value hashes and file-property hashes
//! - File property trees rebuilt from the pruned visitor stream

use serde::Serialize;
use std::collections::BTreeMap;

use crate::caching::{BeforeExecutionState, CachingState};
use crate::fingerprint::FileCollectionFingerprint;
use crate::hasher::HashCode;
use crate::property::{DirectorySensitivity, LineEndingSensitivity, Normalizer};
use crate::visitor::{visit_input_file_properties, InputFilePropertyVisitor, VisitState};
use crate::walker::TaskProperties;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Root,
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileNode {
    pub kind: NodeKind,
    pub path: String,
    pub name: String,
    pub hash: HashCode,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePropertyReport {
    pub hash: HashCode,
    pub normalization: Normalizer,
    pub directory_sensitivity: DirectorySensitivity,
    pub line_ending_sensitivity: LineEndingSensitivity,
    pub roots: Vec<FileNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInputsReport {
    pub task: String,
    pub build_cache_key: Option<HashCode>,
    pub class_loader_hash: Option<HashCode>,
    pub action_class_names: Vec<String>,
    pub action_class_loader_hashes: Vec<Option<HashCode>>,
    pub input_value_hashes: BTreeMap<String, HashCode>,
    /// Value hashes and file property hashes together
    pub input_hashes: BTreeMap<String, HashCode>,
    pub output_property_names: Vec<String>,
    pub input_properties_loaded_by_unknown_class_loader: Vec<String>,
    pub input_file_properties: BTreeMap<String, FilePropertyReport>,
}

impl TaskInputsReport {
    pub fn build(
        task: &str,
        properties: &TaskProperties,
        state: &BeforeExecutionState,
        caching: &CachingState,
    ) -> Self {
        let mut input_hashes = state.input_value_hashes.clone();
        for (name, fingerprint) in &state.input_file_fingerprints {
            input_hashes.insert(name.clone(), fingerprint.hash);
        }

        let mut builder = TreeBuilder::default();
        visit_input_file_properties(state.input_file_fingerprints.values(), &mut builder);

        Self {
            task: task.to_string(),
            build_cache_key: caching.key(),
            class_loader_hash: state.implementation.loader_hash,
            action_class_names: state
                .additional_implementations
                .iter()
                .map(|action| action.type_name.clone())
                .collect(),
            action_class_loader_hashes: state
                .additional_implementations
                .iter()
                .map(|action| action.loader_hash)
                .collect(),
            input_value_hashes: state.input_value_hashes.clone(),
            input_hashes,
            output_property_names: properties
                .outputs
                .iter()
                .map(|output| output.name().to_string())
                .collect(),
            input_properties_loaded_by_unknown_class_loader: state
                .non_cacheable_inputs
                .keys()
                .cloned()
                .collect(),
            input_file_properties: builder.properties,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Default)]
struct TreeBuilder {
    properties: BTreeMap<String, FilePropertyReport>,
    current: Option<(String, FilePropertyReport)>,
    stack: Vec<FileNode>,
}

impl TreeBuilder {
    fn node(kind: NodeKind, state: &VisitState<'_>) -> FileNode {
        FileNode {
            kind,
            path: state.absolute_path.to_string(),
            name: state.name.to_string(),
            hash: state.hash,
            children: Vec::new(),
        }
    }

    fn close(&mut self) -> Option<FileNode> {
        self.stack.pop()
    }
}

impl InputFilePropertyVisitor for TreeBuilder {
    fn pre_property(&mut self, fingerprint: &FileCollectionFingerprint) {
        self.current = Some((
            fingerprint.property_name.clone(),
            FilePropertyReport {
                hash: fingerprint.hash,
                normalization: fingerprint.normalizer,
                directory_sensitivity: fingerprint.directory_sensitivity,
                line_ending_sensitivity: fingerprint.line_ending_sensitivity,
                roots: Vec::new(),
            },
        ));
    }

    fn pre_root(&mut self, state: &VisitState<'_>) {
        self.stack.push(Self::node(NodeKind::Root, state));
    }

    fn pre_directory(&mut self, state: &VisitState<'_>) {
        self.stack.push(Self::node(NodeKind::Directory, state));
    }

    fn file(&mut self, state: &VisitState<'_>) {
        let Some(parent) = self.stack.last_mut() else {
            return;
        };
        // File roots report themselves once more as a file event
        if parent.kind == NodeKind::Root && parent.path == state.absolute_path {
            parent.hash = state.hash;
            return;
        }
        parent.children.push(Self::node(NodeKind::File, state));
    }

    fn post_directory(&mut self) {
        if let Some(directory) = self.close() {
            if let Some(parent) = self.stack.last_mut() {
                parent.children.push(directory);
            }
        }
    }

    fn post_root(&mut self) {
        if let (Some(root), Some((_, report))) = (self.close(), self.current.as_mut()) {
            report.roots.push(root);
        }
    }

    fn post_property(&mut self) {
        if let Some((name, report)) = self.current.take() {
            self.properties.insert(name, report);
        }
    }
}
