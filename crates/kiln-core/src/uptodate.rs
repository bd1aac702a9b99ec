//! Kiln Up-to-date - change detection against the previous execution
//!
//! Features:
//! - `AfterExecutionState`: before-state plus output fingerprints
//! - Entry-level messages for changed input and output files
//! - Value, implementation and action changes reported per property

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

use crate::caching::BeforeExecutionState;
use crate::error::TaskError;
use crate::fingerprint::{fingerprint_property, ChangeKind, FileCollectionFingerprint};
use crate::property::{Cardinality, FileSpec, LineEndingSensitivity};
use crate::snapshot::{FileSystemLocationSnapshot, FileType};
use crate::snapshotter::Snapshotter;
use crate::task::Task;
use crate::walker::TaskProperties;

/// State recorded once a task has run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AfterExecutionState {
    pub before: BeforeExecutionState,
    pub output_fingerprints: BTreeMap<String, FileCollectionFingerprint>,
    pub successful: bool,
}

impl AfterExecutionState {
    /// Snapshot the outputs as the task's actions left them
    #[instrument(skip_all, fields(task = %task.path()))]
    pub fn capture(
        task: &Task,
        before: BeforeExecutionState,
        properties: &TaskProperties,
        snapshotter: &dyn Snapshotter,
        successful: bool,
    ) -> Result<Self, TaskError> {
        let mut snapshots = BTreeMap::new();
        for property in &properties.outputs {
            if let Some(value) = property.files() {
                let roots = snapshotter.snapshot(value, LineEndingSensitivity::Default)?;
                snapshots.insert(property.name().to_string(), roots);
            }
        }
        let output_fingerprints = fingerprint_outputs(properties, snapshots);
        debug!(outputs = output_fingerprints.len(), successful, "execution state captured");
        Ok(Self {
            before,
            output_fingerprints,
            successful,
        })
    }
}

/// Fingerprint output snapshots by absolute path
pub fn fingerprint_outputs(
    properties: &TaskProperties,
    mut snapshots: BTreeMap<String, Vec<FileSystemLocationSnapshot>>,
) -> BTreeMap<String, FileCollectionFingerprint> {
    properties
        .outputs
        .iter()
        .map(|property| {
            let spec = property
                .spec
                .file_spec()
                .cloned()
                .unwrap_or_else(|| FileSpec::output(Cardinality::FileCollection));
            let roots = snapshots.remove(property.name()).unwrap_or_default();
            let fingerprint = fingerprint_property(property.name(), &spec, roots);
            (property.name().to_string(), fingerprint)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum UpToDateVerdict {
    UpToDate,
    OutOfDate { reasons: Vec<String> },
    /// Every skip-when-empty input resolved to no files; the task is skipped
    NoSource,
}

impl UpToDateVerdict {
    pub fn is_up_to_date(&self) -> bool {
        matches!(self, UpToDateVerdict::UpToDate)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, UpToDateVerdict::NoSource)
    }

    pub fn reasons(&self) -> &[String] {
        match self {
            UpToDateVerdict::UpToDate | UpToDateVerdict::NoSource => &[],
            UpToDateVerdict::OutOfDate { reasons } => reasons,
        }
    }
}

/// True when the task has skip-when-empty inputs and none of them holds a file
///
/// Directories and missing roots do not count as sources.
pub fn has_no_source(properties: &TaskProperties, current: &BeforeExecutionState) -> bool {
    let mut sources = properties
        .input_files()
        .filter(|property| {
            property
                .spec
                .file_spec()
                .is_some_and(|spec| spec.skip_when_empty)
        })
        .peekable();
    if sources.peek().is_none() {
        return false;
    }
    sources.all(|property| {
        current
            .input_file_fingerprints
            .get(property.name())
            .is_none_or(|fingerprint| {
                fingerprint
                    .entries
                    .iter()
                    .all(|entry| entry.file_type != FileType::RegularFile)
            })
    })
}

/// Compare the current state of `task` with its previous execution
#[instrument(skip_all, fields(task = %task.path()))]
pub fn check_up_to_date(
    task: &Task,
    properties: &TaskProperties,
    current: &BeforeExecutionState,
    previous: Option<&AfterExecutionState>,
) -> UpToDateVerdict {
    let path = task.path();
    if has_no_source(properties, current) {
        info!("skipped, no source");
        return UpToDateVerdict::NoSource;
    }
    let mut reasons = Vec::new();

    if !properties.has_declared_outputs() {
        if !task.actions().is_empty() {
            reasons.push("Task has not declared any outputs despite executing actions.".to_string());
        }
    } else if let Some(previous) = previous {
        let before = &previous.before;
        if !previous.successful {
            reasons.push("Task has failed previously.".to_string());
        }
        if before.implementation != current.implementation {
            reasons.push(format!(
                "Task '{}' has changed type from '{}' to '{}'.",
                path, before.implementation.type_name, current.implementation.type_name
            ));
        }
        if before.additional_implementations != current.additional_implementations
            || !current.additional_implementations.iter().all(|a| a.is_cacheable())
        {
            reasons.push(format!(
                "One or more additional actions for task '{}' have changed.",
                path
            ));
        }
        compare_values(path.as_str(), before, current, &mut reasons);
        compare_input_files(path.as_str(), before, current, &mut reasons);

        let current_outputs = fingerprint_outputs(properties, current.output_file_snapshots.clone());
        compare_outputs(&previous.output_fingerprints, &current_outputs, &mut reasons);
    } else {
        reasons.push("No history is available.".to_string());
    }

    if reasons.is_empty() {
        info!("up-to-date");
        UpToDateVerdict::UpToDate
    } else {
        info!(reason = %reasons[0], count = reasons.len(), "out of date");
        UpToDateVerdict::OutOfDate { reasons }
    }
}

fn compare_values(
    task: &str,
    before: &BeforeExecutionState,
    current: &BeforeExecutionState,
    reasons: &mut Vec<String>,
) {
    for (name, hash) in &current.input_value_hashes {
        match before.input_value_hashes.get(name) {
            Some(old) if old == hash => {}
            Some(_) => reasons.push(format!(
                "Value of input property '{}' has changed for task '{}'",
                name, task
            )),
            None => reasons.push(format!(
                "Input property '{}' has been added for task '{}'",
                name, task
            )),
        }
    }
    for name in current.non_cacheable_inputs.keys() {
        reasons.push(format!(
            "Value of input property '{}' has changed for task '{}'",
            name, task
        ));
    }
    for name in before.input_value_hashes.keys() {
        if !current.input_value_hashes.contains_key(name)
            && !current.non_cacheable_inputs.contains_key(name)
        {
            reasons.push(format!(
                "Input property '{}' has been removed for task '{}'",
                name, task
            ));
        }
    }
}

fn compare_input_files(
    task: &str,
    before: &BeforeExecutionState,
    current: &BeforeExecutionState,
    reasons: &mut Vec<String>,
) {
    for (name, fingerprint) in &current.input_file_fingerprints {
        let Some(old) = before.input_file_fingerprints.get(name) else {
            reasons.push(format!(
                "Input property '{}' has been added for task '{}'",
                name, task
            ));
            continue;
        };
        if old.normalizer != fingerprint.normalizer {
            reasons.push(format!(
                "Input property '{}' normalization has changed for task '{}'",
                name, task
            ));
            continue;
        }
        for change in fingerprint.changes_since(old) {
            reasons.push(file_change("Input", name, &change.path, change.kind));
        }
    }
    for name in before.input_file_fingerprints.keys() {
        if !current.input_file_fingerprints.contains_key(name) {
            reasons.push(format!(
                "Input property '{}' has been removed for task '{}'",
                name, task
            ));
        }
    }
}

fn compare_outputs(
    previous: &BTreeMap<String, FileCollectionFingerprint>,
    current: &BTreeMap<String, FileCollectionFingerprint>,
    reasons: &mut Vec<String>,
) {
    for (name, fingerprint) in current {
        match previous.get(name) {
            Some(old) => {
                for change in fingerprint.changes_since(old) {
                    reasons.push(file_change("Output", name, &change.path, change.kind));
                }
            }
            None => reasons.push(format!("Output property '{}' has been added.", name)),
        }
    }
    for name in previous.keys() {
        if !current.contains_key(name) {
            reasons.push(format!("Output property '{}' has been removed.", name));
        }
    }
}

fn file_change(direction: &str, property: &str, path: &str, kind: ChangeKind) -> String {
    let verb = match kind {
        ChangeKind::Added => "has been added",
        ChangeKind::Removed => "has been removed",
        ChangeKind::Modified => "has changed",
    };
    if path.is_empty() {
        format!("{} property '{}' file order has changed.", direction, property)
    } else {
        format!("{} property '{}' file {} {}.", direction, property, path, verb)
    }
}
