//! Kiln Caching - cache keys and disablement reasons
//!
//! Features:
//! - `BeforeExecutionState` captured once per execution attempt (file
//!   properties fingerprinted in parallel with Rayon)
//! - Every applicable disablement reason collected in precedence order
//! - Cache key stable across processes: built only from names and hashes
//! - Output overlap detection across tasks

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, instrument};

use crate::config::BuildCacheConfig;
use crate::error::TaskError;
use crate::fingerprint::{fingerprint_property, FileCollectionFingerprint};
use crate::hasher::{HashCode, Hasher};
use crate::property::{FileSpec, FileValue, LineEndingSensitivity};
use crate::snapshot::FileSystemLocationSnapshot;
use crate::snapshotter::Snapshotter;
use crate::task::{Task, TaskPath};
use crate::value::{Implementation, PropertyValue};
use crate::walker::{ResolvedProperty, TaskProperties};

/// Everything known about a task right before it would execute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeforeExecutionState {
    pub implementation: Implementation,
    /// Action implementations in execution order
    pub additional_implementations: Vec<Implementation>,
    pub input_value_hashes: BTreeMap<String, HashCode>,
    /// Input values that could not be hashed, with the offending type
    pub non_cacheable_inputs: BTreeMap<String, String>,
    pub input_file_fingerprints: BTreeMap<String, FileCollectionFingerprint>,
    pub output_file_snapshots: BTreeMap<String, Vec<FileSystemLocationSnapshot>>,
}

impl BeforeExecutionState {
    /// Hash input values and fingerprint input files of `task`
    #[instrument(skip_all, fields(task = %task.path()))]
    pub fn capture(
        task: &Task,
        properties: &TaskProperties,
        snapshotter: &dyn Snapshotter,
    ) -> Result<Self, TaskError> {
        let mut input_value_hashes = BTreeMap::new();
        let mut non_cacheable_inputs = BTreeMap::new();
        for property in properties.input_values() {
            let value = property.value().cloned().unwrap_or(PropertyValue::Null);
            match value.hash() {
                Ok(hash) => {
                    input_value_hashes.insert(property.name().to_string(), hash);
                }
                Err(err) => {
                    non_cacheable_inputs.insert(property.name().to_string(), err.type_name);
                }
            }
        }

        let file_inputs: Vec<(&ResolvedProperty, &FileSpec)> = properties
            .input_files()
            .filter_map(|property| property.spec.file_spec().map(|spec| (property, spec)))
            .collect();
        let input_file_fingerprints = file_inputs
            .par_iter()
            .map(|&(property, spec)| -> Result<(String, FileCollectionFingerprint), TaskError> {
                let roots = match property.files() {
                    Some(value) => snapshotter.snapshot(value, spec.line_ending_sensitivity)?,
                    None => Vec::new(),
                };
                let fingerprint = fingerprint_property(property.name(), spec, roots);
                debug!(
                    property = property.name(),
                    normalizer = %spec.normalizer,
                    entries = fingerprint.entries.len(),
                    hash = %fingerprint.hash.short(),
                    "fingerprinted input"
                );
                Ok((property.name().to_string(), fingerprint))
            })
            .collect::<Result<BTreeMap<_, _>, TaskError>>()?;

        let mut output_file_snapshots = BTreeMap::new();
        for property in &properties.outputs {
            if let Some(value) = property.files() {
                let roots = snapshotter.snapshot(value, LineEndingSensitivity::Default)?;
                output_file_snapshots.insert(property.name().to_string(), roots);
            }
        }

        Ok(Self {
            implementation: task.implementation().clone(),
            additional_implementations: task
                .actions()
                .iter()
                .map(|action| action.implementation.clone())
                .collect(),
            input_value_hashes,
            non_cacheable_inputs,
            input_file_fingerprints,
            output_file_snapshots,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisabledReasonCategory {
    BuildCacheDisabled,
    NotEnabledForTask,
    NoOutputsDeclared,
    NonCacheableTreeOutput,
    CacheIfSpecNotSatisfied,
    DoNotCacheIfSpecSatisfied,
    OverlappingOutputs,
    NonCacheableTaskImplementation,
    NonCacheableTaskAction,
    NonCacheableInputs,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisabledReason {
    pub category: DisabledReasonCategory,
    pub description: String,
}

impl DisabledReason {
    fn new(category: DisabledReasonCategory, description: impl Into<String>) -> Self {
        Self {
            category,
            description: description.into(),
        }
    }
}

/// Caching verdict of an analysed task
///
/// Both variants carry the before-execution state. It is captured whether or
/// not caching is enabled, and a failure to capture it is returned as a
/// [`TaskError`] instead of a disabled state, so it is never absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum CachingState {
    Enabled {
        key: HashCode,
        state: BeforeExecutionState,
    },
    Disabled {
        /// Precedence order; the first is the primary reason
        reasons: Vec<DisabledReason>,
        state: BeforeExecutionState,
    },
}

impl CachingState {
    pub fn is_enabled(&self) -> bool {
        matches!(self, CachingState::Enabled { .. })
    }

    pub fn key(&self) -> Option<HashCode> {
        match self {
            CachingState::Enabled { key, .. } => Some(*key),
            CachingState::Disabled { .. } => None,
        }
    }

    /// Populated the same way whatever the verdict
    pub fn state(&self) -> &BeforeExecutionState {
        match self {
            CachingState::Enabled { state, .. } | CachingState::Disabled { state, .. } => state,
        }
    }

    pub fn reasons(&self) -> &[DisabledReason] {
        match self {
            CachingState::Enabled { .. } => &[],
            CachingState::Disabled { reasons, .. } => reasons,
        }
    }

    pub fn primary_reason(&self) -> Option<&DisabledReason> {
        self.reasons().first()
    }
}

/// Output roots declared by the tasks of one build
#[derive(Debug, Default)]
pub struct OutputRegistry {
    roots: Mutex<Vec<(TaskPath, String, PathBuf)>>,
}

/// Another task's output root clashing with one of ours
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputOverlap {
    pub property_name: String,
    pub path: PathBuf,
    pub other_task: TaskPath,
}

impl OutputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the output roots of `task`, replacing earlier registrations
    pub fn register(&self, task: &TaskPath, properties: &TaskProperties) {
        let mut roots = self.roots.lock().unwrap_or_else(PoisonError::into_inner);
        roots.retain(|(owner, _, _)| owner != task);
        for property in &properties.outputs {
            if let Some(value) = property.files() {
                for root in value.roots() {
                    roots.push((task.clone(), property.name().to_string(), root.to_path_buf()));
                }
            }
        }
    }

    /// First output root of `task` that equals, contains, or lies inside another task's
    pub fn find_overlap(&self, task: &TaskPath) -> Option<OutputOverlap> {
        let roots = self.roots.lock().unwrap_or_else(PoisonError::into_inner);
        let (ours, theirs): (Vec<_>, Vec<_>) = roots.iter().partition(|(owner, _, _)| owner == task);
        ours.iter().find_map(|(_, property, path)| {
            theirs
                .iter()
                .find(|(_, _, other)| overlaps(path, other))
                .map(|(other_task, _, other)| OutputOverlap {
                    property_name: property.clone(),
                    path: other.clone(),
                    other_task: other_task.clone(),
                })
        })
    }
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Decides whether a task's outputs may be cached and under which key
pub struct CachingStateResolver<'a> {
    config: &'a BuildCacheConfig,
    outputs: &'a OutputRegistry,
}

impl<'a> CachingStateResolver<'a> {
    pub fn new(config: &'a BuildCacheConfig, outputs: &'a OutputRegistry) -> Self {
        Self { config, outputs }
    }

    #[instrument(skip_all, fields(task = %task.path()))]
    pub fn resolve(
        &self,
        task: &Task,
        properties: &TaskProperties,
        state: BeforeExecutionState,
    ) -> CachingState {
        let reasons = self.disabled_reasons(task, properties, &state);
        if !reasons.is_empty() {
            info!(
                category = ?reasons[0].category,
                reason = %reasons[0].description,
                "caching disabled"
            );
            return CachingState::Disabled {
                reasons,
                state,
            };
        }

        match cache_key(&state, properties) {
            Some(key) => {
                if self.config.debug_logging {
                    info!(key = %key, "build cache key calculated");
                } else {
                    debug!(key = %key, "build cache key calculated");
                }
                CachingState::Enabled { key, state }
            }
            None => CachingState::Disabled {
                reasons: vec![DisabledReason::new(
                    DisabledReasonCategory::Unknown,
                    "Cacheability was not determined",
                )],
                state,
            },
        }
    }

    fn disabled_reasons(
        &self,
        task: &Task,
        properties: &TaskProperties,
        state: &BeforeExecutionState,
    ) -> Vec<DisabledReason> {
        use DisabledReasonCategory::*;

        let mut reasons = Vec::new();
        if !self.config.enabled {
            reasons.push(DisabledReason::new(BuildCacheDisabled, "Build cache is disabled"));
        }
        if !task.is_cacheable() {
            reasons.push(DisabledReason::new(
                NotEnabledForTask,
                "Caching has not been enabled for the task",
            ));
        }
        if !properties.has_declared_outputs() {
            reasons.push(DisabledReason::new(NoOutputsDeclared, "No outputs declared"));
        }
        for output in &properties.outputs {
            if output.files().is_some_and(FileValue::is_tree) {
                reasons.push(DisabledReason::new(
                    NonCacheableTreeOutput,
                    format!("Output property '{}' contains a file tree", output.name()),
                ));
            }
        }
        for predicate in task.outputs().cache_if_predicates() {
            if !predicate.evaluate(task) {
                reasons.push(DisabledReason::new(
                    CacheIfSpecNotSatisfied,
                    format!("'{}' not satisfied", predicate.description),
                ));
            }
        }
        for predicate in task.outputs().do_not_cache_if_predicates() {
            if predicate.evaluate(task) {
                reasons.push(DisabledReason::new(
                    DoNotCacheIfSpecSatisfied,
                    format!("'{}' satisfied", predicate.description),
                ));
            }
        }
        if let Some(overlap) = self.outputs.find_overlap(task.path()) {
            reasons.push(DisabledReason::new(
                OverlappingOutputs,
                format!(
                    "Output property '{}' overlaps with the outputs of task '{}' at '{}'",
                    overlap.property_name,
                    overlap.other_task,
                    overlap.path.display()
                ),
            ));
        }
        if let Some(reason) = state.implementation.non_cacheable_reason("Task implementation") {
            reasons.push(DisabledReason::new(NonCacheableTaskImplementation, reason));
        }
        for action in &state.additional_implementations {
            if let Some(reason) = action.non_cacheable_reason("Task action") {
                reasons.push(DisabledReason::new(NonCacheableTaskAction, reason));
            }
        }
        if !state.non_cacheable_inputs.is_empty() {
            let details = state
                .non_cacheable_inputs
                .iter()
                .map(|(name, type_name)| {
                    format!(
                        "property '{}' was loaded with an unknown loader (type '{}')",
                        name, type_name
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            reasons.push(DisabledReason::new(
                NonCacheableInputs,
                format!("Non-cacheable inputs: {}.", details),
            ));
        }
        if properties.validation.has_errors() {
            reasons.push(DisabledReason::new(
                Unknown,
                "Cacheability was not determined: the task has validation errors",
            ));
        }
        reasons
    }
}

/// Derive the cache key; `None` if some implementation cannot be hashed
pub fn cache_key(state: &BeforeExecutionState, properties: &TaskProperties) -> Option<HashCode> {
    let mut hasher = Hasher::new();
    hasher.put_str("kiln-cache-key/1");
    hasher.put_hash(&state.implementation.hash()?);

    hasher.put_usize(state.additional_implementations.len());
    for action in &state.additional_implementations {
        hasher.put_hash(&action.hash()?);
    }

    hasher.put_usize(state.input_value_hashes.len());
    for (name, hash) in &state.input_value_hashes {
        hasher.put_str(name).put_hash(hash);
    }

    hasher.put_usize(state.input_file_fingerprints.len());
    for (name, fingerprint) in &state.input_file_fingerprints {
        hasher
            .put_str(name)
            .put_str(fingerprint.normalizer.identifier())
            .put_hash(&fingerprint.hash);
    }

    hasher.put_usize(properties.outputs.len());
    for output in &properties.outputs {
        hasher.put_str(output.name());
    }
    Some(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{FileTree, Normalizer};
    use crate::schema::SchemaRegistry;
    use crate::snapshotter::StaticSnapshotter;
    use crate::task::{core_loader, TaskAction};
    use crate::walker::walk_properties;

    fn path(p: &str) -> TaskPath {
        TaskPath::parse(p).unwrap()
    }

    fn snapshotter() -> StaticSnapshotter {
        StaticSnapshotter::new().with(FileSystemLocationSnapshot::directory(
            "/w/src",
            vec![FileSystemLocationSnapshot::file("/w/src/a.txt", HashCode::of(b"a"))],
        ))
    }

    fn cacheable_task(name: &str, output: &str) -> Task {
        let mut task = Task::ad_hoc(path(name));
        task.set_cacheable(true).unwrap();
        task.inputs_mut()
            .unwrap()
            .dir(Some(FileValue::path("/w/src")))
            .with_property_name("src")
            .normalizer(Normalizer::RelativePath);
        task.inputs_mut()
            .unwrap()
            .property(Some("release".into()))
            .with_property_name("mode");
        task.outputs_mut()
            .unwrap()
            .dir(Some(FileValue::path(output)))
            .with_property_name("out");
        task.add_action(TaskAction::new(
            "compile",
            Implementation::new("CompileAction", core_loader()),
        ))
        .unwrap();
        task
    }

    fn resolve_with(task: &Task, config: &BuildCacheConfig, outputs: &OutputRegistry) -> CachingState {
        let properties = walk_properties(task, &SchemaRegistry::new()).unwrap();
        let state = BeforeExecutionState::capture(task, &properties, &snapshotter()).unwrap();
        CachingStateResolver::new(config, outputs).resolve(task, &properties, state)
    }

    fn resolve(task: &Task) -> CachingState {
        resolve_with(task, &BuildCacheConfig::default(), &OutputRegistry::new())
    }

    fn categories(state: &CachingState) -> Vec<DisabledReasonCategory> {
        state.reasons().iter().map(|r| r.category).collect()
    }

    #[test]
    fn test_enabled_key_is_stable() {
        let first = resolve(&cacheable_task(":a", "/w/out"));
        let second = resolve(&cacheable_task(":a", "/w/out"));
        assert!(first.is_enabled());
        assert_eq!(first.key(), second.key());
    }

    #[test]
    fn test_disabled_state_keeps_fingerprints() {
        let mut task = cacheable_task(":a", "/w/out");
        task.set_cacheable(false).unwrap();
        let state = resolve(&task);
        assert!(!state.is_enabled());
        assert_eq!(state.key(), None);

        let src = &state.state().input_file_fingerprints["src"];
        let paths: Vec<_> = src.entries.iter().map(|e| e.normalized_path.as_str()).collect();
        assert_eq!(paths, vec!["", "a.txt"]);
        assert!(state.state().input_value_hashes.contains_key("mode"));
    }

    #[test]
    fn test_key_changes_with_inputs() {
        let base = resolve(&cacheable_task(":a", "/w/out")).key();
        let mut task = cacheable_task(":a", "/w/out");
        task.inputs_mut()
            .unwrap()
            .property(Some(1.into()))
            .with_property_name("extra");
        assert_ne!(resolve(&task).key(), base);
    }

    #[test]
    fn test_disabled_build_cache_collects_all_reasons() {
        let mut task = Task::ad_hoc(path(":t"));
        task.add_action(TaskAction::new("run", Implementation::untracked("Script")))
            .unwrap();
        let config = BuildCacheConfig {
            enabled: false,
            debug_logging: false,
        };
        let state = resolve_with(&task, &config, &OutputRegistry::new());
        assert_eq!(
            categories(&state),
            vec![
                DisabledReasonCategory::BuildCacheDisabled,
                DisabledReasonCategory::NotEnabledForTask,
                DisabledReasonCategory::NoOutputsDeclared,
                DisabledReasonCategory::NonCacheableTaskAction,
            ]
        );
        assert_eq!(
            state.primary_reason().unwrap().category,
            DisabledReasonCategory::BuildCacheDisabled
        );
    }

    #[test]
    fn test_untracked_action_keeps_fingerprints() {
        let mut task = cacheable_task(":a", "/w/out");
        task.add_action(TaskAction::new("extra", Implementation::untracked("Extra")))
            .unwrap();
        let state = resolve(&task);
        assert_eq!(categories(&state), vec![DisabledReasonCategory::NonCacheableTaskAction]);
        let before = state.state();
        assert_eq!(before.input_file_fingerprints["src"].entries.len(), 2);
    }

    #[test]
    fn test_tree_output_and_predicates() {
        let mut task = cacheable_task(":a", "/w/out");
        task.outputs_mut()
            .unwrap()
            .files(Some(FileValue::Tree(FileTree::new("/w/tree"))))
            .with_property_name("tree");
        task.outputs_mut()
            .unwrap()
            .cache_if("never", |_| false)
            .do_not_cache_if("always", |_| true);
        let state = resolve(&task);
        assert_eq!(
            categories(&state),
            vec![
                DisabledReasonCategory::NonCacheableTreeOutput,
                DisabledReasonCategory::CacheIfSpecNotSatisfied,
                DisabledReasonCategory::DoNotCacheIfSpecSatisfied,
            ]
        );
        assert_eq!(state.reasons()[1].description, "'never' not satisfied");
    }

    #[test]
    fn test_overlapping_outputs() {
        let registry = OutputRegistry::new();
        let a = cacheable_task(":a", "/w/out");
        let b = cacheable_task(":b", "/w/out/nested");
        let schemas = SchemaRegistry::new();
        registry.register(a.path(), &walk_properties(&a, &schemas).unwrap());
        registry.register(b.path(), &walk_properties(&b, &schemas).unwrap());

        let state = resolve_with(&a, &BuildCacheConfig::default(), &registry);
        assert_eq!(categories(&state), vec![DisabledReasonCategory::OverlappingOutputs]);
        assert!(state.reasons()[0].description.contains("':b'"));
    }

    #[test]
    fn test_non_cacheable_input_value() {
        let mut task = cacheable_task(":a", "/w/out");
        task.inputs_mut()
            .unwrap()
            .property(Some(PropertyValue::Object {
                implementation: Implementation::untracked("Custom"),
                state: vec![],
            }))
            .with_property_name("custom");
        let state = resolve(&task);
        assert_eq!(categories(&state), vec![DisabledReasonCategory::NonCacheableInputs]);
        assert_eq!(
            state.reasons()[0].description,
            "Non-cacheable inputs: property 'custom' was loaded with an unknown loader (type 'Custom')."
        );
    }

    #[test]
    fn test_category_serialization() {
        let json = serde_json::to_string(&DisabledReasonCategory::CacheIfSpecNotSatisfied).unwrap();
        assert_eq!(json, "\"CACHE_IF_SPEC_NOT_SATISFIED\"");
    }
}
