//! Kiln Manifest - tasks declared in a JSON file
//!
//! Features:
//! - Every declaration goes through the runtime task API
//! - Relative paths resolved against the manifest's directory
//! - Dependency notations taken from untyped JSON values
//! - `lazy` tasks registered, built only when first needed
//!
//! ```json
//! {
//!   "tasks": [
//!     {
//!       "path": ":compile",
//!       "type": "Compile",
//!       "cacheable": true,
//!       "inputs": [
//!         { "name": "src", "kind": "dir", "path": "src", "normalizer": "RELATIVE_PATH" },
//!         { "name": "mode", "value": "release" }
//!       ],
//!       "outputs": [{ "name": "out", "kind": "dir", "path": "build/out" }],
//!       "depends_on": ["generate"]
//!     }
//!   ]
//! }
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::container::TaskContainer;
use crate::dependency::DependencyNotation;
use crate::error::{ManifestError, TaskError};
use crate::hasher::HashCode;
use crate::metrics::BuildMetrics;
use crate::property::{DirectorySensitivity, FileTree, FileValue, LineEndingSensitivity, Normalizer};
use crate::task::{DefaultTask, DependencyKind, RuntimeProperty, Task, TaskAction, TaskPath};
use crate::value::{Implementation, PropertyValue};

const MANIFEST_LOADER: &str = "kiln-manifest";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub tasks: Vec<TaskManifest>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    #[default]
    Value,
    File,
    Dir,
    Files,
}

/// Type identity of a task or action
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImplementationManifest {
    #[serde(rename = "type")]
    pub type_name: Option<String>,
    /// Loader name; defaults to the manifest itself
    pub loader: Option<String>,
    pub untracked: bool,
    pub anonymous: bool,
}

impl ImplementationManifest {
    fn resolve(&self, default_type: &str) -> Implementation {
        let type_name = self.type_name.as_deref().unwrap_or(default_type);
        let loader = HashCode::of(self.loader.as_deref().unwrap_or(MANIFEST_LOADER));
        if self.untracked {
            Implementation::untracked(type_name)
        } else if self.anonymous {
            Implementation::anonymous(type_name, loader)
        } else {
            Implementation::new(type_name, loader)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ActionManifest {
    pub name: String,
    #[serde(flatten)]
    pub implementation: ImplementationManifest,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PropertyManifest {
    pub name: Option<String>,
    pub kind: PropertyKind,
    pub value: Option<serde_json::Value>,
    pub path: Option<PathBuf>,
    pub paths: Vec<PathBuf>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub normalizer: Normalizer,
    pub directory_sensitivity: DirectorySensitivity,
    pub line_endings: LineEndingSensitivity,
    pub optional: bool,
    pub skip_when_empty: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TaskManifest {
    pub path: String,
    #[serde(flatten)]
    pub implementation: ImplementationManifest,
    pub cacheable: bool,
    pub lazy: bool,
    pub actions: Vec<ActionManifest>,
    pub inputs: Vec<PropertyManifest>,
    pub outputs: Vec<PropertyManifest>,
    pub destroys: Vec<PathBuf>,
    pub local_state: Vec<PathBuf>,
    pub depends_on: Vec<serde_json::Value>,
    pub must_run_after: Vec<serde_json::Value>,
    pub should_run_after: Vec<serde_json::Value>,
    pub finalized_by: Vec<serde_json::Value>,
}

/// A property with paths resolved and patterns compiled
#[derive(Debug, Clone)]
struct PropertyDefinition {
    name: Option<String>,
    kind: PropertyKind,
    value: Option<PropertyValue>,
    files: Option<FileValue>,
    normalizer: Normalizer,
    directory_sensitivity: DirectorySensitivity,
    line_endings: LineEndingSensitivity,
    optional: bool,
    skip_when_empty: bool,
}

impl PropertyDefinition {
    fn apply(&self, property: &mut RuntimeProperty) {
        if let Some(name) = &self.name {
            property.with_property_name(name.clone());
        }
        property
            .optional(self.optional)
            .normalizer(self.normalizer)
            .directory_sensitivity(self.directory_sensitivity)
            .line_endings(self.line_endings);
        if self.skip_when_empty {
            property.skip_when_empty();
        }
    }
}

/// Everything needed to build one task
#[derive(Clone)]
struct TaskDefinition {
    implementation: Implementation,
    cacheable: bool,
    actions: Vec<TaskAction>,
    inputs: Vec<PropertyDefinition>,
    outputs: Vec<PropertyDefinition>,
    destroys: Vec<FileValue>,
    local_state: Vec<FileValue>,
    dependencies: Vec<(DependencyKind, Vec<DependencyNotation>)>,
}

impl TaskDefinition {
    fn build(&self, path: TaskPath) -> Result<Task, TaskError> {
        let mut task = Task::new(path, Arc::new(DefaultTask), self.implementation.clone());
        task.set_cacheable(self.cacheable)?;
        for action in &self.actions {
            task.add_action(action.clone())?;
        }

        let inputs = task.inputs_mut()?;
        for input in &self.inputs {
            let property = match input.kind {
                PropertyKind::Value => inputs.property(input.value.clone()),
                PropertyKind::File => inputs.file(input.files.clone()),
                PropertyKind::Dir => inputs.dir(input.files.clone()),
                PropertyKind::Files => inputs.files(input.files.clone()),
            };
            input.apply(property);
        }

        let outputs = task.outputs_mut()?;
        for output in &self.outputs {
            let property = match output.kind {
                PropertyKind::Dir => outputs.dir(output.files.clone()),
                PropertyKind::Files => outputs.files(output.files.clone()),
                PropertyKind::File | PropertyKind::Value => outputs.file(output.files.clone()),
            };
            output.apply(property);
        }

        for value in &self.destroys {
            task.destroyables_mut()?.register(value.clone());
        }
        for value in &self.local_state {
            task.local_state_mut()?.register(value.clone());
        }
        for (kind, notations) in &self.dependencies {
            let dependency = task.dependency_mut(*kind)?;
            for notation in notations {
                dependency.add(notation.clone());
            }
        }
        Ok(task)
    }
}

fn absolute(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl PropertyManifest {
    fn resolve(&self, task: &str, base: &Path, output: bool) -> Result<PropertyDefinition, ManifestError> {
        if output && self.kind == PropertyKind::Value {
            return Err(ManifestError::Invalid {
                task: task.to_string(),
                message: format!(
                    "output '{}' must be a file, dir or files property",
                    self.name.as_deref().unwrap_or("<unnamed>")
                ),
            });
        }
        let files = self.file_value(task, base)?;
        if self.kind == PropertyKind::Value && files.is_some() {
            return Err(ManifestError::Invalid {
                task: task.to_string(),
                message: format!(
                    "value property '{}' cannot declare paths",
                    self.name.as_deref().unwrap_or("<unnamed>")
                ),
            });
        }
        Ok(PropertyDefinition {
            name: self.name.clone(),
            kind: self.kind.clone(),
            value: self.value.clone().map(PropertyValue::from),
            files,
            normalizer: self.normalizer,
            directory_sensitivity: self.directory_sensitivity,
            line_endings: self.line_endings,
            optional: self.optional,
            skip_when_empty: self.skip_when_empty,
        })
    }

    fn file_value(&self, task: &str, base: &Path) -> Result<Option<FileValue>, ManifestError> {
        let mut roots: Vec<PathBuf> = self
            .path
            .iter()
            .chain(&self.paths)
            .map(|path| absolute(base, path))
            .collect();

        if self.include.is_empty() && self.exclude.is_empty() {
            return Ok(match roots.len() {
                0 => None,
                1 => roots.pop().map(FileValue::Path),
                _ => Some(FileValue::Paths(roots)),
            });
        }

        let [root] = roots.as_slice() else {
            return Err(ManifestError::Invalid {
                task: task.to_string(),
                message: "include/exclude patterns need exactly one root path".to_string(),
            });
        };
        let pattern_err = |pattern: &String| {
            let task = task.to_string();
            let pattern = pattern.clone();
            move |source: glob::PatternError| ManifestError::Pattern {
                task,
                pattern,
                source,
            }
        };
        let mut tree = FileTree::new(root.clone());
        for pattern in &self.include {
            tree = tree.include(pattern).map_err(pattern_err(pattern))?;
        }
        for pattern in &self.exclude {
            tree = tree.exclude(pattern).map_err(pattern_err(pattern))?;
        }
        Ok(Some(FileValue::Tree(tree)))
    }
}

impl TaskManifest {
    fn resolve(&self, base: &Path) -> Result<(TaskPath, TaskDefinition), ManifestError> {
        let path = TaskPath::parse(&self.path)?;
        let name = path.to_string();

        let actions = self
            .actions
            .iter()
            .map(|action| {
                TaskAction::new(
                    action.name.clone(),
                    action.implementation.resolve(&action.name),
                )
            })
            .collect();
        let inputs = self
            .inputs
            .iter()
            .map(|input| input.resolve(&name, base, false))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = self
            .outputs
            .iter()
            .map(|output| output.resolve(&name, base, true))
            .collect::<Result<Vec<_>, _>>()?;
        let files = |paths: &[PathBuf]| -> Vec<FileValue> {
            paths
                .iter()
                .map(|path| FileValue::Path(absolute(base, path)))
                .collect()
        };
        let notations = |values: &[serde_json::Value]| -> Vec<DependencyNotation> {
            values.iter().cloned().map(DependencyNotation::from).collect()
        };

        let definition = TaskDefinition {
            implementation: self.implementation.resolve("kiln::DefaultTask"),
            cacheable: self.cacheable,
            actions,
            inputs,
            outputs,
            destroys: files(&self.destroys),
            local_state: files(&self.local_state),
            dependencies: vec![
                (DependencyKind::DependsOn, notations(&self.depends_on)),
                (DependencyKind::MustRunAfter, notations(&self.must_run_after)),
                (DependencyKind::ShouldRunAfter, notations(&self.should_run_after)),
                (DependencyKind::FinalizedBy, notations(&self.finalized_by)),
            ],
        };
        Ok((path, definition))
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build a container; relative paths are resolved against `base`
    #[instrument(skip_all, fields(tasks = self.tasks.len()))]
    pub fn into_container(
        self,
        base: &Path,
        metrics: Arc<BuildMetrics>,
    ) -> Result<TaskContainer, ManifestError> {
        let mut container = TaskContainer::new(metrics);
        for task in &self.tasks {
            let (path, definition) = task.resolve(base)?;
            if task.lazy {
                container.register(path, move |path| definition.build(path))?;
            } else {
                container.create(definition.build(path)?)?;
            }
        }
        debug!(tasks = container.len(), "manifest loaded");
        Ok(container)
    }
}
