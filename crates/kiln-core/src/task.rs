//! Tasks and their runtime declaration surface
//!
//! Properties come from two places: the task type's schema (see
//! [`crate::schema`]) and the runtime containers on [`Task`]. Runtime
//! containers and dependency declarations may only be changed while the
//! task is still being configured.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::dependency::{DependencyNotation, TaskDependency};
use crate::error::TaskError;
use crate::hasher::HashCode;
use crate::property::{
    Cardinality, DirectorySensitivity, FileSpec, FileValue, LineEndingSensitivity, Normalizer,
};
use crate::schema::{Bean, Describe, SchemaBuilder};
use crate::value::{Implementation, PropertyValue};

/// Loader hash for types that ship with kiln itself
pub fn core_loader() -> HashCode {
    HashCode::of(concat!("kiln-core/", env!("CARGO_PKG_VERSION")))
}

/// Colon-separated task path, e.g. `:app:compile`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskPath(String);

impl TaskPath {
    /// Parse an absolute path; a bare name is placed in the root project
    pub fn parse(path: &str) -> Result<Self, TaskError> {
        let absolute = if path.starts_with(':') {
            path.to_string()
        } else {
            format!(":{}", path)
        };
        if absolute.len() == 1 {
            return Err(TaskError::InvalidTaskPath {
                path: path.to_string(),
                reason: "a task path needs a task name",
            });
        }
        if absolute[1..].split(':').any(str::is_empty) {
            return Err(TaskError::InvalidTaskPath {
                path: path.to_string(),
                reason: "empty path segment",
            });
        }
        Ok(Self(absolute))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn name(&self) -> &str {
        self.0.rsplit(':').next().unwrap_or_default()
    }

    /// Path of the owning project; `:` for the root project
    pub fn project(&self) -> &str {
        match self.0.rfind(':') {
            Some(0) | None => ":",
            Some(i) => &self.0[..i],
        }
    }

    /// Resolve a reference relative to this task's project
    pub fn resolve(&self, reference: &str) -> Result<TaskPath, TaskError> {
        if reference.starts_with(':') {
            return TaskPath::parse(reference);
        }
        match self.project() {
            ":" => TaskPath::parse(&format!(":{}", reference)),
            project => TaskPath::parse(&format!("{}:{}", project, reference)),
        }
    }
}

impl fmt::Display for TaskPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Configuring,
    Executing,
    Executed,
}

/// An action run as part of the task; its implementation feeds the cache key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAction {
    pub name: String,
    pub implementation: Implementation,
}

impl TaskAction {
    pub fn new(name: impl Into<String>, implementation: Implementation) -> Self {
        Self {
            name: name.into(),
            implementation,
        }
    }
}

/// Current value bound to a property
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    Value(Option<PropertyValue>),
    Files(Option<FileValue>),
}

impl BoundValue {
    pub fn is_present(&self) -> bool {
        match self {
            BoundValue::Value(value) => value.is_some(),
            BoundValue::Files(value) => value.is_some(),
        }
    }
}

/// A property registered through the runtime API
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeProperty {
    pub(crate) name: Option<String>,
    pub(crate) optional: bool,
    pub(crate) file_spec: Option<FileSpec>,
    pub(crate) value: BoundValue,
}

impl RuntimeProperty {
    fn value(value: Option<PropertyValue>) -> Self {
        Self {
            name: None,
            optional: false,
            file_spec: None,
            value: BoundValue::Value(value),
        }
    }

    fn files(spec: FileSpec, value: Option<FileValue>) -> Self {
        Self {
            name: None,
            optional: false,
            file_spec: Some(spec),
            value: BoundValue::Files(value),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn bound_value(&self) -> &BoundValue {
        &self.value
    }

    pub fn with_property_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    pub fn optional(&mut self, optional: bool) -> &mut Self {
        self.optional = optional;
        self
    }

    pub fn normalizer(&mut self, normalizer: Normalizer) -> &mut Self {
        if let Some(spec) = &mut self.file_spec {
            spec.normalizer = normalizer;
        }
        self
    }

    pub fn directory_sensitivity(&mut self, sensitivity: DirectorySensitivity) -> &mut Self {
        if let Some(spec) = &mut self.file_spec {
            spec.directory_sensitivity = sensitivity;
        }
        self
    }

    pub fn line_endings(&mut self, sensitivity: LineEndingSensitivity) -> &mut Self {
        if let Some(spec) = &mut self.file_spec {
            spec.line_ending_sensitivity = sensitivity;
        }
        self
    }

    pub fn skip_when_empty(&mut self) -> &mut Self {
        if let Some(spec) = &mut self.file_spec {
            spec.skip_when_empty = true;
        }
        self
    }
}

fn push(entries: &mut Vec<RuntimeProperty>, property: RuntimeProperty) -> &mut RuntimeProperty {
    entries.push(property);
    let last = entries.len() - 1;
    &mut entries[last]
}

/// Runtime-registered inputs (`property`, `file`, `dir`, `files`)
#[derive(Debug, Clone, Default)]
pub struct TaskInputs {
    entries: Vec<RuntimeProperty>,
}

impl TaskInputs {
    pub fn entries(&self) -> &[RuntimeProperty] {
        &self.entries
    }

    pub fn property(&mut self, value: Option<PropertyValue>) -> &mut RuntimeProperty {
        push(&mut self.entries, RuntimeProperty::value(value))
    }

    pub fn file(&mut self, value: Option<FileValue>) -> &mut RuntimeProperty {
        let spec = FileSpec::input(Cardinality::File);
        push(&mut self.entries, RuntimeProperty::files(spec, value))
    }

    pub fn dir(&mut self, value: Option<FileValue>) -> &mut RuntimeProperty {
        let spec = FileSpec::input(Cardinality::Directory);
        push(&mut self.entries, RuntimeProperty::files(spec, value))
    }

    pub fn files(&mut self, value: Option<FileValue>) -> &mut RuntimeProperty {
        let spec = FileSpec::input(Cardinality::FileCollection);
        push(&mut self.entries, RuntimeProperty::files(spec, value))
    }
}

type CacheCondition = Arc<dyn Fn(&Task) -> bool + Send + Sync>;

/// A user-declared caching condition with its description
#[derive(Clone)]
pub struct CachePredicate {
    pub description: String,
    condition: CacheCondition,
}

impl CachePredicate {
    pub fn new<F>(description: impl Into<String>, condition: F) -> Self
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            condition: Arc::new(condition),
        }
    }

    pub fn evaluate(&self, task: &Task) -> bool {
        (self.condition)(task)
    }
}

impl fmt::Debug for CachePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CachePredicate")
            .field(&self.description)
            .finish()
    }
}

/// Runtime-registered outputs plus caching conditions
#[derive(Debug, Clone, Default)]
pub struct TaskOutputs {
    entries: Vec<RuntimeProperty>,
    cache_if: Vec<CachePredicate>,
    do_not_cache_if: Vec<CachePredicate>,
}

impl TaskOutputs {
    pub fn entries(&self) -> &[RuntimeProperty] {
        &self.entries
    }

    pub fn file(&mut self, value: Option<FileValue>) -> &mut RuntimeProperty {
        let spec = FileSpec::output(Cardinality::File);
        push(&mut self.entries, RuntimeProperty::files(spec, value))
    }

    pub fn dir(&mut self, value: Option<FileValue>) -> &mut RuntimeProperty {
        let spec = FileSpec::output(Cardinality::Directory);
        push(&mut self.entries, RuntimeProperty::files(spec, value))
    }

    pub fn files(&mut self, value: Option<FileValue>) -> &mut RuntimeProperty {
        let spec = FileSpec::output(Cardinality::FileCollection);
        push(&mut self.entries, RuntimeProperty::files(spec, value))
    }

    pub fn cache_if<F>(&mut self, description: &str, condition: F) -> &mut Self
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        self.cache_if.push(CachePredicate::new(description, condition));
        self
    }

    pub fn do_not_cache_if<F>(&mut self, description: &str, condition: F) -> &mut Self
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        self.do_not_cache_if
            .push(CachePredicate::new(description, condition));
        self
    }

    pub fn cache_if_predicates(&self) -> &[CachePredicate] {
        &self.cache_if
    }

    pub fn do_not_cache_if_predicates(&self) -> &[CachePredicate] {
        &self.do_not_cache_if
    }
}

/// Destroyables and local state: unnamed file registrations
#[derive(Debug, Clone, Default)]
pub struct TaskFiles {
    entries: Vec<RuntimeProperty>,
}

impl TaskFiles {
    pub fn entries(&self) -> &[RuntimeProperty] {
        &self.entries
    }

    pub fn register(&mut self, value: FileValue) -> &mut RuntimeProperty {
        let spec = FileSpec::output(Cardinality::FileCollection);
        push(&mut self.entries, RuntimeProperty::files(spec, Some(value)))
    }
}

/// The four dependency relations a task can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    DependsOn,
    MustRunAfter,
    ShouldRunAfter,
    FinalizedBy,
}

impl DependencyKind {
    pub const ALL: [DependencyKind; 4] = [
        DependencyKind::DependsOn,
        DependencyKind::MustRunAfter,
        DependencyKind::ShouldRunAfter,
        DependencyKind::FinalizedBy,
    ];

    fn operation(&self) -> &'static str {
        match self {
            DependencyKind::DependsOn => "add task dependencies",
            DependencyKind::MustRunAfter => "add must-run-after constraints",
            DependencyKind::ShouldRunAfter => "add should-run-after constraints",
            DependencyKind::FinalizedBy => "add finalizers",
        }
    }
}

/// Task type with no declared properties of its own
#[derive(Debug, Default)]
pub struct DefaultTask;

impl Describe for DefaultTask {
    fn describe(_schema: &mut SchemaBuilder<Self>) {}
}

pub struct Task {
    path: TaskPath,
    bean: Arc<dyn Bean>,
    implementation: Implementation,
    actions: Vec<TaskAction>,
    inputs: TaskInputs,
    outputs: TaskOutputs,
    destroyables: TaskFiles,
    local_state: TaskFiles,
    dependencies: [TaskDependency; 4],
    cacheable: bool,
    state: ExecutionState,
}

impl Task {
    pub fn new(path: TaskPath, bean: Arc<dyn Bean>, implementation: Implementation) -> Self {
        Self {
            path,
            bean,
            implementation,
            actions: Vec::new(),
            inputs: TaskInputs::default(),
            outputs: TaskOutputs::default(),
            destroyables: TaskFiles::default(),
            local_state: TaskFiles::default(),
            dependencies: Default::default(),
            cacheable: false,
            state: ExecutionState::Configuring,
        }
    }

    /// Task backed by [`DefaultTask`], configured only through the runtime API
    pub fn ad_hoc(path: TaskPath) -> Self {
        Self::new(
            path,
            Arc::new(DefaultTask),
            Implementation::new("kiln::DefaultTask", core_loader()),
        )
    }

    pub fn path(&self) -> &TaskPath {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.path.name()
    }

    pub fn bean(&self) -> &Arc<dyn Bean> {
        &self.bean
    }

    pub fn implementation(&self) -> &Implementation {
        &self.implementation
    }

    pub fn actions(&self) -> &[TaskAction] {
        &self.actions
    }

    pub fn inputs(&self) -> &TaskInputs {
        &self.inputs
    }

    pub fn outputs(&self) -> &TaskOutputs {
        &self.outputs
    }

    pub fn destroyables(&self) -> &TaskFiles {
        &self.destroyables
    }

    pub fn local_state(&self) -> &TaskFiles {
        &self.local_state
    }

    pub fn dependency(&self, kind: DependencyKind) -> &TaskDependency {
        &self.dependencies[kind as usize]
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    fn ensure_configuring(&self, operation: &str) -> Result<(), TaskError> {
        if self.state == ExecutionState::Configuring {
            Ok(())
        } else {
            Err(TaskError::MutationAfterExecutionStarted {
                task: self.path.to_string(),
                operation: operation.to_string(),
            })
        }
    }

    pub fn inputs_mut(&mut self) -> Result<&mut TaskInputs, TaskError> {
        self.ensure_configuring("register inputs")?;
        Ok(&mut self.inputs)
    }

    pub fn outputs_mut(&mut self) -> Result<&mut TaskOutputs, TaskError> {
        self.ensure_configuring("register outputs")?;
        Ok(&mut self.outputs)
    }

    pub fn destroyables_mut(&mut self) -> Result<&mut TaskFiles, TaskError> {
        self.ensure_configuring("register destroyables")?;
        Ok(&mut self.destroyables)
    }

    pub fn local_state_mut(&mut self) -> Result<&mut TaskFiles, TaskError> {
        self.ensure_configuring("register local state")?;
        Ok(&mut self.local_state)
    }

    pub fn dependency_mut(&mut self, kind: DependencyKind) -> Result<&mut TaskDependency, TaskError> {
        self.ensure_configuring(kind.operation())?;
        Ok(&mut self.dependencies[kind as usize])
    }

    pub fn depends_on(&mut self, notation: impl Into<DependencyNotation>) -> Result<(), TaskError> {
        self.dependency_mut(DependencyKind::DependsOn)?
            .add(notation.into());
        Ok(())
    }

    pub fn add_action(&mut self, action: TaskAction) -> Result<(), TaskError> {
        self.ensure_configuring("add actions")?;
        self.actions.push(action);
        Ok(())
    }

    pub fn set_cacheable(&mut self, cacheable: bool) -> Result<(), TaskError> {
        self.ensure_configuring("change cacheability")?;
        self.cacheable = cacheable;
        Ok(())
    }

    pub fn start_execution(&mut self) {
        self.state = ExecutionState::Executing;
    }

    pub fn finish_execution(&mut self) {
        self.state = ExecutionState::Executed;
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("path", &self.path)
            .field("type", &self.bean.type_name())
            .field("implementation", &self.implementation)
            .field("actions", &self.actions.len())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> TaskPath {
        TaskPath::parse(p).unwrap()
    }

    #[test]
    fn test_task_path_parts() {
        let nested = path(":app:lib:compile");
        assert_eq!(nested.name(), "compile");
        assert_eq!(nested.project(), ":app:lib");

        let root = path("build");
        assert_eq!(root.as_str(), ":build");
        assert_eq!(root.project(), ":");
    }

    #[test]
    fn test_invalid_task_paths() {
        assert!(TaskPath::parse(":").is_err());
        assert!(TaskPath::parse(":app::compile").is_err());
    }

    #[test]
    fn test_resolve_relative_to_project() {
        assert_eq!(path(":a").resolve("taskD").unwrap(), path(":taskD"));
        assert_eq!(path(":app:a").resolve("b").unwrap(), path(":app:b"));
        assert_eq!(path(":app:a").resolve(":lib:c").unwrap(), path(":lib:c"));
    }

    #[test]
    fn test_runtime_declarations() {
        let mut task = Task::ad_hoc(path(":t"));
        task.inputs_mut()
            .unwrap()
            .dir(Some(FileValue::path("/src")))
            .with_property_name("sources")
            .normalizer(Normalizer::RelativePath);
        task.inputs_mut()
            .unwrap()
            .property(Some(PropertyValue::from(17)));

        let entries = task.inputs().entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name(), Some("sources"));
        assert_eq!(
            entries[0].file_spec.as_ref().unwrap().normalizer,
            Normalizer::RelativePath
        );
        assert_eq!(entries[1].name(), None);
    }

    #[test]
    fn test_mutation_after_execution_started() {
        let mut task = Task::ad_hoc(path(":t"));
        task.start_execution();

        let err = task.inputs_mut().unwrap_err();
        assert!(matches!(err, TaskError::MutationAfterExecutionStarted { .. }));
        assert_eq!(
            err.to_string(),
            "Cannot register inputs for task ':t' after it has started executing."
        );
        assert!(task.depends_on(":other").is_err());
        assert!(task.set_cacheable(true).is_err());
    }

    #[test]
    fn test_cache_predicates_evaluate_against_task() {
        let mut task = Task::ad_hoc(path(":t"));
        task.outputs_mut()
            .unwrap()
            .cache_if("has actions", |t| !t.actions().is_empty());
        let predicate = task.outputs().cache_if_predicates()[0].clone();
        assert!(!predicate.evaluate(&task));
        task.add_action(TaskAction::new("run", Implementation::new("Run", core_loader())))
            .unwrap();
        assert!(predicate.evaluate(&task));
    }
}
