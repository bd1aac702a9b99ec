//! Dependency notations and their resolution into concrete task sets
//!
//! Notations are a closed set of variants. Resolution walks them with an
//! explicit stack; shared sub-expressions are expanded once per call and a
//! notation that reaches itself is reported as a cycle.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::DependencyError;
use crate::task::{Task, TaskPath};

/// Lookup of the tasks known to the build, used to resolve references
pub trait TaskLookup {
    /// Resolve `reference` relative to the project owning `owner`
    fn resolve_path(&self, owner: &TaskPath, reference: &str) -> Option<TaskPath>;

    /// Every known task path, registered or realized
    fn task_paths(&self) -> Vec<TaskPath>;
}

/// A set of tasks selected by an expression over all known tasks
pub trait TaskSet: Send + Sync {
    fn describe(&self) -> String;

    fn select(&self, lookup: &dyn TaskLookup) -> Vec<TaskPath>;
}

/// Something built by tasks, e.g. a file collection produced by them
pub trait Buildable: Send + Sync {
    fn describe(&self) -> String;

    fn build_dependencies(&self) -> Vec<DependencyNotation>;
}

pub type LazyDependency = Arc<dyn Fn(&Task) -> DependencyNotation + Send + Sync>;

#[derive(Clone)]
pub enum DependencyNotation {
    Task(TaskPath),
    TaskSet(Arc<dyn TaskSet>),
    Buildable(Arc<dyn Buildable>),
    /// Evaluated against the owning task only when dependencies are resolved
    Lazy(LazyDependency),
    /// Task path, absolute or relative to the owning project
    Path(String),
    Collection(Arc<Vec<DependencyNotation>>),
    Map(Arc<BTreeMap<String, DependencyNotation>>),
    Array(Arc<Vec<DependencyNotation>>),
    /// A value of a kind that cannot name tasks
    Unsupported { kind: String },
}

impl DependencyNotation {
    pub fn lazy<F>(f: F) -> Self
    where
        F: Fn(&Task) -> DependencyNotation + Send + Sync + 'static,
    {
        DependencyNotation::Lazy(Arc::new(f))
    }

    pub fn collection(items: impl IntoIterator<Item = DependencyNotation>) -> Self {
        DependencyNotation::Collection(Arc::new(items.into_iter().collect()))
    }

    /// Identity of composite notations; leaves have none
    fn identity(&self) -> Option<usize> {
        match self {
            DependencyNotation::TaskSet(set) => Some(Arc::as_ptr(set) as *const () as usize),
            DependencyNotation::Buildable(b) => Some(Arc::as_ptr(b) as *const () as usize),
            DependencyNotation::Lazy(f) => Some(Arc::as_ptr(f) as *const () as usize),
            DependencyNotation::Collection(items) | DependencyNotation::Array(items) => {
                Some(Arc::as_ptr(items) as usize)
            }
            DependencyNotation::Map(entries) => Some(Arc::as_ptr(entries) as usize),
            DependencyNotation::Task(_)
            | DependencyNotation::Path(_)
            | DependencyNotation::Unsupported { .. } => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            DependencyNotation::Task(path) => format!("task '{}'", path),
            DependencyNotation::TaskSet(set) => set.describe(),
            DependencyNotation::Buildable(b) => b.describe(),
            DependencyNotation::Lazy(_) => "lazy dependency expression".to_string(),
            DependencyNotation::Path(path) => format!("path '{}'", path),
            DependencyNotation::Collection(items) => format!("collection of {} items", items.len()),
            DependencyNotation::Map(entries) => format!("map of {} entries", entries.len()),
            DependencyNotation::Array(items) => format!("array of {} items", items.len()),
            DependencyNotation::Unsupported { kind } => kind.clone(),
        }
    }
}

impl fmt::Debug for DependencyNotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DependencyNotation({})", self.describe())
    }
}

impl From<TaskPath> for DependencyNotation {
    fn from(path: TaskPath) -> Self {
        DependencyNotation::Task(path)
    }
}

impl From<&TaskPath> for DependencyNotation {
    fn from(path: &TaskPath) -> Self {
        DependencyNotation::Task(path.clone())
    }
}

impl From<&str> for DependencyNotation {
    fn from(path: &str) -> Self {
        DependencyNotation::Path(path.to_string())
    }
}

impl From<String> for DependencyNotation {
    fn from(path: String) -> Self {
        DependencyNotation::Path(path)
    }
}

impl From<Vec<DependencyNotation>> for DependencyNotation {
    fn from(items: Vec<DependencyNotation>) -> Self {
        DependencyNotation::Collection(Arc::new(items))
    }
}

/// Untyped data: strings are paths, arrays and objects nest, anything else
/// is unsupported
impl From<serde_json::Value> for DependencyNotation {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::String(path) => DependencyNotation::Path(path),
            Value::Array(items) => DependencyNotation::Array(Arc::new(
                items.into_iter().map(DependencyNotation::from).collect(),
            )),
            Value::Object(entries) => DependencyNotation::Map(Arc::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, DependencyNotation::from(v)))
                    .collect(),
            )),
            Value::Number(n) => DependencyNotation::Unsupported {
                kind: format!("a number ({})", n),
            },
            Value::Bool(b) => DependencyNotation::Unsupported {
                kind: format!("a boolean ({})", b),
            },
            Value::Null => DependencyNotation::Unsupported {
                kind: "null".to_string(),
            },
        }
    }
}

/// Selects every task with the given name, in any project
#[derive(Debug, Clone)]
pub struct NamedTasks(pub String);

impl TaskSet for NamedTasks {
    fn describe(&self) -> String {
        format!("all tasks named '{}'", self.0)
    }

    fn select(&self, lookup: &dyn TaskLookup) -> Vec<TaskPath> {
        lookup
            .task_paths()
            .into_iter()
            .filter(|path| path.name() == self.0)
            .collect()
    }
}

/// An artifact and the notations naming the tasks that build it
#[derive(Debug, Clone)]
pub struct BuiltArtifact {
    pub name: String,
    pub built_by: Vec<DependencyNotation>,
}

impl Buildable for BuiltArtifact {
    fn describe(&self) -> String {
        format!("artifact '{}'", self.name)
    }

    fn build_dependencies(&self) -> Vec<DependencyNotation> {
        self.built_by.clone()
    }
}

/// Ordered notations of one dependency relation
#[derive(Debug, Clone, Default)]
pub struct TaskDependency {
    notations: Vec<DependencyNotation>,
}

impl TaskDependency {
    pub fn add(&mut self, notation: DependencyNotation) -> &mut Self {
        self.notations.push(notation);
        self
    }

    pub fn set(&mut self, notations: Vec<DependencyNotation>) {
        self.notations = notations;
    }

    pub fn clear(&mut self) {
        self.notations.clear();
    }

    pub fn notations(&self) -> &[DependencyNotation] {
        &self.notations
    }

    pub fn is_empty(&self) -> bool {
        self.notations.is_empty()
    }
}

enum Frame {
    Enter(DependencyNotation),
    Exit(usize),
}

/// Resolves one task's notations into the set of tasks they name
pub struct DependencyResolver<'a> {
    lookup: &'a dyn TaskLookup,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(lookup: &'a dyn TaskLookup) -> Self {
        Self { lookup }
    }

    #[instrument(skip_all, fields(task = %task.path(), notations = dependency.notations().len()))]
    pub fn resolve(
        &self,
        task: &Task,
        dependency: &TaskDependency,
    ) -> Result<BTreeSet<TaskPath>, DependencyError> {
        let mut resolved = BTreeSet::new();
        let mut in_progress = HashSet::new();
        let mut completed = HashSet::new();
        // Identities are addresses; keep every expanded notation alive until we return
        let mut retained = Vec::new();
        let mut stack: Vec<Frame> = dependency
            .notations()
            .iter()
            .rev()
            .cloned()
            .map(Frame::Enter)
            .collect();

        while let Some(frame) = stack.pop() {
            let notation = match frame {
                Frame::Exit(id) => {
                    in_progress.remove(&id);
                    completed.insert(id);
                    continue;
                }
                Frame::Enter(notation) => notation,
            };

            if let Some(id) = notation.identity() {
                if completed.contains(&id) {
                    continue;
                }
                if !in_progress.insert(id) {
                    return Err(DependencyError::NotationCycle {
                        task: task.path().to_string(),
                        notation: notation.describe(),
                    });
                }
                stack.push(Frame::Exit(id));
                retained.push(notation.clone());
            }

            match notation {
                DependencyNotation::Task(path) => {
                    resolved.insert(path);
                }
                DependencyNotation::Path(reference) => {
                    let path = self
                        .lookup
                        .resolve_path(task.path(), &reference)
                        .ok_or_else(|| DependencyError::UnresolvableReference {
                            task: task.path().to_string(),
                            reference: reference.clone(),
                            project: task.path().project().to_string(),
                        })?;
                    resolved.insert(path);
                }
                DependencyNotation::Lazy(expr) => stack.push(Frame::Enter(expr(task))),
                DependencyNotation::Collection(items) | DependencyNotation::Array(items) => {
                    stack.extend(items.iter().rev().cloned().map(Frame::Enter));
                }
                DependencyNotation::Map(entries) => {
                    stack.extend(entries.values().rev().cloned().map(Frame::Enter));
                }
                DependencyNotation::Buildable(buildable) => {
                    let built_by = buildable.build_dependencies();
                    stack.extend(built_by.into_iter().rev().map(Frame::Enter));
                }
                DependencyNotation::TaskSet(set) => {
                    let selected = set.select(self.lookup);
                    stack.extend(
                        selected
                            .into_iter()
                            .rev()
                            .map(|p| Frame::Enter(DependencyNotation::Task(p))),
                    );
                }
                DependencyNotation::Unsupported { kind } => {
                    return Err(DependencyError::UnsupportedNotation {
                        task: task.path().to_string(),
                        kind,
                    });
                }
            }
        }

        debug!(resolved = resolved.len(), "resolved dependencies");
        Ok(resolved)
    }
}
