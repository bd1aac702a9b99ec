//! Task container: eager creation and lazy registration

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::dependency::TaskLookup;
use crate::error::{DependencyError, TaskError};
use crate::metrics::BuildMetrics;
use crate::task::{Task, TaskPath};

/// Builds a registered task the first time it is needed
pub type TaskFactory = Box<dyn FnOnce(TaskPath) -> Result<Task, TaskError> + Send>;

/// All tasks of a build, keyed by path
pub struct TaskContainer {
    realized: BTreeMap<TaskPath, Box<Task>>,
    registered: BTreeMap<TaskPath, TaskFactory>,
    /// Registered tasks whose factory failed, with the failure message
    failed: BTreeMap<TaskPath, String>,
    metrics: Arc<BuildMetrics>,
}

impl TaskContainer {
    pub fn new(metrics: Arc<BuildMetrics>) -> Self {
        Self {
            realized: BTreeMap::new(),
            registered: BTreeMap::new(),
            failed: BTreeMap::new(),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<BuildMetrics> {
        &self.metrics
    }

    /// Add an already constructed task
    pub fn create(&mut self, task: Task) -> Result<&mut Task, TaskError> {
        let path = task.path().clone();
        if self.contains(&path) {
            return Err(TaskError::DuplicateTask(path.to_string()));
        }
        self.metrics.eager_task(task.bean().type_name());
        debug!(task = %path, "task created");
        Ok(self.realized.entry(path).or_insert(Box::new(task)).as_mut())
    }

    /// Defer construction of a task until it is first realized
    pub fn register<F>(&mut self, path: TaskPath, factory: F) -> Result<(), TaskError>
    where
        F: FnOnce(TaskPath) -> Result<Task, TaskError> + Send + 'static,
    {
        if self.contains(&path) {
            return Err(TaskError::DuplicateTask(path.to_string()));
        }
        self.metrics.lazy_task();
        debug!(task = %path, "task registered");
        self.registered.insert(path, Box::new(factory));
        Ok(())
    }

    pub fn contains(&self, path: &TaskPath) -> bool {
        self.realized.contains_key(path)
            || self.registered.contains_key(path)
            || self.failed.contains_key(path)
    }

    pub fn is_realized(&self, path: &TaskPath) -> bool {
        self.realized.contains_key(path)
    }

    /// Realize `path` if needed and return it
    ///
    /// A factory runs at most once. If it fails, every later lookup of the
    /// path reports the same failure.
    pub fn realize(&mut self, path: &TaskPath) -> Result<&mut Task, DependencyError> {
        if let Some(factory) = self.registered.remove(path) {
            let task = match factory(path.clone()) {
                Ok(task) if task.path() == path => task,
                Ok(task) => {
                    let err = TaskError::InvalidTaskPath {
                        path: task.path().to_string(),
                        reason: "a registered task must be created with its registered path",
                    };
                    return Err(self.record_failure(path, err));
                }
                Err(err) => return Err(self.record_failure(path, err)),
            };
            self.metrics.lazy_task_realized();
            debug!(task = %path, "task realized");
            self.realized.insert(path.clone(), Box::new(task));
        }
        if let Some(message) = self.failed.get(path) {
            return Err(DependencyError::FailedRealization {
                task: path.to_string(),
                message: message.clone(),
            });
        }
        self.realized
            .get_mut(path)
            .map(Box::as_mut)
            .ok_or_else(|| DependencyError::UnknownTask(path.to_string()))
    }

    fn record_failure(&mut self, path: &TaskPath, err: TaskError) -> DependencyError {
        let message = err.to_string();
        warn!(task = %path, error = %message, "task creation failed");
        self.failed.insert(path.clone(), message.clone());
        DependencyError::FailedRealization {
            task: path.to_string(),
            message,
        }
    }

    /// Realize every registered task
    pub fn realize_all(&mut self) -> Result<(), DependencyError> {
        let pending: Vec<TaskPath> = self.registered.keys().cloned().collect();
        for path in pending {
            self.realize(&path)?;
        }
        Ok(())
    }

    /// A realized task; registered-only tasks are not returned
    pub fn get(&self, path: &TaskPath) -> Option<&Task> {
        self.realized.get(path).map(Box::as_ref)
    }

    pub fn get_mut(&mut self, path: &TaskPath) -> Option<&mut Task> {
        self.realized.get_mut(path).map(Box::as_mut)
    }

    /// Every known path, sorted
    pub fn paths(&self) -> Vec<TaskPath> {
        let mut paths: Vec<TaskPath> = self
            .realized
            .keys()
            .chain(self.registered.keys())
            .chain(self.failed.keys())
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.realized.len() + self.registered.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskContainer {
    fn default() -> Self {
        Self::new(Arc::new(BuildMetrics::new()))
    }
}

impl TaskLookup for TaskContainer {
    fn resolve_path(&self, owner: &TaskPath, reference: &str) -> Option<TaskPath> {
        let path = owner.resolve(reference).ok()?;
        self.contains(&path).then_some(path)
    }

    fn task_paths(&self) -> Vec<TaskPath> {
        self.paths()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> TaskPath {
        TaskPath::parse(p).unwrap()
    }

    #[test]
    fn test_create_rejects_duplicates() {
        let mut container = TaskContainer::default();
        container.create(Task::ad_hoc(path(":a"))).unwrap();
        let err = container.create(Task::ad_hoc(path(":a"))).unwrap_err();
        assert_eq!(err.to_string(), "Task with path ':a' already exists.");
        assert!(container.register(path(":a"), |p| Ok(Task::ad_hoc(p))).is_err());
    }

    #[test]
    fn test_register_defers_construction() {
        let metrics = Arc::new(BuildMetrics::new());
        metrics.start();
        let mut container = TaskContainer::new(Arc::clone(&metrics));
        container.create(Task::ad_hoc(path(":eager"))).unwrap();
        container
            .register(path(":lazy"), |p| Ok(Task::ad_hoc(p)))
            .unwrap();

        assert!(container.get(&path(":lazy")).is_none());
        assert!(!container.is_realized(&path(":lazy")));
        assert_eq!(
            container.resolve_path(&path(":eager"), "lazy"),
            Some(path(":lazy"))
        );

        container.realize(&path(":lazy")).unwrap();
        container.realize(&path(":lazy")).unwrap();
        assert!(container.get(&path(":lazy")).is_some());

        let counts = metrics.flush();
        assert_eq!(counts.eager, 1);
        assert_eq!(counts.lazy, 1);
        assert_eq!(counts.lazy_realized, 1);
    }

    #[test]
    fn test_realize_unknown_task() {
        let mut container = TaskContainer::default();
        assert!(matches!(
            container.realize(&path(":missing")),
            Err(DependencyError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_factory_must_keep_path() {
        let mut container = TaskContainer::default();
        container
            .register(path(":a"), |_| Ok(Task::ad_hoc(TaskPath::parse(":b")?)))
            .unwrap();
        assert!(container.realize(&path(":a")).is_err());
        assert!(container.get(&path(":b")).is_none());
        assert!(!container.contains(&path(":b")));
    }

    #[test]
    fn test_failed_factory_is_remembered() {
        let mut container = TaskContainer::default();
        container
            .register(path(":a"), |_| Err(TaskError::DuplicateTask(":x".into())))
            .unwrap();

        let first = container.realize(&path(":a")).unwrap_err().to_string();
        assert_eq!(
            first,
            "Could not create task ':a': Task with path ':x' already exists."
        );
        assert!(container.contains(&path(":a")));
        assert!(!container.is_realized(&path(":a")));

        let second = container.realize(&path(":a")).unwrap_err().to_string();
        assert_eq!(first, second);
        assert!(container.realize_all().is_ok());
        assert_eq!(container.paths(), vec![path(":a")]);
        assert!(container.register(path(":a"), |p| Ok(Task::ad_hoc(p))).is_err());
    }
}
