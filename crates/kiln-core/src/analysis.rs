//! Kiln Analysis - per-build context tying the components together
//!
//! Features:
//! - Properties, validation, fingerprints, caching verdict and report in one call
//! - Output roots of every analysed task registered before any verdict
//! - Up-to-date checks and execution recording against the history store

use std::sync::Arc;
use tracing::{info, instrument};

use crate::caching::{BeforeExecutionState, CachingState, CachingStateResolver, OutputRegistry};
use crate::config::KilnConfig;
use crate::error::TaskError;
use crate::history::HistoryStore;
use crate::metrics::BuildMetrics;
use crate::report::TaskInputsReport;
use crate::schema::SchemaRegistry;
use crate::snapshotter::{DiskSnapshotter, Snapshotter};
use crate::task::{Task, TaskPath};
use crate::uptodate::{check_up_to_date, AfterExecutionState, UpToDateVerdict};
use crate::walker::{walk_properties, TaskProperties};

/// Everything derived from one task before it executes
#[derive(Debug)]
pub struct TaskAnalysis {
    pub task: TaskPath,
    pub properties: TaskProperties,
    pub caching: CachingState,
    pub report: TaskInputsReport,
    /// All validation errors of the task, if it has any
    pub validation_failure: Option<TaskError>,
}

impl TaskAnalysis {
    pub fn state(&self) -> &BeforeExecutionState {
        self.caching.state()
    }

    pub fn is_valid(&self) -> bool {
        self.validation_failure.is_none()
    }
}

/// Shared services for one build invocation
pub struct BuildContext {
    schemas: &'static SchemaRegistry,
    snapshotter: Arc<dyn Snapshotter>,
    config: KilnConfig,
    outputs: OutputRegistry,
    metrics: Arc<BuildMetrics>,
}

impl BuildContext {
    pub fn new(config: KilnConfig, snapshotter: Arc<dyn Snapshotter>) -> Self {
        Self {
            schemas: SchemaRegistry::global(),
            snapshotter,
            config,
            outputs: OutputRegistry::new(),
            metrics: Arc::new(BuildMetrics::new()),
        }
    }

    /// Context snapshotting the real file system with the configured excludes
    pub fn with_disk(config: KilnConfig) -> Result<Self, TaskError> {
        let snapshotter = DiskSnapshotter::with_default_excludes(&config.default_excludes)?;
        Ok(Self::new(config, Arc::new(snapshotter)))
    }

    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<BuildMetrics> {
        &self.metrics
    }

    pub fn outputs(&self) -> &OutputRegistry {
        &self.outputs
    }

    /// Discover properties and register the task's output roots
    pub fn prepare(&self, task: &Task) -> Result<TaskProperties, TaskError> {
        let properties = walk_properties(task, self.schemas)?;
        self.outputs.register(task.path(), &properties);
        Ok(properties)
    }

    pub fn analyze(&self, task: &Task) -> Result<TaskAnalysis, TaskError> {
        let properties = self.prepare(task)?;
        self.analyze_prepared(task, properties)
    }

    /// Analyse several tasks; overlaps are checked against all of them
    pub fn analyze_all(&self, tasks: &[&Task]) -> Result<Vec<TaskAnalysis>, TaskError> {
        let prepared = tasks
            .iter()
            .map(|task| self.prepare(task))
            .collect::<Result<Vec<_>, _>>()?;
        tasks
            .iter()
            .zip(prepared)
            .map(|(task, properties)| self.analyze_prepared(task, properties))
            .collect()
    }

    #[instrument(skip_all, fields(task = %task.path()))]
    fn analyze_prepared(
        &self,
        task: &Task,
        properties: TaskProperties,
    ) -> Result<TaskAnalysis, TaskError> {
        let validation_failure = properties.validation.check(task.path().as_str()).err();
        let state = BeforeExecutionState::capture(task, &properties, self.snapshotter.as_ref())?;
        let caching = CachingStateResolver::new(&self.config.build_cache, &self.outputs)
            .resolve(task, &properties, state);
        let report = TaskInputsReport::build(task.path().as_str(), &properties, caching.state(), &caching);

        info!(
            cacheable = caching.is_enabled(),
            valid = validation_failure.is_none(),
            "task analysed"
        );
        Ok(TaskAnalysis {
            task: task.path().clone(),
            properties,
            caching,
            report,
            validation_failure,
        })
    }

    /// Compare an analysed task with its last recorded execution
    pub fn check_up_to_date(
        &self,
        task: &Task,
        analysis: &TaskAnalysis,
        history: &HistoryStore,
    ) -> Result<UpToDateVerdict, TaskError> {
        let previous = history.load(task.path())?;
        Ok(check_up_to_date(
            task,
            &analysis.properties,
            analysis.state(),
            previous.as_ref(),
        ))
    }

    /// Snapshot outputs after the task ran and store the result as its history
    pub fn record_execution(
        &self,
        task: &Task,
        analysis: &TaskAnalysis,
        history: &HistoryStore,
        successful: bool,
    ) -> Result<AfterExecutionState, TaskError> {
        let after = AfterExecutionState::capture(
            task,
            analysis.state().clone(),
            &analysis.properties,
            self.snapshotter.as_ref(),
            successful,
        )?;
        history.store(task.path(), &after)?;
        Ok(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::DisabledReasonCategory;
    use crate::hasher::HashCode;
    use crate::property::FileValue;
    use crate::snapshot::FileSystemLocationSnapshot;
    use crate::snapshotter::StaticSnapshotter;
    use tempfile::TempDir;

    fn context(snapshotter: StaticSnapshotter) -> BuildContext {
        BuildContext::new(KilnConfig::default(), Arc::new(snapshotter))
    }

    fn task(name: &str, output: &str) -> Task {
        let mut task = Task::ad_hoc(TaskPath::parse(name).unwrap());
        task.set_cacheable(true).unwrap();
        task.inputs_mut()
            .unwrap()
            .file(Some(FileValue::path("/w/in.txt")))
            .with_property_name("source");
        task.outputs_mut()
            .unwrap()
            .file(Some(FileValue::path(output)))
            .with_property_name("out");
        task
    }

    fn files() -> StaticSnapshotter {
        StaticSnapshotter::new()
            .with(FileSystemLocationSnapshot::file("/w/in.txt", HashCode::of("in")))
            .with(FileSystemLocationSnapshot::file("/w/out.txt", HashCode::of("out")))
    }

    #[test]
    fn test_analyze_cacheable_task() {
        let analysis = context(files()).analyze(&task(":a", "/w/out.txt")).unwrap();
        assert!(analysis.is_valid());
        assert!(analysis.caching.is_enabled());
        assert_eq!(analysis.report.build_cache_key, analysis.caching.key());
    }

    #[test]
    fn test_analyze_all_sees_every_output() {
        let ctx = context(files());
        let a = task(":a", "/w/out.txt");
        let b = task(":b", "/w/out.txt");
        let analyses = ctx.analyze_all(&[&a, &b]).unwrap();
        for analysis in &analyses {
            assert_eq!(
                analysis.caching.primary_reason().unwrap().category,
                DisabledReasonCategory::OverlappingOutputs
            );
        }
    }

    #[test]
    fn test_validation_failure_is_reported() {
        let mut broken = Task::ad_hoc(TaskPath::parse(":t").unwrap());
        broken.inputs_mut().unwrap().file(None).with_property_name("src");
        let analysis = context(files()).analyze(&broken).unwrap();
        let failure = analysis.validation_failure.unwrap();
        assert_eq!(
            failure.to_string(),
            "A problem was found with the configuration of task ':t'.\n  - No value has been specified for property 'src'."
        );
    }

    #[test]
    fn test_execution_history() {
        let dir = TempDir::new().unwrap();
        let history = HistoryStore::new(dir.path());
        let ctx = context(files());
        let task = task(":a", "/w/out.txt");

        let analysis = ctx.analyze(&task).unwrap();
        let verdict = ctx.check_up_to_date(&task, &analysis, &history).unwrap();
        assert_eq!(verdict.reasons(), ["No history is available."]);

        ctx.record_execution(&task, &analysis, &history, true).unwrap();
        let analysis = ctx.analyze(&task).unwrap();
        assert!(ctx
            .check_up_to_date(&task, &analysis, &history)
            .unwrap()
            .is_up_to_date());
    }
}
