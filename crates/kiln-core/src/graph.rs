//! Task Graph - petgraph-based task ordering
//!
//! Features:
//! - Each reachable task resolved once per build, lazily realized tasks included
//! - Hard edges: depends_on, finalized_by, must_run_after
//! - should_run_after dropped when it would close a cycle
//! - Task-level cycle detection with the full cycle path
//! - Dependencies-first build order and affected-task queries

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, instrument};

use crate::container::TaskContainer;
use crate::dependency::DependencyResolver;
use crate::error::DependencyError;
use crate::task::{DependencyKind, TaskPath};

/// The resolved sets of one task, one per relation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedDependencies {
    pub depends_on: BTreeSet<TaskPath>,
    pub must_run_after: BTreeSet<TaskPath>,
    pub should_run_after: BTreeSet<TaskPath>,
    pub finalized_by: BTreeSet<TaskPath>,
}

impl ResolvedDependencies {
    pub fn get(&self, kind: DependencyKind) -> &BTreeSet<TaskPath> {
        match kind {
            DependencyKind::DependsOn => &self.depends_on,
            DependencyKind::MustRunAfter => &self.must_run_after,
            DependencyKind::ShouldRunAfter => &self.should_run_after,
            DependencyKind::FinalizedBy => &self.finalized_by,
        }
    }

    fn set(&mut self, kind: DependencyKind, tasks: BTreeSet<TaskPath>) {
        match kind {
            DependencyKind::DependsOn => self.depends_on = tasks,
            DependencyKind::MustRunAfter => self.must_run_after = tasks,
            DependencyKind::ShouldRunAfter => self.should_run_after = tasks,
            DependencyKind::FinalizedBy => self.finalized_by = tasks,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

/// Tasks reachable from the requested roots; an edge points from a task to
/// the task that has to run before it
pub struct TaskGraph {
    graph: DiGraph<TaskPath, DependencyKind>,
    index: BTreeMap<TaskPath, NodeIndex>,
    resolved: BTreeMap<TaskPath, ResolvedDependencies>,
}

impl TaskGraph {
    /// Resolve every task reachable from `roots` through depends_on and finalized_by
    #[instrument(skip_all, fields(roots = roots.len()))]
    pub fn build(container: &mut TaskContainer, roots: &[TaskPath]) -> Result<Self, DependencyError> {
        let mut graph = Self {
            graph: DiGraph::new(),
            index: BTreeMap::new(),
            resolved: BTreeMap::new(),
        };

        let mut queue: VecDeque<TaskPath> = roots.iter().cloned().collect();
        while let Some(path) = queue.pop_front() {
            if graph.resolved.contains_key(&path) {
                continue;
            }
            container.realize(&path)?;
            let lookup: &TaskContainer = container;
            let task = lookup
                .get(&path)
                .ok_or_else(|| DependencyError::UnknownTask(path.to_string()))?;
            let resolver = DependencyResolver::new(lookup);

            let mut resolved = ResolvedDependencies::default();
            for kind in DependencyKind::ALL {
                resolved.set(kind, resolver.resolve(task, task.dependency(kind))?);
            }
            queue.extend(resolved.depends_on.iter().cloned());
            queue.extend(resolved.finalized_by.iter().cloned());

            graph.node(&path);
            graph.resolved.insert(path, resolved);
        }

        let mut hard = Vec::new();
        let mut soft = Vec::new();
        for (path, resolved) in &graph.resolved {
            for dependency in &resolved.depends_on {
                hard.push((path.clone(), dependency.clone(), DependencyKind::DependsOn));
            }
            for finalizer in &resolved.finalized_by {
                hard.push((finalizer.clone(), path.clone(), DependencyKind::FinalizedBy));
            }
            for before in &resolved.must_run_after {
                if graph.index.contains_key(before) {
                    hard.push((path.clone(), before.clone(), DependencyKind::MustRunAfter));
                }
            }
            for before in &resolved.should_run_after {
                if graph.index.contains_key(before) {
                    soft.push((path.clone(), before.clone()));
                }
            }
        }
        for (from, to, kind) in hard {
            let (from, to) = (graph.node(&from), graph.node(&to));
            graph.graph.add_edge(from, to, kind);
        }

        if let Some(cycle) = graph.find_cycle() {
            return Err(DependencyError::TaskCycle { cycle });
        }

        for (from, to) in soft {
            let (from, to) = (graph.node(&from), graph.node(&to));
            if has_path_connecting(&graph.graph, to, from, None) {
                debug!(
                    task = %graph.graph[from],
                    other = %graph.graph[to],
                    "should-run-after ignored, it would introduce a cycle"
                );
                continue;
            }
            graph.graph.add_edge(from, to, DependencyKind::ShouldRunAfter);
        }

        debug!(
            tasks = graph.graph.node_count(),
            edges = graph.graph.edge_count(),
            "task graph built"
        );
        Ok(graph)
    }

    fn node(&mut self, path: &TaskPath) -> NodeIndex {
        if let Some(&idx) = self.index.get(path) {
            return idx;
        }
        let idx = self.graph.add_node(path.clone());
        self.index.insert(path.clone(), idx);
        idx
    }

    fn successors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut successors: Vec<NodeIndex> = self.graph.neighbors(idx).collect();
        successors.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        successors.dedup();
        successors
    }

    /// First cycle in path order, as `[a, b, ..., a]`
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        for &start in self.index.values() {
            if marks[start.index()] != Mark::Unvisited {
                continue;
            }
            marks[start.index()] = Mark::OnPath;
            let mut stack = vec![(start, self.successors(start), 0usize)];

            loop {
                let next = match stack.last_mut() {
                    None => break,
                    Some((_, successors, pos)) if *pos < successors.len() => {
                        *pos += 1;
                        Some(successors[*pos - 1])
                    }
                    Some(_) => None,
                };
                let Some(next) = next else {
                    if let Some((done, _, _)) = stack.pop() {
                        marks[done.index()] = Mark::Done;
                    }
                    continue;
                };
                match marks[next.index()] {
                    Mark::OnPath => {
                        let begin = stack
                            .iter()
                            .position(|(idx, _, _)| *idx == next)
                            .unwrap_or(0);
                        let mut cycle: Vec<String> = stack[begin..]
                            .iter()
                            .map(|(idx, _, _)| self.graph[*idx].to_string())
                            .collect();
                        cycle.push(self.graph[next].to_string());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        marks[next.index()] = Mark::OnPath;
                        stack.push((next, self.successors(next), 0));
                    }
                    Mark::Done => {}
                }
            }
        }
        None
    }

    /// Every task, dependencies before their dependents
    pub fn build_order(&self) -> Result<Vec<TaskPath>, DependencyError> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| DependencyError::TaskCycle {
            cycle: vec![self.graph[cycle.node_id()].to_string()],
        })?;
        Ok(sorted
            .iter()
            .rev()
            .map(|idx| self.graph[*idx].clone())
            .collect())
    }

    /// Tasks that depend, directly or transitively, on any of `changed`
    pub fn dependents_of(&self, changed: &[TaskPath]) -> BTreeSet<TaskPath> {
        let mut affected = BTreeSet::new();
        let mut queue: VecDeque<NodeIndex> = changed
            .iter()
            .filter_map(|path| self.index.get(path).copied())
            .collect();

        while let Some(idx) = queue.pop_front() {
            for edge in self.graph.edges_directed(idx, Direction::Incoming) {
                if *edge.weight() != DependencyKind::DependsOn {
                    continue;
                }
                if affected.insert(self.graph[edge.source()].clone()) {
                    queue.push_back(edge.source());
                }
            }
        }
        affected
    }

    /// Resolved sets of one task
    pub fn resolved(&self, path: &TaskPath) -> Option<&ResolvedDependencies> {
        self.resolved.get(path)
    }

    /// Direct depends_on set of a task
    pub fn dependencies_of(&self, path: &TaskPath) -> BTreeSet<TaskPath> {
        self.resolved
            .get(path)
            .map(|resolved| resolved.depends_on.clone())
            .unwrap_or_default()
    }

    pub fn tasks(&self) -> Vec<&TaskPath> {
        self.index.keys().collect()
    }

    pub fn contains(&self, path: &TaskPath) -> bool {
        self.index.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::DependencyNotation;
    use crate::task::Task;

    fn path(p: &str) -> TaskPath {
        TaskPath::parse(p).unwrap()
    }

    fn container(edges: &[(&str, &str)], tasks: &[&str]) -> TaskContainer {
        let mut container = TaskContainer::default();
        for name in tasks {
            container.create(Task::ad_hoc(path(name))).unwrap();
        }
        for (from, to) in edges {
            container
                .get_mut(&path(from))
                .unwrap()
                .depends_on(*to)
                .unwrap();
        }
        container
    }

    fn names(paths: &[TaskPath]) -> Vec<&str> {
        paths.iter().map(TaskPath::as_str).collect()
    }

    #[test]
    fn test_build_order() {
        let mut tasks = container(
            &[(":app", ":lib"), (":app", ":utils"), (":lib", ":utils")],
            &[":app", ":lib", ":utils", ":unrelated"],
        );
        let graph = TaskGraph::build(&mut tasks, &[path(":app")]).unwrap();
        assert_eq!(graph.len(), 3);
        assert!(!graph.contains(&path(":unrelated")));
        assert_eq!(
            names(&graph.build_order().unwrap()),
            vec![":utils", ":lib", ":app"]
        );
    }

    #[test]
    fn test_cycle_is_reported_with_path() {
        let mut tasks = container(&[(":a", ":b"), (":b", ":a")], &[":a", ":b"]);
        let err = TaskGraph::build(&mut tasks, &[path(":a")]).err().unwrap();
        match &err {
            DependencyError::TaskCycle { cycle } => assert_eq!(cycle, &[":a", ":b", ":a"]),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(
            err.to_string(),
            "Circular dependency between the following tasks:\n:a -> :b -> :a"
        );
    }

    #[test]
    fn test_self_dependency() {
        let mut tasks = container(&[(":a", ":a")], &[":a"]);
        assert!(matches!(
            TaskGraph::build(&mut tasks, &[path(":a")]),
            Err(DependencyError::TaskCycle { cycle }) if cycle == [":a", ":a"]
        ));
    }

    #[test]
    fn test_finalizer_runs_after_finalized_task() {
        let mut tasks = container(&[], &[":test", ":report"]);
        tasks
            .get_mut(&path(":test"))
            .unwrap()
            .dependency_mut(DependencyKind::FinalizedBy)
            .unwrap()
            .add(DependencyNotation::from("report"));
        let graph = TaskGraph::build(&mut tasks, &[path(":test")]).unwrap();
        assert_eq!(names(&graph.build_order().unwrap()), vec![":test", ":report"]);
    }

    #[test]
    fn test_ordering_constraints_only_between_scheduled_tasks() {
        let mut tasks = container(&[(":b", ":a")], &[":a", ":b", ":c"]);
        let a = tasks.get_mut(&path(":a")).unwrap();
        a.dependency_mut(DependencyKind::MustRunAfter)
            .unwrap()
            .add(":c".into());
        a.dependency_mut(DependencyKind::ShouldRunAfter)
            .unwrap()
            .add(":b".into());

        let graph = TaskGraph::build(&mut tasks, &[path(":b")]).unwrap();
        assert!(!graph.contains(&path(":c")));
        // :a should run after :b, but :b depends on :a, so the hint is dropped
        assert_eq!(names(&graph.build_order().unwrap()), vec![":a", ":b"]);
        assert_eq!(
            graph.resolved(&path(":a")).unwrap().must_run_after,
            BTreeSet::from([path(":c")])
        );
    }

    #[test]
    fn test_lazy_tasks_realized_on_demand() {
        let mut tasks = TaskContainer::default();
        tasks
            .register(path(":compile"), |p| Ok(Task::ad_hoc(p)))
            .unwrap();
        tasks
            .register(path(":unused"), |p| Ok(Task::ad_hoc(p)))
            .unwrap();
        tasks
            .register(path(":build"), |p| {
                let mut task = Task::ad_hoc(p);
                task.depends_on("compile")?;
                Ok(task)
            })
            .unwrap();

        let graph = TaskGraph::build(&mut tasks, &[path(":build")]).unwrap();
        assert_eq!(
            graph.dependencies_of(&path(":build")),
            BTreeSet::from([path(":compile")])
        );
        assert!(tasks.is_realized(&path(":compile")));
        assert!(!tasks.is_realized(&path(":unused")));
    }

    #[test]
    fn test_dependents_of() {
        let mut tasks = container(
            &[(":app", ":lib"), (":lib", ":utils"), (":docs", ":utils")],
            &[":app", ":lib", ":utils", ":docs"],
        );
        let graph = TaskGraph::build(&mut tasks, &[path(":app"), path(":docs")]).unwrap();
        assert_eq!(
            graph.dependents_of(&[path(":utils")]),
            BTreeSet::from([path(":app"), path(":docs"), path(":lib")])
        );
        assert!(graph.dependents_of(&[path(":app")]).is_empty());
    }
}
