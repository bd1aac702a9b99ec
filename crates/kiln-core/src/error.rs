//! Error taxonomy
//!
//! Configuration errors are fatal for the offending task. Caching disablement
//! is not an error and lives in [`crate::caching`].

use std::path::PathBuf;

/// Fatal configuration errors raised while configuring or analysing a task
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Cannot {operation} for task '{task}' after it has started executing.")]
    MutationAfterExecutionStarted { task: String, operation: String },

    #[error("Task '{task}' declares {category} property '{name}' more than once.")]
    DuplicateProperty {
        task: String,
        category: &'static str,
        name: String,
    },

    #[error("Task '{task}' declares an invalid property name '{name}': {reason}")]
    InvalidPropertyName {
        task: String,
        name: String,
        reason: &'static str,
    },

    #[error("{}", validation_message(.task, .messages))]
    Validation { task: String, messages: Vec<String> },

    #[error("Task with path '{0}' already exists.")]
    DuplicateTask(String),

    #[error("Invalid task path '{path}': {reason}")]
    InvalidTaskPath { path: String, reason: &'static str },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    History(#[from] HistoryError),
}

fn validation_message(task: &str, messages: &[String]) -> String {
    let header = if messages.len() == 1 {
        format!("A problem was found with the configuration of task '{}'.", task)
    } else {
        format!(
            "Some problems were found with the configuration of task '{}'.",
            task
        )
    };
    messages
        .iter()
        .fold(header, |acc, message| format!("{}\n  - {}", acc, message))
}

/// Failures while resolving dependency notations or building the task graph
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Could not resolve '{reference}' for task '{task}': task not found in project '{project}'.")]
    UnresolvableReference {
        task: String,
        reference: String,
        project: String,
    },

    #[error("Cannot convert {kind} to a task dependency for task '{task}'.\nThe following types/formats are supported:\n{}", accepted_kinds())]
    UnsupportedNotation { task: String, kind: String },

    #[error("Circular dependency notation found while resolving dependencies of task '{task}': {notation} is reachable from itself.")]
    NotationCycle { task: String, notation: String },

    #[error("Circular dependency between the following tasks:\n{}", .cycle.join(" -> "))]
    TaskCycle { cycle: Vec<String> },

    #[error("Task '{0}' not found.")]
    UnknownTask(String),

    #[error("Could not create task '{task}': {message}")]
    FailedRealization { task: String, message: String },

    #[error(transparent)]
    Task(#[from] Box<TaskError>),
}

/// Every notation kind the resolver accepts, one per line
pub fn accepted_kinds() -> String {
    [
        "A task instance or its path.",
        "A set of tasks selected by a task set expression.",
        "A buildable object that reports the tasks building it.",
        "A lazy expression evaluated against the owning task.",
        "A string or path reference, resolved relative to the owning project.",
        "A collection, array or map of any of the supported forms.",
    ]
    .iter()
    .map(|line| format!("  - {}", line))
    .collect::<Vec<_>>()
    .join("\n")
}

/// IO failures from the snapshot producer
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Failed to snapshot '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to walk '{path}': {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Invalid exclude pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("History IO error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt history entry '{path}': {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode history entry: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read manifest '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid manifest '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid pattern '{pattern}' in task '{task}': {source}")]
    Pattern {
        task: String,
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("Invalid declaration in task '{task}': {message}")]
    Invalid { task: String, message: String },

    #[error(transparent)]
    Task(#[from] TaskError),
}
