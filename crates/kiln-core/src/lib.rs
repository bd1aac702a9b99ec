//! Kiln Core - Incremental Build Decision Engine
//!
//! Features:
//! - BLAKE3 hashing of values, files and directory trees
//! - Declared and runtime-registered task properties, discovered and validated
//! - File fingerprints under six normalization strategies
//! - Build cache keys with every reason caching is disabled
//! - Up-to-date checks against the last recorded execution
//! - Dependency notations resolved into a task graph with cycle detection
//! - Parallel snapshotting with Rayon

pub mod analysis;
pub mod caching;
pub mod config;
pub mod container;
pub mod dependency;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod hasher;
pub mod history;
pub mod manifest;
pub mod metrics;
pub mod property;
pub mod report;
pub mod schema;
pub mod snapshot;
pub mod snapshotter;
pub mod task;
pub mod uptodate;
pub mod validation;
pub mod value;
pub mod visitor;
pub mod walker;

pub use analysis::{BuildContext, TaskAnalysis};
pub use caching::{
    cache_key, BeforeExecutionState, CachingState, CachingStateResolver, DisabledReason,
    DisabledReasonCategory, OutputRegistry,
};
pub use config::{BuildCacheConfig, KilnConfig};
pub use container::TaskContainer;
pub use dependency::{DependencyNotation, DependencyResolver, TaskLookup};
pub use error::{ConfigError, DependencyError, HistoryError, ManifestError, SnapshotError, TaskError};
pub use fingerprint::{fingerprint_property, FileCollectionFingerprint};
pub use graph::TaskGraph;
pub use hasher::{hash_content, HashCode, Hasher};
pub use history::HistoryStore;
pub use manifest::Manifest;
pub use metrics::BuildMetrics;
pub use property::{DirectorySensitivity, FileTree, FileValue, LineEndingSensitivity, Normalizer};
pub use report::TaskInputsReport;
pub use schema::{Bean, Describe, SchemaRegistry};
pub use snapshot::FileSystemLocationSnapshot;
pub use snapshotter::{DiskSnapshotter, Snapshotter, StaticSnapshotter};
pub use task::{DependencyKind, Task, TaskPath};
pub use uptodate::{check_up_to_date, AfterExecutionState, UpToDateVerdict};
pub use value::{Implementation, PropertyValue};
pub use visitor::{visit_input_file_properties, InputFilePropertyVisitor};
pub use walker::{walk_properties, TaskProperties};
