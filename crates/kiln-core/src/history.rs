//! Previous-execution state, one JSON document per task

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::HistoryError;
use crate::hasher::HashCode;
use crate::task::TaskPath;
use crate::uptodate::AfterExecutionState;

/// File-backed store under `<root>/.kiln/history`
pub struct HistoryStore {
    root: PathBuf,
}

impl HistoryStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().join(".kiln").join("history"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, task: &TaskPath) -> PathBuf {
        self.root
            .join(format!("{}.json", HashCode::of(task.as_str()).to_hex()))
    }

    /// State of the task's last recorded execution, if any
    pub fn load(&self, task: &TaskPath) -> Result<Option<AfterExecutionState>, HistoryError> {
        let path = self.entry_path(task);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(HistoryError::Io { path, source }),
        };
        let state = serde_json::from_str(&content)
            .map_err(|source| HistoryError::Corrupt { path, source })?;
        Ok(Some(state))
    }

    pub fn store(&self, task: &TaskPath, state: &AfterExecutionState) -> Result<(), HistoryError> {
        fs::create_dir_all(&self.root).map_err(|source| HistoryError::Io {
            path: self.root.clone(),
            source,
        })?;
        let path = self.entry_path(task);
        let content = serde_json::to_string_pretty(state)?;
        fs::write(&path, content).map_err(|source| HistoryError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(task = %task, path = %path.display(), "history stored");
        Ok(())
    }

    pub fn remove(&self, task: &TaskPath) -> Result<bool, HistoryError> {
        let path = self.entry_path(task);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(HistoryError::Io { path, source }),
        }
    }

    /// Forget every recorded execution
    pub fn clear(&self) -> Result<(), HistoryError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(HistoryError::Io {
                path: self.root.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::BeforeExecutionState;
    use crate::task::core_loader;
    use crate::value::Implementation;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn state() -> AfterExecutionState {
        AfterExecutionState {
            before: BeforeExecutionState {
                implementation: Implementation::new("Compile", core_loader()),
                additional_implementations: vec![],
                input_value_hashes: BTreeMap::from([("mode".to_string(), HashCode::of("debug"))]),
                non_cacheable_inputs: BTreeMap::new(),
                input_file_fingerprints: BTreeMap::new(),
                output_file_snapshots: BTreeMap::new(),
            },
            output_fingerprints: BTreeMap::new(),
            successful: true,
        }
    }

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path());
        let task = TaskPath::parse(":app:compile").unwrap();

        assert!(store.load(&task).unwrap().is_none());
        store.store(&task, &state()).unwrap();
        assert_eq!(store.load(&task).unwrap(), Some(state()));
        assert!(store.remove(&task).unwrap());
        assert!(!store.remove(&task).unwrap());
    }

    #[test]
    fn test_corrupt_entry() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path());
        let task = TaskPath::parse(":t").unwrap();
        fs::create_dir_all(store.dir()).unwrap();
        fs::write(store.entry_path(&task), "[").unwrap();
        assert!(matches!(store.load(&task), Err(HistoryError::Corrupt { .. })));
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let store = HistoryStore::new(dir.path());
        let task = TaskPath::parse(":t").unwrap();
        store.store(&task, &state()).unwrap();
        store.clear().unwrap();
        assert!(store.load(&task).unwrap().is_none());
        store.clear().unwrap();
    }
}
