//! Kiln Config - build settings loaded from JSON
//!
//! Features:
//! - Project config at `<project>/.kiln/config.json`
//! - Falls back to the user config at `~/.kiln/config.json`, then defaults
//! - Every field optional in the file (serde defaults)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

const CONFIG_DIR: &str = ".kiln";
const CONFIG_FILE: &str = "config.json";

/// Build cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildCacheConfig {
    pub enabled: bool,
    /// Log every cache key at info level
    pub debug_logging: bool,
}

impl Default for BuildCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug_logging: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    pub build_cache: BuildCacheConfig,
    /// Glob patterns never snapshotted, relative to each declared root
    pub default_excludes: Vec<String>,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            build_cache: BuildCacheConfig::default(),
            default_excludes: default_excludes(),
        }
    }
}

fn default_excludes() -> Vec<String> {
    [
        "**/.git",
        "**/.git/**",
        "**/.svn",
        "**/.svn/**",
        "**/.hg",
        "**/.hg/**",
        "**/.DS_Store",
        "**/._*",
        "**/*~",
        "**/.#*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Project-level config path
pub fn project_config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// User-level config path, if a home directory is known
pub fn user_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE))
}

impl KilnConfig {
    /// Load the first config that exists: project, then user, then defaults
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let candidates = std::iter::once(project_config_path(project_dir)).chain(user_config_path());
        for path in candidates {
            if path.exists() {
                let config = Self::load_from(&path)?;
                tracing::debug!(path = %path.display(), "config loaded");
                return Ok(config);
            }
        }
        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, content).map_err(io_err)?;
        tracing::info!(path = %path.display(), "config saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = KilnConfig::default();
        assert!(config.build_cache.enabled);
        assert!(!config.build_cache.debug_logging);
        assert!(config.default_excludes.contains(&"**/.DS_Store".to_string()));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = project_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"build_cache": {"enabled": false}}"#).unwrap();

        let config = KilnConfig::load(dir.path()).unwrap();
        assert!(!config.build_cache.enabled);
        assert_eq!(config.default_excludes, default_excludes());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = project_config_path(dir.path());
        let mut config = KilnConfig::default();
        config.build_cache.debug_logging = true;
        config.default_excludes = vec!["**/target/**".into()];
        config.save_to(&path).unwrap();
        assert_eq!(KilnConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            KilnConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
