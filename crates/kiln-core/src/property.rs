//! Property model shared by schema discovery, fingerprinting and caching

use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Which parts of a file's identity participate in its fingerprint
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Normalizer {
    #[default]
    AbsolutePath,
    RelativePath,
    NameOnly,
    IgnoredPath,
    Classpath,
    CompileClasspath,
}

impl Normalizer {
    pub const ALL: [Normalizer; 6] = [
        Normalizer::AbsolutePath,
        Normalizer::RelativePath,
        Normalizer::NameOnly,
        Normalizer::IgnoredPath,
        Normalizer::Classpath,
        Normalizer::CompileClasspath,
    ];

    /// Stable identifier, used in cache keys and reports
    pub fn identifier(&self) -> &'static str {
        match self {
            Normalizer::AbsolutePath => "ABSOLUTE_PATH",
            Normalizer::RelativePath => "RELATIVE_PATH",
            Normalizer::NameOnly => "NAME_ONLY",
            Normalizer::IgnoredPath => "IGNORED_PATH",
            Normalizer::Classpath => "CLASSPATH",
            Normalizer::CompileClasspath => "COMPILE_CLASSPATH",
        }
    }

    pub fn is_order_sensitive(&self) -> bool {
        matches!(self, Normalizer::Classpath | Normalizer::CompileClasspath)
    }
}

impl fmt::Display for Normalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DirectorySensitivity {
    #[default]
    Default,
    IgnoreDirectories,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineEndingSensitivity {
    #[default]
    Default,
    NormalizeLineEndings,
}

impl LineEndingSensitivity {
    pub fn normalizes(&self) -> bool {
        matches!(self, LineEndingSensitivity::NormalizeLineEndings)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    File,
    Directory,
    FileCollection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

/// Options attached to a file property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub role: Direction,
    pub cardinality: Cardinality,
    pub normalizer: Normalizer,
    pub directory_sensitivity: DirectorySensitivity,
    pub line_ending_sensitivity: LineEndingSensitivity,
    /// The task is skipped as having no source when every input marked
    /// this way resolves to no files
    pub skip_when_empty: bool,
}

impl FileSpec {
    pub fn input(cardinality: Cardinality) -> Self {
        Self {
            role: Direction::Input,
            cardinality,
            normalizer: Normalizer::AbsolutePath,
            directory_sensitivity: DirectorySensitivity::Default,
            line_ending_sensitivity: LineEndingSensitivity::Default,
            skip_when_empty: false,
        }
    }

    /// Outputs are always fingerprinted by absolute path
    pub fn output(cardinality: Cardinality) -> Self {
        Self {
            role: Direction::Output,
            ..Self::input(cardinality)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PropertyKind {
    Value,
    File(FileSpec),
}

/// A declared property, flattened from schema markers or runtime registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySpec {
    /// Unique per task and category; dotted for nested beans
    pub name: String,
    pub direction: Direction,
    pub kind: PropertyKind,
    pub optional: bool,
}

impl PropertySpec {
    pub fn input_value(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Input,
            kind: PropertyKind::Value,
            optional: false,
        }
    }

    pub fn input_file(name: impl Into<String>, spec: FileSpec) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Input,
            kind: PropertyKind::File(spec),
            optional: false,
        }
    }

    pub fn output_file(name: impl Into<String>, cardinality: Cardinality) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Output,
            kind: PropertyKind::File(FileSpec::output(cardinality)),
            optional: false,
        }
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn file_spec(&self) -> Option<&FileSpec> {
        match &self.kind {
            PropertyKind::File(spec) => Some(spec),
            PropertyKind::Value => None,
        }
    }

    pub fn file_spec_mut(&mut self) -> Option<&mut FileSpec> {
        match &mut self.kind {
            PropertyKind::File(spec) => Some(spec),
            PropertyKind::Value => None,
        }
    }
}

/// A pattern-filtered directory tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTree {
    pub root: PathBuf,
    pub includes: Vec<Pattern>,
    pub excludes: Vec<Pattern>,
}

impl FileTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            includes: Vec::new(),
            excludes: Vec::new(),
        }
    }

    pub fn include(mut self, pattern: &str) -> Result<Self, glob::PatternError> {
        self.includes.push(Pattern::new(pattern)?);
        Ok(self)
    }

    pub fn exclude(mut self, pattern: &str) -> Result<Self, glob::PatternError> {
        self.excludes.push(Pattern::new(pattern)?);
        Ok(self)
    }

    /// Whether a path relative to the root (with `/` separators) is part of the tree
    pub fn matches(&self, relative_path: &str) -> bool {
        let included = self.includes.is_empty()
            || self.includes.iter().any(|p| p.matches(relative_path));
        included && !self.excludes.iter().any(|p| p.matches(relative_path))
    }
}

/// The file locations a file property currently points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileValue {
    Path(PathBuf),
    Paths(Vec<PathBuf>),
    Tree(FileTree),
}

impl FileValue {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        FileValue::Path(path.into())
    }

    /// Declared roots, in declaration order
    pub fn roots(&self) -> Vec<&Path> {
        match self {
            FileValue::Path(path) => vec![path.as_path()],
            FileValue::Paths(paths) => paths.iter().map(PathBuf::as_path).collect(),
            FileValue::Tree(tree) => vec![tree.root.as_path()],
        }
    }

    /// Pattern-filtered trees cannot be enumerated deterministically as outputs
    pub fn is_tree(&self) -> bool {
        matches!(self, FileValue::Tree(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_classpath_is_order_sensitive() {
        let sensitive: Vec<_> = Normalizer::ALL
            .iter()
            .filter(|n| n.is_order_sensitive())
            .collect();
        assert_eq!(sensitive, vec![&Normalizer::Classpath, &Normalizer::CompileClasspath]);
    }

    #[test]
    fn test_normalizer_serde_uses_identifier() {
        let json = serde_json::to_string(&Normalizer::RelativePath).unwrap();
        assert_eq!(json, "\"RELATIVE_PATH\"");
    }

    #[test]
    fn test_file_tree_matching() {
        let tree = FileTree::new("/src")
            .include("**/*.rs")
            .unwrap()
            .exclude("generated/**")
            .unwrap();
        assert!(tree.matches("lib.rs"));
        assert!(tree.matches("a/b/mod.rs"));
        assert!(!tree.matches("README.md"));
        assert!(!tree.matches("generated/out.rs"));
    }

    #[test]
    fn test_roots() {
        let value = FileValue::Paths(vec!["/a".into(), "/b".into()]);
        assert_eq!(value.roots(), vec![Path::new("/a"), Path::new("/b")]);
        assert!(!value.is_tree());
        assert!(FileValue::Tree(FileTree::new("/c")).is_tree());
    }

    #[test]
    fn test_output_spec_uses_absolute_paths() {
        let spec = PropertySpec::output_file("out", Cardinality::Directory);
        let file = spec.file_spec().unwrap();
        assert_eq!(file.role, Direction::Output);
        assert_eq!(file.normalizer, Normalizer::AbsolutePath);
    }
}
