//! Validation diagnostics collected per task

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    diagnostics: Vec<Diagnostic>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            message: message.into(),
        });
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Error,
            message: message.into(),
        });
    }

    pub fn missing_value(&mut self, property: &str) {
        self.error(format!(
            "No value has been specified for property '{}'.",
            property
        ));
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    /// Surface warnings through the log and fail with every error at once
    pub fn check(&self, task: &str) -> Result<(), TaskError> {
        for warning in self.warnings() {
            warn!(task, "{}", warning.message);
        }
        let messages: Vec<String> = self.errors().map(|d| d.message.clone()).collect();
        if messages.is_empty() {
            Ok(())
        } else {
            Err(TaskError::Validation {
                task: task.to_string(),
                messages,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warnings_do_not_fail() {
        let mut report = ValidationReport::new();
        report.warning("Property 'x' is not annotated with an input or output annotation.");
        assert!(!report.has_errors());
        assert!(report.check(":t").is_ok());
    }

    #[test]
    fn test_all_errors_reported_together() {
        let mut report = ValidationReport::new();
        report.missing_value("a");
        report.warning("ignored");
        report.missing_value("b");

        match report.check(":t") {
            Err(TaskError::Validation { task, messages }) => {
                assert_eq!(task, ":t");
                assert_eq!(
                    messages,
                    vec![
                        "No value has been specified for property 'a'.",
                        "No value has been specified for property 'b'.",
                    ]
                );
            }
            other => panic!("unexpected result {:?}", other),
        }
    }
}
