//! Validation messages collected before a simulation starts.
//!
//! A [`Validator`] accumulates [`ValidationMessage`]s; a run can start only
//! when none of them is an error.

use std::fmt;

use brainflow_foundation::NodeId;
use serde::{Deserialize, Serialize};

/// How serious a validation finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A single finding, optionally attributed to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub severity: Severity,
    pub node: Option<NodeId>,
    pub message: String,
}

impl fmt::Display for ValidationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        match self.node {
            Some(node) => write!(f, "{level} [{node}]: {}", self.message),
            None => write!(f, "{level}: {}", self.message),
        }
    }
}

/// Collects validation findings.
#[derive(Debug, Default)]
pub struct Validator {
    messages: Vec<ValidationMessage>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `message` as an error unless `condition` holds. Returns `condition`.
    pub fn assert_error(&mut self, condition: bool, node: NodeId, message: impl Into<String>) -> bool {
        if !condition {
            self.add(Severity::Error, Some(node), message.into());
        }
        condition
    }

    /// Record `message` as a warning unless `condition` holds. Returns `condition`.
    pub fn assert_warning(&mut self, condition: bool, node: NodeId, message: impl Into<String>) -> bool {
        if !condition {
            self.add(Severity::Warning, Some(node), message.into());
        }
        condition
    }

    pub fn add_error(&mut self, node: Option<NodeId>, message: impl Into<String>) {
        self.add(Severity::Error, node, message.into());
    }

    pub fn add_warning(&mut self, node: Option<NodeId>, message: impl Into<String>) {
        self.add(Severity::Warning, node, message.into());
    }

    pub fn add_info(&mut self, node: Option<NodeId>, message: impl Into<String>) {
        self.add(Severity::Info, node, message.into());
    }

    fn add(&mut self, severity: Severity, node: Option<NodeId>, message: String) {
        self.messages.push(ValidationMessage {
            severity,
            node,
            message,
        });
    }

    pub fn messages(&self) -> &[ValidationMessage] {
        &self.messages
    }

    /// No errors so far. Warnings do not count.
    pub fn is_successful(&self) -> bool {
        !self.messages.iter().any(|m| m.severity == Severity::Error)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn into_report(self) -> ValidationReport {
        ValidationReport {
            messages: self.messages,
        }
    }
}

/// Outcome of a validation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub messages: Vec<ValidationMessage>,
}

impl ValidationReport {
    pub fn is_successful(&self) -> bool {
        self.error_count() == 0
    }

    pub fn error_count(&self) -> usize {
        self.errors().count()
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationMessage> {
        self.messages
            .iter()
            .filter(|m| m.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationMessage> {
        self.messages
            .iter()
            .filter(|m| m.severity == Severity::Warning)
    }

    /// Whether any error mentions `text`.
    pub fn has_error_containing(&self, text: &str) -> bool {
        self.errors().any(|m| m.message.contains(text))
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for message in &self.messages {
            writeln!(f, "{message}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warnings_do_not_fail_validation() {
        let mut validator = Validator::new();
        assert!(!validator.assert_warning(false, NodeId(1), "Input is empty"));
        assert!(validator.is_successful());

        validator.assert_error(false, NodeId(1), "LENGTH must be positive");
        let report = validator.into_report();
        assert!(!report.is_successful());
        assert_eq!(report.error_count(), 1);
        assert_eq!(report.warnings().count(), 1);
        assert!(report.has_error_containing("LENGTH"));
    }

    #[test]
    fn test_message_display() {
        let mut validator = Validator::new();
        validator.add_error(Some(NodeId(4)), "missing input");
        validator.add_info(None, "ok");
        let text = validator.into_report().to_string();
        assert!(text.contains("error [#4]: missing input"));
        assert!(text.contains("info: ok"));
    }
}
