//! Shared violation types for validators and guards
//!
//! Every static check (architecture, AST, security, structure, pre-commit
//! invariants) reports the same violation shape so reports can be merged,
//! sorted, and deduplicated uniformly.

use serde::{Deserialize, Serialize};

/// Violation severity. Errors block; warnings inform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single rule violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    /// Stable rule identifier, e.g. `ARCH.LAYER_MATRIX`.
    pub rule_id: String,
    pub severity: Severity,
    /// Project-relative file the violation is anchored to.
    pub file: String,
    /// Import target or other secondary anchor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub message: String,
}

impl Violation {
    pub fn error(
        rule_id: impl Into<String>,
        file: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            severity: Severity::Error,
            file: file.into(),
            target: None,
            message: message.into(),
        }
    }

    pub fn warning(
        rule_id: impl Into<String>,
        file: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(rule_id, file, message)
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Sort by (ruleId, severity, file, target, message) and drop duplicates.
pub fn sort_and_dedup(mut violations: Vec<Violation>) -> Vec<Violation> {
    violations.sort_by(|a, b| {
        a.rule_id
            .cmp(&b.rule_id)
            .then(a.severity.cmp(&b.severity))
            .then(a.file.cmp(&b.file))
            .then(a.target.cmp(&b.target))
            .then(a.message.cmp(&b.message))
    });
    violations.dedup();
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_and_dedup() {
        let violations = vec![
            Violation::error("B.RULE", "z.ts", "msg"),
            Violation::error("A.RULE", "a.ts", "msg"),
            Violation::error("A.RULE", "a.ts", "msg"),
        ];
        let sorted = sort_and_dedup(violations);
        assert_eq!(sorted.len(), 2);
        assert_eq!(sorted[0].rule_id, "A.RULE");
    }

    #[test]
    fn test_blocking() {
        assert!(Violation::error("R", "f", "m").is_blocking());
        assert!(!Violation::warning("R", "f", "m").is_blocking());
    }
}
