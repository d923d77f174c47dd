//! Error taxonomy for the recursive completion engine
//!
//! Only a few failures ever reach the caller: transport errors that outlived
//! the client's own retries, a limit exceeded by the root session, validation
//! failure after fallback, cancellation and timeout. Sandbox runtime faults and
//! extraction misses are values, fed back to the model as observations.

use std::time::Duration;
use thiserror::Error;

use crate::llm::LlmError;
use crate::schema::ValidationIssue;

/// Result alias used throughout the library
pub type RlmResult<T> = std::result::Result<T, RlmError>;

/// Caller-visible engine errors
#[derive(Debug, Error)]
pub enum RlmError {
    #[error("transport error: {0}")]
    Transport(#[from] LlmError),

    #[error(transparent)]
    LimitExceeded(#[from] LimitExceeded),

    #[error("validation failed after {attempts} attempt(s): {summary}")]
    Validation {
        attempts: usize,
        issues: Vec<ValidationIssue>,
        summary: String,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("prompt error: {0}")]
    Prompt(String),
}

impl RlmError {
    /// Build a validation error whose summary names every failing field
    pub fn validation(attempts: usize, issues: Vec<ValidationIssue>) -> Self {
        let summary = if issues.is_empty() {
            "no valid output produced".to_string()
        } else {
            issues.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; ")
        };
        RlmError::Validation {
            attempts,
            issues,
            summary,
        }
    }

    /// Whether this error came from an exhausted depth or iteration budget
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, RlmError::LimitExceeded(_))
    }
}

/// A depth or iteration budget was exhausted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitExceeded {
    #[error("max recursion depth ({max_depth}) exceeded at depth {depth}")]
    Depth { max_depth: usize, depth: usize },

    #[error("max iterations ({max_iterations}) exceeded without FINAL()")]
    Iterations { max_iterations: usize },
}

impl From<handlebars::RenderError> for RlmError {
    fn from(err: handlebars::RenderError) -> Self {
        RlmError::Prompt(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::IssueKind;

    #[test]
    fn test_limit_messages() {
        let err = RlmError::from(LimitExceeded::Iterations { max_iterations: 1 });
        assert!(err.is_limit_exceeded());
        assert_eq!(err.to_string(), "max iterations (1) exceeded without FINAL()");

        let err = RlmError::from(LimitExceeded::Depth { max_depth: 2, depth: 3 });
        assert!(err.to_string().contains("depth (2)"));
    }

    #[test]
    fn test_validation_summary_names_fields() {
        let issues = vec![
            ValidationIssue::new("score", IssueKind::Missing, "required field", "missing"),
            ValidationIssue::new("label", IssueKind::TypeMismatch, "string", "number 3"),
        ];
        let err = RlmError::validation(3, issues);
        let text = err.to_string();
        assert!(text.contains("3 attempt(s)"));
        assert!(text.contains("score"));
        assert!(text.contains("label"));
    }

    #[test]
    fn test_validation_summary_without_issues() {
        let err = RlmError::validation(1, vec![]);
        assert!(err.to_string().contains("no valid output produced"));
    }
}
