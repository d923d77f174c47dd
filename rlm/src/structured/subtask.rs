//! SubTask and RetryAttempt domain types

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::schema::{DecomposedTask, JsonSchema, TaskKind, ValidationIssue};
use crate::session::CompletionStats;

/// SubTask lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    /// Waiting for dispatch or for its dependencies
    #[default]
    Pending,
    /// Attempts in progress
    Running,
    /// Extracted value validated against the task's schema
    Succeeded,
    /// Attempt budget spent or a fatal error
    Failed,
}

impl SubTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for SubTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One model call for a subtask and what came of it
///
/// Never mutated once recorded; a retry appends a new attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryAttempt {
    /// 1-based
    pub attempt_number: usize,
    pub raw_output: String,
    pub extracted: Option<Value>,
    pub validation_errors: Vec<ValidationIssue>,
    /// Feedback sent with the next attempt, if there was one
    pub feedback: Option<String>,
}

impl RetryAttempt {
    pub fn passed(&self) -> bool {
        self.extracted.is_some() && self.validation_errors.is_empty()
    }
}

/// One independently retried unit of structured extraction
#[derive(Debug, Clone)]
pub struct SubTask {
    pub id: String,
    pub path: String,
    /// Property names leading to `path`
    pub segments: Vec<String>,
    pub kind: TaskKind,
    pub schema: JsonSchema,
    /// Focused instruction for this branch
    pub instruction: String,
    pub sibling_context: Vec<String>,
    pub dependencies: BTreeSet<String>,
    pub status: SubTaskStatus,
    attempts: Vec<Arc<RetryAttempt>>,
    value: Option<Value>,
    pub stats: CompletionStats,
    /// Message of the fatal error that ended this task, if any
    pub error: Option<String>,
}

impl SubTask {
    pub fn new(task: DecomposedTask) -> Self {
        debug!(id = %task.id, path = %task.path, "SubTask::new: called");
        Self {
            id: task.id,
            path: task.path,
            segments: task.segments,
            kind: task.kind,
            schema: task.schema,
            instruction: task.query,
            sibling_context: task.sibling_context,
            dependencies: task.dependencies,
            status: SubTaskStatus::Pending,
            attempts: Vec::new(),
            value: None,
            stats: CompletionStats::default(),
            error: None,
        }
    }

    /// Append an attempt; returns the shared handle
    pub fn record(&mut self, attempt: RetryAttempt) -> Arc<RetryAttempt> {
        debug!(
            id = %self.id,
            attempt = attempt.attempt_number,
            issues = attempt.validation_errors.len(),
            "SubTask::record: called"
        );
        let attempt = Arc::new(attempt);
        self.attempts.push(Arc::clone(&attempt));
        if self.attempts.len() > 1 {
            self.stats.parsing_retries += 1;
        }
        attempt
    }

    pub fn attempts(&self) -> &[Arc<RetryAttempt>] {
        &self.attempts
    }

    pub fn succeed(&mut self, value: Value) {
        self.value = Some(value);
        self.status = SubTaskStatus::Succeeded;
    }

    pub fn fail(&mut self, error: Option<String>) {
        self.error = error;
        self.status = SubTaskStatus::Failed;
    }

    /// Validated value; only set once the task succeeded
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Diagnostics of the most recent attempt
    pub fn last_issues(&self) -> Vec<ValidationIssue> {
        self.attempts
            .last()
            .map(|a| a.validation_errors.clone())
            .unwrap_or_default()
    }
}
