//! Structured-output engine
//!
//! Decomposes a JSON Schema into subtasks, extracts each with a
//! validation-feedback retry loop, merges the values and validates the result
//! against the original schema, with one whole-schema fallback.

mod coordinator;
mod executor;
mod feedback;
mod subtask;

use serde::{Deserialize, Serialize};

use crate::schema::JsonSchema;

pub use coordinator::{Coordinator, StructuredOutcome, merge};
pub use executor::{ExecutorSettings, SubtaskExecutor, extract_value};
pub use feedback::feedback_message;
pub use subtask::{RetryAttempt, SubTask, SubTaskStatus};

/// Default total attempts per subtask
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Structured-completion options carried by a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredConfig {
    pub schema: JsonSchema,

    /// Run independent subtasks concurrently
    #[serde(default = "default_parallel", alias = "parallel_execution")]
    pub parallel_execution: bool,

    /// Total attempts per subtask, and for the fallback
    #[serde(default = "default_max_retries", alias = "max_retries")]
    pub max_retries: usize,
}

fn default_parallel() -> bool {
    true
}

fn default_max_retries() -> usize {
    DEFAULT_MAX_RETRIES
}

impl StructuredConfig {
    pub fn new(schema: JsonSchema) -> Self {
        Self {
            schema,
            parallel_execution: default_parallel(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_defaults() {
        let config: StructuredConfig = serde_json::from_value(json!({"schema": {"type": "string"}})).unwrap();
        assert!(config.parallel_execution);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_config_camel_and_snake_case() {
        let camel: StructuredConfig = serde_json::from_value(json!({
            "schema": {"type": "string"},
            "parallelExecution": false,
            "maxRetries": 5
        }))
        .unwrap();
        let snake: StructuredConfig = serde_json::from_value(json!({
            "schema": {"type": "string"},
            "parallel_execution": false,
            "max_retries": 5
        }))
        .unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.max_retries, 5);
    }
}
