//! Subtask Executor: the per-subtask validation/retry loop
//!
//! Small contexts are embedded in the extraction prompt and each attempt is a
//! single chat call; the conversation grows by the model's answer and a
//! feedback block after every rejected attempt. Contexts above the inline
//! limit run each attempt through the recursion controller instead, with the
//! accumulated feedback appended to its query.

use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::feedback::feedback_message;
use super::subtask::{RetryAttempt, SubTask, SubTaskStatus};
use crate::config::EngineConfig;
use crate::error::{RlmError, RlmResult};
use crate::extract::{extract_json_candidates, extract_scalar, strip_fences};
use crate::llm::{CompletionRequest, LlmClient, Message};
use crate::prompts::{ExtractPromptContext, PromptLoader, ResolvedValue};
use crate::recursion::RecursionController;
use crate::schema::{JsonSchema, SchemaType, ValidationIssue, build_example, describe_constraints, validate};
use crate::session::CompletionStats;

/// Settings for direct extraction calls
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub model: String,
    pub temperature: Option<f32>,
    pub extra_params: serde_json::Map<String, Value>,
    /// Contexts up to this many characters are embedded in the prompt
    pub inline_context_limit: usize,
}

impl ExecutorSettings {
    pub fn from_config(model: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            model: model.into(),
            temperature: config.temperature,
            extra_params: config.extra_params.clone(),
            inline_context_limit: config.inline_context_limit,
        }
    }
}

/// Runs subtasks to a terminal status; cheap to clone
#[derive(Clone)]
pub struct SubtaskExecutor {
    client: Arc<dyn LlmClient>,
    controller: RecursionController,
    prompts: Arc<PromptLoader>,
    settings: Arc<ExecutorSettings>,
    cancel: CancellationToken,
}

impl SubtaskExecutor {
    pub fn new(
        client: Arc<dyn LlmClient>,
        controller: RecursionController,
        prompts: Arc<PromptLoader>,
        settings: ExecutorSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            controller,
            prompts,
            settings: Arc::new(settings),
            cancel,
        }
    }

    /// Attempt `task` up to `max_attempts` times
    ///
    /// Leaves the task `Succeeded` or `Failed`. Returns `Err` only for errors
    /// that no retry can fix (transport, cancellation, prompt rendering); the
    /// task is marked `Failed` first.
    pub async fn run(
        &self,
        task: &mut SubTask,
        query: &str,
        context: &str,
        resolved: &[ResolvedValue],
        max_attempts: usize,
    ) -> RlmResult<()> {
        let max_attempts = max_attempts.max(1);
        let context_len = context.chars().count();
        let inline = context_len <= self.settings.inline_context_limit;
        debug!(id = %task.id, inline, context_len, max_attempts, "SubtaskExecutor::run: called");
        task.status = SubTaskStatus::Running;

        let prompt = match self.render_prompt(task, query, context, context_len, resolved, inline) {
            Ok(prompt) => prompt,
            Err(err) => {
                task.fail(Some(err.to_string()));
                return Err(err);
            }
        };
        let mut messages = vec![Message::user(prompt.clone())];
        let mut feedback_log: Vec<String> = Vec::new();

        for attempt_number in 1..=max_attempts {
            let called = if inline {
                self.call_direct(&messages, &mut task.stats).await
            } else {
                let mut recursive_query = prompt.clone();
                for feedback in &feedback_log {
                    recursive_query.push_str("\n\n");
                    recursive_query.push_str(feedback);
                }
                self.call_recursive(&recursive_query, context, &mut task.stats).await
            };

            let (raw_output, extracted, issues) = match called {
                Ok(raw) => {
                    let (extracted, issues) = extract_value(&raw, &task.schema);
                    (raw, extracted, issues)
                }
                Err(err) if err.is_limit_exceeded() => {
                    warn!(id = %task.id, attempt_number, %err, "Extraction session hit a limit");
                    (err.to_string(), None, vec![ValidationIssue::no_json(&task.schema)])
                }
                Err(err) => {
                    warn!(id = %task.id, attempt_number, %err, "Subtask aborted");
                    task.fail(Some(err.to_string()));
                    return Err(err);
                }
            };

            if let Some(value) = extracted.clone().filter(|_| issues.is_empty()) {
                task.record(RetryAttempt {
                    attempt_number,
                    raw_output,
                    extracted,
                    validation_errors: issues,
                    feedback: None,
                });
                info!(id = %task.id, attempt_number, "Subtask succeeded");
                task.succeed(value);
                return Ok(());
            }

            warn!(
                id = %task.id,
                attempt_number,
                issues = issues.len(),
                "Subtask attempt failed validation"
            );
            let feedback = if attempt_number < max_attempts {
                Some(feedback_message(&self.prompts, attempt_number, &raw_output, &issues)?)
            } else {
                None
            };
            if let Some(feedback) = &feedback {
                messages.push(Message::assistant(raw_output.clone()));
                messages.push(Message::user(feedback.clone()));
                feedback_log.push(feedback.clone());
            }
            task.record(RetryAttempt {
                attempt_number,
                raw_output,
                extracted,
                validation_errors: issues,
                feedback,
            });
        }

        warn!(id = %task.id, attempts = max_attempts, "Subtask failed after exhausting attempts");
        task.fail(None);
        Ok(())
    }

    fn render_prompt(
        &self,
        task: &SubTask,
        query: &str,
        context: &str,
        context_len: usize,
        resolved: &[ResolvedValue],
        inline: bool,
    ) -> RlmResult<String> {
        let required_fields = if task.schema.is_object() {
            task.schema.required.clone()
        } else {
            task.schema
                .items
                .as_deref()
                .filter(|items| items.is_object())
                .map(|items| items.required.clone())
                .unwrap_or_default()
        };
        let example = build_example(&task.schema)
            .or_else(|| task.schema.items.as_deref().and_then(build_example).map(|item| Value::Array(vec![item])))
            .and_then(|value| serde_json::to_string_pretty(&value).ok());

        self.prompts.extract_prompt(&ExtractPromptContext {
            query: query.to_string(),
            instruction: task.instruction.clone(),
            schema_json: task.schema.to_pretty_json(),
            required_fields,
            constraints: describe_constraints(&task.schema),
            example,
            sibling_context: task.sibling_context.clone(),
            resolved: resolved.to_vec(),
            inline,
            context: if inline { context.to_string() } else { String::new() },
            context_len,
        })
    }

    async fn call_direct(&self, messages: &[Message], stats: &mut CompletionStats) -> RlmResult<String> {
        let mut request = CompletionRequest::new(self.settings.model.clone(), messages.to_vec());
        request.temperature = self.settings.temperature;
        request.extra = self.settings.extra_params.clone();
        debug!(messages = messages.len(), "SubtaskExecutor::call_direct: called");
        stats.llm_calls += 1;
        stats.iterations += 1;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RlmError::Cancelled),
            response = self.client.complete(request) => Ok(response?.content),
        }
    }

    async fn call_recursive(&self, query: &str, context: &str, stats: &mut CompletionStats) -> RlmResult<String> {
        debug!(query_len = query.len(), "SubtaskExecutor::call_recursive: called");
        let completion = self.controller.run(query, context).await?;
        stats.merge(&completion.stats);
        Ok(completion.answer)
    }
}

/// Pull a value for `schema` out of a model response
///
/// Tries every JSON span in the response, each also unwrapped from a
/// single-key object (`{"value": [...]}`), plus the bare response as a scalar.
/// The first candidate that validates wins; otherwise the first candidate is
/// returned with its issues.
pub fn extract_value(text: &str, schema: &JsonSchema) -> (Option<Value>, Vec<ValidationIssue>) {
    let mut candidates = Vec::new();
    for candidate in extract_json_candidates(text) {
        let unwrapped = match &candidate {
            Value::Object(map) if map.len() == 1 && !schema.is_object() => map.values().next().cloned(),
            _ => None,
        };
        candidates.push(candidate);
        candidates.extend(unwrapped);
    }

    let scalar = extract_scalar(text).or_else(|| {
        let body = strip_fences(text);
        (schema.schema_type() == Some(SchemaType::String) && candidates.is_empty() && !body.is_empty())
            .then(|| Value::String(body.to_string()))
    });
    if let Some(scalar) = scalar {
        if schema.is_object() || schema.is_array() {
            candidates.push(scalar);
        } else {
            candidates.insert(0, scalar);
        }
    }

    let mut first: Option<(Value, Vec<ValidationIssue>)> = None;
    for candidate in candidates {
        let issues = validate(&candidate, schema);
        if issues.is_empty() {
            return (Some(candidate), issues);
        }
        if first.is_none() {
            first = Some((candidate, issues));
        }
    }
    match first {
        Some((value, issues)) => (Some(value), issues),
        None => (None, vec![ValidationIssue::no_json(schema)]),
    }
}
