//! Coordinator - dispatches subtasks, merges their values, falls back
//!
//! Subtasks with satisfied dependencies run on a bounded pool (a semaphore
//! gating a `JoinSet`). The merge waits for every dispatched subtask. A failed
//! subtask does not cancel its siblings; once all are terminal the merged
//! value is validated container by container, deepest first, ending with the
//! original schema at the root. Any failure triggers exactly one whole-schema
//! fallback.

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StructuredConfig;
use super::executor::SubtaskExecutor;
use super::subtask::{SubTask, SubTaskStatus};
use crate::error::{RlmError, RlmResult};
use crate::prompts::ResolvedValue;
use crate::schema::{
    JsonSchema, SchemaDecomposition, TaskKind, ValidationIssue, decompose, join_path, path_of, validate,
};
use crate::session::CompletionStats;

/// Merged, validated result of a structured completion
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredOutcome {
    pub value: Value,
    pub stats: CompletionStats,
    /// Whether the whole-schema fallback produced the value
    pub used_fallback: bool,
}

/// Runs one structured completion
pub struct Coordinator {
    executor: SubtaskExecutor,
    max_concurrency: usize,
    cancel: CancellationToken,
}

/// What a finished worker hands back
type Finished = (usize, SubTask, RlmResult<()>);

impl Coordinator {
    pub fn new(executor: SubtaskExecutor, max_concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            executor,
            max_concurrency: max_concurrency.max(1),
            cancel,
        }
    }

    /// Extract a value for `config.schema` from `context`
    pub async fn run(&self, query: &str, context: &str, config: &StructuredConfig) -> RlmResult<StructuredOutcome> {
        let decomposition = decompose(&config.schema);
        self.run_decomposed(query, context, config, &decomposition).await
    }

    /// Extract a value for `config.schema` using a prepared decomposition of it
    pub async fn run_decomposed(
        &self,
        query: &str,
        context: &str,
        config: &StructuredConfig,
        decomposition: &SchemaDecomposition,
    ) -> RlmResult<StructuredOutcome> {
        let schema = &config.schema;
        let max_attempts = config.max_retries.max(1);
        info!(
            tasks = decomposition.tasks.len(),
            decomposed = decomposition.is_decomposed(),
            parallel = config.parallel_execution,
            "Starting structured completion"
        );

        let concurrency = if config.parallel_execution { self.max_concurrency } else { 1 };
        let query: Arc<str> = Arc::from(query);
        let context: Arc<str> = Arc::from(context);

        let tasks = self
            .run_tasks(decomposition, &query, &context, max_attempts, concurrency)
            .await?;
        let mut stats = CompletionStats::default();
        for task in &tasks {
            stats.merge(&task.stats);
        }

        let failure = if tasks.iter().all(|t| t.status == SubTaskStatus::Succeeded) {
            let merged = order_like(merge(&tasks), schema);
            match validate_containers(&merged, schema, decomposition) {
                Ok(()) => {
                    info!(llm_calls = stats.llm_calls, "Structured completion succeeded");
                    return Ok(StructuredOutcome {
                        value: merged,
                        stats,
                        used_fallback: false,
                    });
                }
                Err(issues) => {
                    warn!(issues = issues.len(), "Merged value failed validation");
                    issues
                }
            }
        } else {
            let failed: Vec<&str> = tasks
                .iter()
                .filter(|t| t.status != SubTaskStatus::Succeeded)
                .map(|t| t.id.as_str())
                .collect();
            warn!(?failed, "Subtasks failed");
            tasks.iter().flat_map(|t| prefixed(&t.path, t.last_issues())).collect()
        };
        debug!(issues = failure.len(), "Coordinator::run: falling back");

        self.fallback(&query, &context, schema, max_attempts, stats).await
    }

    /// One non-decomposed extraction with its own attempt budget
    async fn fallback(
        &self,
        query: &str,
        context: &str,
        schema: &JsonSchema,
        max_attempts: usize,
        mut stats: CompletionStats,
    ) -> RlmResult<StructuredOutcome> {
        warn!("Running whole-schema fallback");
        let whole = SchemaDecomposition::whole(schema, "");
        let Some(decomposed) = whole.tasks.into_iter().next() else {
            return Err(RlmError::InvalidRequest("empty decomposition".to_string()));
        };
        let mut task = SubTask::new(decomposed);
        let result = self.executor.run(&mut task, query, context, &[], max_attempts).await;
        stats.merge(&task.stats);
        result?;

        match task.value() {
            Some(value) if task.status == SubTaskStatus::Succeeded => {
                info!(llm_calls = stats.llm_calls, "Fallback succeeded");
                Ok(StructuredOutcome {
                    value: order_like(value.clone(), schema),
                    stats,
                    used_fallback: true,
                })
            }
            _ => Err(RlmError::validation(task.attempts().len(), task.last_issues())),
        }
    }

    /// Run every task to a terminal status, honouring dependencies
    async fn run_tasks(
        &self,
        decomposition: &SchemaDecomposition,
        query: &Arc<str>,
        context: &Arc<str>,
        max_attempts: usize,
        concurrency: usize,
    ) -> RlmResult<Vec<SubTask>> {
        debug!(concurrency, "Coordinator::run_tasks: called");
        let mut tasks: Vec<SubTask> = decomposition.tasks.iter().cloned().map(SubTask::new).collect();
        let known: BTreeSet<&str> = decomposition.tasks.iter().map(|t| t.id.as_str()).collect();
        for task in tasks.iter_mut() {
            if let Some(missing) = task.dependencies.iter().find(|d| !known.contains(d.as_str())) {
                warn!(id = %task.id, %missing, "Unknown dependency");
                task.fail(Some(format!("unknown dependency '{missing}'")));
            }
        }

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut running: JoinSet<Finished> = JoinSet::new();
        let mut fatal: Option<RlmError> = None;

        loop {
            self.fail_blocked(&mut tasks);
            for index in ready(&tasks) {
                let resolved = resolved_for(&tasks, &tasks[index].dependencies);
                let mut task = tasks[index].clone();
                tasks[index].status = SubTaskStatus::Running;
                let executor = self.executor.clone();
                let query = Arc::clone(query);
                let context = Arc::clone(context);
                // Dispatch order is acquisition order
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| RlmError::Cancelled)?;
                debug!(id = %task.id, "Coordinator::run_tasks: dispatching");
                running.spawn(async move {
                    let result = executor.run(&mut task, &query, &context, &resolved, max_attempts).await;
                    drop(permit);
                    (index, task, result)
                });
            }

            let Some(joined) = running.join_next().await else { break };
            match joined {
                Ok((index, task, result)) => {
                    info!(id = %task.id, status = %task.status, attempts = task.attempts().len(), "Subtask finished");
                    tasks[index] = task;
                    match result {
                        Err(RlmError::Cancelled) => fatal = Some(RlmError::Cancelled),
                        Err(err) => {
                            if fatal.is_none() {
                                fatal = Some(err);
                            }
                        }
                        Ok(()) => {}
                    }
                }
                Err(err) => warn!(%err, "Subtask worker panicked"),
            }
        }

        // Workers that never reported back
        for task in tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
            task.fail(Some("worker did not finish".to_string()));
        }
        if self.cancel.is_cancelled() || matches!(fatal, Some(RlmError::Cancelled)) {
            return Err(RlmError::Cancelled);
        }
        if let Some(err) = &fatal {
            warn!(%err, "A subtask ended with a fatal error");
        }
        Ok(tasks)
    }

    /// Fail pending tasks whose dependencies can no longer succeed
    fn fail_blocked(&self, tasks: &mut [SubTask]) {
        loop {
            let failed: BTreeSet<String> = tasks
                .iter()
                .filter(|t| t.status == SubTaskStatus::Failed)
                .map(|t| t.id.clone())
                .collect();
            let mut changed = false;
            for task in tasks.iter_mut().filter(|t| t.status == SubTaskStatus::Pending) {
                if let Some(dep) = task.dependencies.iter().find(|d| failed.contains(*d)) {
                    warn!(id = %task.id, %dep, "Dependency failed; subtask skipped");
                    task.fail(Some(format!("dependency '{dep}' failed")));
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }
}

/// Indices of pending tasks whose dependencies all succeeded
fn ready(tasks: &[SubTask]) -> Vec<usize> {
    tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.status == SubTaskStatus::Pending)
        .filter(|(_, t)| {
            t.dependencies.iter().all(|dep| {
                tasks
                    .iter()
                    .any(|other| &other.id == dep && other.status == SubTaskStatus::Succeeded)
            })
        })
        .map(|(i, _)| i)
        .collect()
}

fn resolved_for(tasks: &[SubTask], dependencies: &BTreeSet<String>) -> Vec<ResolvedValue> {
    tasks
        .iter()
        .filter(|t| dependencies.contains(&t.id))
        .filter_map(|t| {
            t.value().map(|value| ResolvedValue {
                path: if t.path.is_empty() { "(root)".to_string() } else { t.path.clone() },
                value: value.to_string(),
            })
        })
        .collect()
}

/// Assemble succeeded task values by path, in task order
pub fn merge(tasks: &[SubTask]) -> Value {
    let mut root = Value::Object(Map::new());
    for task in tasks.iter().filter(|t| t.status == SubTaskStatus::Succeeded) {
        let Some(value) = task.value() else { continue };
        match task.kind {
            TaskKind::Whole => root = value.clone(),
            TaskKind::Fields => {
                if let (Some(target), Value::Object(fields)) = (slot(&mut root, &task.segments), value) {
                    if !target.is_object() {
                        *target = Value::Object(Map::new());
                    }
                    if let Value::Object(map) = target {
                        for (key, field) in fields {
                            if field.is_null() && !task.schema.is_required(key) {
                                continue;
                            }
                            map.insert(key.clone(), field.clone());
                        }
                    }
                }
            }
            TaskKind::Branch => {
                // An optional branch answered with null is left out
                if value.is_null() {
                    continue;
                }
                if let Some(target) = slot(&mut root, &task.segments) {
                    *target = value.clone();
                }
            }
        }
    }
    root
}

/// Mutable slot under the given property names, creating intermediate objects
fn slot<'a>(root: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    let mut current = root;
    for key in segments {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current.as_object_mut()?.entry(key.clone()).or_insert(Value::Null);
    }
    Some(current)
}

fn value_at<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |current, key| current.get(key))
}

fn schema_at<'a>(schema: &'a JsonSchema, segments: &[String]) -> Option<&'a JsonSchema> {
    segments.iter().try_fold(schema, |current, key| current.properties.get(key))
}

/// Validate each container once its subtasks are in, deepest first
///
/// The root is always a container, so the last check is against the
/// original schema.
fn validate_containers(
    merged: &Value,
    schema: &JsonSchema,
    decomposition: &SchemaDecomposition,
) -> Result<(), Vec<ValidationIssue>> {
    for segments in decomposition.containers_bottom_up() {
        let (Some(value), Some(fragment)) = (value_at(merged, segments), schema_at(schema, segments)) else {
            // Absent optional container; the root check decides
            continue;
        };
        let issues = validate(value, fragment);
        if !issues.is_empty() {
            let path = path_of(segments);
            debug!(container = %path, issues = issues.len(), "validate_containers: failed");
            return Err(prefixed(&path, issues));
        }
    }
    Ok(())
}

fn prefixed(path: &str, issues: Vec<ValidationIssue>) -> Vec<ValidationIssue> {
    issues
        .into_iter()
        .map(|mut issue| {
            issue.field_path = match (path.is_empty(), issue.field_path.is_empty()) {
                (true, _) => issue.field_path,
                (false, true) => path.to_string(),
                (false, false) if issue.field_path.starts_with('[') => format!("{path}{}", issue.field_path),
                (false, false) => join_path(path, &issue.field_path),
            };
            issue
        })
        .collect()
}

/// Reorder object keys to follow the schema's property order
fn order_like(value: Value, schema: &JsonSchema) -> Value {
    match value {
        Value::Object(mut map) if !schema.properties.is_empty() => {
            let mut ordered = Map::new();
            for (name, field) in &schema.properties {
                if let Some(v) = map.remove(name) {
                    ordered.insert(name.clone(), order_like(v, field));
                }
            }
            ordered.extend(map);
            Value::Object(ordered)
        }
        Value::Array(items) => match schema.items.as_deref() {
            Some(item_schema) => Value::Array(items.into_iter().map(|v| order_like(v, item_schema)).collect()),
            None => Value::Array(items),
        },
        other => other,
    }
}
