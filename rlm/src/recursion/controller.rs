//! The generate → execute → observe loop
//!
//! Each iteration asks the model for code, runs it in the sandbox and feeds
//! the result back, until the sandbox reports `FINAL`/`FINAL_VAR` or the
//! model answers in plain text. `recursive_llm` calls from inside the sandbox
//! open child sessions through [`ChildSpawner`].

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::parser;
use crate::config::EngineConfig;
use crate::error::{RlmError, RlmResult};
use crate::llm::{CompletionRequest, LlmClient, Message};
use crate::prompts::{PromptLoader, SystemPromptContext};
use crate::sandbox::{Bindings, Sandbox, SandboxResult, SubCompletion};
use crate::session::{CompletionStats, Lineage, Session, Transcript};

/// User turn sent when the query was folded into the context
const EMPTY_QUERY_PROMPT: &str = "Explore the context and answer the question it contains.";

/// Per-request settings of the loop
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub model: String,
    pub recursive_model: String,
    pub max_depth: usize,
    pub max_iterations: usize,
    pub temperature: Option<f32>,
    pub use_metacognitive: bool,
    pub extra_params: serde_json::Map<String, serde_json::Value>,
}

impl ControllerSettings {
    pub fn from_config(model: impl Into<String>, config: &EngineConfig) -> Self {
        let model = model.into();
        Self {
            recursive_model: config.recursive_model.clone().unwrap_or_else(|| model.clone()),
            model,
            max_depth: config.max_depth,
            max_iterations: config.max_iterations,
            temperature: config.temperature,
            use_metacognitive: config.use_metacognitive,
            extra_params: config.extra_params.clone(),
        }
    }
}

/// Answer text plus the counters of the session tree that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub answer: String,
    pub stats: CompletionStats,
}

/// Drives sessions; cheap to clone
#[derive(Clone)]
pub struct RecursionController {
    client: Arc<dyn LlmClient>,
    sandbox: Arc<dyn Sandbox>,
    prompts: Arc<PromptLoader>,
    settings: Arc<ControllerSettings>,
    cancel: CancellationToken,
}

/// A query with an empty context is the context
fn normalize(query: String, context: String) -> (String, String) {
    if context.is_empty() && !query.is_empty() {
        (String::new(), query)
    } else {
        (query, context)
    }
}

impl RecursionController {
    pub fn new(
        client: Arc<dyn LlmClient>,
        sandbox: Arc<dyn Sandbox>,
        prompts: Arc<PromptLoader>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            client,
            sandbox,
            prompts,
            settings: Arc::new(settings),
            cancel: CancellationToken::new(),
        }
    }

    /// Use `cancel` to abort every session this controller runs
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Open a root session over `context` and run it to an answer
    pub async fn run(&self, query: &str, context: &str) -> RlmResult<Completion> {
        let (query, context) = normalize(query.to_string(), context.to_string());
        let mut session = Session::new(
            self.settings.model.clone(),
            self.settings.recursive_model.clone(),
            context,
            self.settings.max_depth,
            self.settings.max_iterations,
        );
        let answer = self.run_in_session(&mut session, &query).await?;
        Ok(Completion {
            answer,
            stats: session.stats(),
        })
    }

    /// Run the loop inside an existing session
    ///
    /// Exceeding the session's iteration budget is fatal here; a parent sees
    /// it as a catchable error inside its sandbox.
    pub async fn run_in_session(&self, session: &mut Session, query: &str) -> RlmResult<String> {
        info!(
            session = %session.id,
            depth = session.depth,
            context_len = session.root_context.len(),
            "Starting session"
        );
        let system = self.prompts.system_prompt(
            &SystemPromptContext {
                context_len: session.root_context.chars().count(),
                depth: session.depth,
                max_depth: session.max_depth,
                query: query.to_string(),
            },
            self.settings.use_metacognitive,
        )?;
        let user = if query.is_empty() { EMPTY_QUERY_PROMPT } else { query };

        let spawner = Arc::new(ChildSpawner::new(self.clone(), session.lineage()));
        let bindings = Bindings {
            context: Arc::clone(&session.root_context),
            query: query.to_string(),
            recurse: spawner.clone(),
            variables: session.variables(),
            cancel: self.cancel.clone(),
        };
        let mut transcript = Transcript::new();

        loop {
            let iteration = session.begin_iteration()?;
            debug!(session = %session.id, iteration, "run_in_session: iteration");

            let mut messages = vec![Message::system(system.clone()), Message::user(user)];
            messages.extend(transcript.to_messages());
            let response = self.call_model(session.active_model(), messages).await?;

            let Some(program) = parser::extract_program(&response) else {
                info!(session = %session.id, iteration, "Session finished with a plain-text answer");
                return Ok(response.trim().to_string());
            };
            transcript.push_assistant(response);

            let executed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(RlmError::Cancelled),
                result = self.sandbox.execute(&program, &bindings) => result,
            };
            session.absorb_child(&spawner.take_stats());
            let result = executed?;

            if let Some(answer) = result.final_answer() {
                info!(session = %session.id, iteration, kind = %result, "Session finished");
                return Ok(answer.trim().to_string());
            }
            if let SandboxResult::RuntimeError(message) = &result {
                warn!(session = %session.id, iteration, %message, "Sandbox error fed back to the model");
            }
            transcript.push_observation(result.observation());
        }
    }

    async fn call_model(&self, model: &str, messages: Vec<Message>) -> RlmResult<String> {
        let mut request = CompletionRequest::new(model, messages);
        request.temperature = self.settings.temperature;
        request.extra = self.settings.extra_params.clone();
        debug!(%model, messages = request.messages.len(), "call_model: called");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RlmError::Cancelled),
            response = self.client.complete(request) => Ok(response?.content),
        }
    }
}

/// `recursive_llm` implementation handed to the sandbox
///
/// Children run to completion before the parent's sandbox resumes; their
/// counters are collected here and folded into the parent afterwards.
pub struct ChildSpawner {
    controller: RecursionController,
    lineage: Lineage,
    stats: Mutex<CompletionStats>,
}

impl ChildSpawner {
    pub fn new(controller: RecursionController, lineage: Lineage) -> Self {
        Self {
            controller,
            lineage,
            stats: Mutex::new(CompletionStats::default()),
        }
    }

    /// Counters of children finished since the last call
    pub fn take_stats(&self) -> CompletionStats {
        std::mem::take(&mut *self.stats.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl SubCompletion for ChildSpawner {
    async fn complete(&self, query: String, context: String) -> RlmResult<String> {
        let (query, context) = normalize(query, context);
        let mut child = self.lineage.child(context)?;
        let result = self.controller.run_in_session(&mut child, &query).await;
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .merge(&child.stats());
        if let Err(err) = &result {
            warn!(child = %child.id, %err, "Child session failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LimitExceeded;
    use crate::llm::client::mock::MockLlmClient;
    use crate::sandbox::ScriptSandbox;

    fn controller(client: Arc<MockLlmClient>, max_depth: usize, max_iterations: usize) -> RecursionController {
        let config = EngineConfig {
            max_depth,
            max_iterations,
            recursive_model: Some("small".to_string()),
            ..EngineConfig::default()
        };
        RecursionController::new(
            client,
            Arc::new(ScriptSandbox::default()),
            Arc::new(PromptLoader::embedded_only()),
            ControllerSettings::from_config("big", &config),
        )
    }

    #[tokio::test]
    async fn test_final_after_exploration() {
        let client = Arc::new(MockLlmClient::new([
            "```js\nprint(context.slice(0, 5))\n```",
            "```js\nconst n = context.split(' ').length;\nFINAL(`${n} words`)\n```",
        ]));
        let result = controller(client.clone(), 2, 5).run("count words", "hello big world").await.unwrap();
        assert_eq!(result.answer, "3 words");
        assert_eq!(result.stats.llm_calls, 2);
        assert_eq!(result.stats.iterations, 2);
        assert_eq!(result.stats.depth, 0);

        // The observation of the first turn is sent with the second call
        let requests = client.requests();
        assert_eq!(requests[0].model, "big");
        let second = &requests[1].messages;
        assert_eq!(second.len(), 4);
        assert_eq!(second[3].content, "hello");
    }

    #[tokio::test]
    async fn test_plain_text_is_final_answer() {
        let client = Arc::new(MockLlmClient::new(["  Paris  "]));
        let result = controller(client.clone(), 1, 3).run("capital?", "France").await.unwrap();
        assert_eq!(result.answer, "Paris");
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_iteration_limit_is_fatal() {
        let client = Arc::new(MockLlmClient::new(["```js\nprint('still looking')\n```", "unused"]));
        let err = controller(client.clone(), 1, 1).run("q", "ctx").await.unwrap_err();
        assert!(matches!(
            err,
            RlmError::LimitExceeded(LimitExceeded::Iterations { max_iterations: 1 })
        ));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_runtime_error_is_observed() {
        let client = Arc::new(MockLlmClient::new(["```js\nmissing()\n```", "FINAL('recovered')"]));
        let result = controller(client.clone(), 1, 3).run("q", "ctx").await.unwrap();
        assert_eq!(result.answer, "recovered");
        let observation = &client.requests()[1].messages[3].content;
        assert!(observation.starts_with("Error: ReferenceError"));
    }

    #[tokio::test]
    async fn test_child_session_counts_roll_up() {
        // Root asks a sub-question; the child answers on its first call
        let client = Arc::new(MockLlmClient::new([
            "```js\nconst part = recursive_llm('first word?', context.slice(0, 5));\nFINAL(part.toUpperCase())\n```",
            "hello",
        ]));
        let result = controller(client.clone(), 1, 3).run("q", "hello world").await.unwrap();
        assert_eq!(result.answer, "HELLO");
        assert_eq!(result.stats.llm_calls, 2);
        assert_eq!(result.stats.iterations, 1);
        assert_eq!(client.requests()[1].model, "small");
    }

    #[tokio::test]
    async fn test_depth_limit_surfaces_as_observation() {
        let client = Arc::new(MockLlmClient::new([
            "```js\nrecursive_llm('sub', 'text')\n```",
            "FINAL('gave up on recursion')",
        ]));
        let result = controller(client.clone(), 0, 3).run("q", "ctx").await.unwrap();
        assert_eq!(result.answer, "gave up on recursion");
        let observation = &client.requests()[1].messages[3].content;
        assert!(observation.contains("max recursion depth (0) exceeded"));
    }

    #[tokio::test]
    async fn test_query_without_context_becomes_context() {
        let client = Arc::new(MockLlmClient::new(["```js\nFINAL(context + '|' + query)\n```"]));
        let result = controller(client, 1, 2).run("only text", "").await.unwrap();
        assert_eq!(result.answer, "only text|");
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let client = Arc::new(MockLlmClient::new(["FINAL('x')"]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = controller(client.clone(), 1, 2)
            .with_cancel(cancel)
            .run("q", "ctx")
            .await
            .unwrap_err();
        assert!(matches!(err, RlmError::Cancelled));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_variables_persist_across_iterations() {
        let client = Arc::new(MockLlmClient::new([
            "```js\nconst found = re.findall('\\\\d+', context);\n```",
            "```js\nFINAL_VAR(found)\n```",
        ]));
        let result = controller(client, 1, 3).run("numbers?", "a1 b22 c333").await.unwrap();
        assert_eq!(result.answer, r#"["1","22","333"]"#);
    }
}
