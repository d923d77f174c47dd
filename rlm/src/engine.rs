//! Engine - library entry point
//!
//! Owns the client, sandbox and prompt loader for one model and hands out a
//! fresh controller per request. Every request runs under a child of the
//! engine's cancellation token, optionally bounded by a timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{RlmError, RlmResult};
use crate::llm::{LlmClient, create_client};
use crate::prompts::PromptLoader;
use crate::recursion::{Completion, ControllerSettings, RecursionController};
use crate::sandbox::{Sandbox, ScriptSandbox};
use crate::schema;
use crate::structured::{Coordinator, ExecutorSettings, StructuredConfig, StructuredOutcome, SubtaskExecutor};

/// Recursive completion engine for one model
#[derive(Clone)]
pub struct Engine {
    model: String,
    config: Config,
    client: Arc<dyn LlmClient>,
    sandbox: Arc<dyn Sandbox>,
    prompts: Arc<PromptLoader>,
    cancel: CancellationToken,
}

impl Engine {
    /// Build an engine talking to the configured OpenAI-compatible endpoint
    pub fn new(model: impl Into<String>, config: Config) -> RlmResult<Self> {
        let model = model.into();
        debug!(%model, "Engine::new: called");
        if model.trim().is_empty() {
            return Err(RlmError::InvalidRequest("model is required".to_string()));
        }
        config.validate()?;
        let client = create_client(&config.llm)?;
        let sandbox: Arc<dyn Sandbox> = Arc::new(ScriptSandbox::from_config(&config.engine));
        let prompts = Arc::new(PromptLoader::new(config.prompts_dir.as_deref()));
        Ok(Self {
            model,
            config,
            client,
            sandbox,
            prompts,
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the completion client
    pub fn with_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.client = client;
        self
    }

    /// Replace the code executor
    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Cancelling this token aborts every request in flight
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Answer `query` over `context`
    pub async fn completion(&self, query: &str, context: &str) -> RlmResult<Completion> {
        info!(model = %self.model, context_len = context.len(), "Starting completion");
        let cancel = self.cancel.child_token();
        let controller = self.controller(cancel.clone());
        let completion = self.bounded(cancel, controller.run(query, context)).await?;
        info!(
            llm_calls = completion.stats.llm_calls,
            iterations = completion.stats.iterations,
            "Completion finished"
        );
        Ok(completion)
    }

    /// Extract a value conforming to `structured.schema` from `context`
    pub async fn structured_completion(
        &self,
        query: &str,
        context: &str,
        structured: StructuredConfig,
    ) -> RlmResult<StructuredOutcome> {
        info!(model = %self.model, context_len = context.len(), "Starting structured completion");
        schema::check_schema(&structured.schema).map_err(|e| RlmError::InvalidRequest(format!("invalid schema: {e}")))?;
        // Same convention as plain completions: a lone query is the context
        let context = if context.is_empty() { query } else { context };
        let cancel = self.cancel.child_token();
        let executor = SubtaskExecutor::new(
            Arc::clone(&self.client),
            self.controller(cancel.clone()),
            Arc::clone(&self.prompts),
            ExecutorSettings::from_config(self.model.clone(), &self.config.engine),
            cancel.clone(),
        );
        let coordinator = Coordinator::new(executor, self.config.engine.max_concurrency, cancel.clone());
        self.bounded(cancel, coordinator.run(query, context, &structured)).await
    }

    fn controller(&self, cancel: CancellationToken) -> RecursionController {
        RecursionController::new(
            Arc::clone(&self.client),
            Arc::clone(&self.sandbox),
            Arc::clone(&self.prompts),
            ControllerSettings::from_config(self.model.clone(), &self.config.engine),
        )
        .with_cancel(cancel)
    }

    /// Apply the configured timeout, cancelling the request tree on expiry
    async fn bounded<T>(&self, cancel: CancellationToken, work: impl Future<Output = RlmResult<T>>) -> RlmResult<T> {
        let Some(secs) = self.config.engine.timeout_secs else {
            return work.await;
        };
        let limit = Duration::from_secs(secs);
        match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_secs = secs, "Request timed out; cancelling");
                cancel.cancel();
                Err(RlmError::Timeout(limit))
            }
        }
    }
}
