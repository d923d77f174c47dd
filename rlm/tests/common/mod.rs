//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use rlm::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

type Responder = Box<dyn Fn(&CompletionRequest) -> String + Send + Sync>;

/// Stub model: replies from a queue or from a function of the request
pub struct ScriptedClient {
    queue: Mutex<VecDeque<String>>,
    responder: Option<Responder>,
    delay: Option<Duration>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedClient {
    /// Reply with `responses` in order, then fail
    pub fn queue<S: Into<String>>(responses: impl IntoIterator<Item = S>) -> Self {
        Self {
            queue: Mutex::new(responses.into_iter().map(Into::into).collect()),
            responder: None,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Reply with whatever `f` says for each request
    pub fn respond_with(f: impl Fn(&CompletionRequest) -> String + Send + Sync + 'static) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            responder: Some(Box::new(f)),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before every reply
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let content = match &self.responder {
            Some(f) => f(&request),
            None => self
                .queue
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LlmError::InvalidResponse("script exhausted".to_string()))?,
        };
        Ok(CompletionResponse::text(content))
    }
}

/// Every message of a request joined, for content matching
pub fn transcript(request: &CompletionRequest) -> String {
    request
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n---\n")
}
