//! LLM client module
//!
//! Chat-style completion requests against OpenAI-compatible endpoints.

use std::sync::Arc;

use tracing::debug;

pub mod client;
mod error;
mod openai;
mod types;

pub use client::LlmClient;
pub use error::LlmError;
pub use openai::OpenAIClient;
pub use types::{CompletionRequest, CompletionResponse, Message, Role, TokenUsage};

use crate::config::LlmConfig;

/// Create the default client for a configuration
pub fn create_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    debug!(api_base = %config.api_base, "create_client: called");
    Ok(Arc::new(OpenAIClient::from_config(config)?))
}
