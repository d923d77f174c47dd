//! One-shot JSON request/response surface
//!
//! A request names the model, the query and the context, optionally
//! overrides configuration, and optionally asks for structured output.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{RlmError, RlmResult};
use crate::session::CompletionStats;
use crate::structured::StructuredConfig;

/// Incoming request
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Request {
    pub model: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub context: String,
    /// Per-request overrides, see [`Config::apply_request_overrides`]
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    #[serde(default)]
    pub structured: Option<StructuredConfig>,
}

/// Outgoing response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Answer text, or the schema-conformant value for structured requests
    pub result: Value,
    pub stats: CompletionStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_result: Option<bool>,
}

impl Request {
    /// Parse a request document
    pub fn from_json(text: &str) -> RlmResult<Self> {
        serde_json::from_str(text).map_err(|e| RlmError::InvalidRequest(format!("malformed request: {e}")))
    }
}

/// Build the engine a request asks for on top of `base`
pub fn build_engine(request: &Request, base: &Config) -> RlmResult<Engine> {
    debug!(model = %request.model, overrides = request.config.len(), "build_engine: called");
    let mut config = base.clone();
    config.apply_request_overrides(&request.config)?;
    Engine::new(request.model.clone(), config)
}

/// Run a request on an existing engine
pub async fn dispatch(engine: &Engine, request: Request) -> RlmResult<Response> {
    match request.structured {
        Some(structured) => {
            info!("dispatch: structured completion");
            let outcome = engine
                .structured_completion(&request.query, &request.context, structured)
                .await?;
            Ok(Response {
                result: outcome.value,
                stats: outcome.stats,
                structured_result: Some(true),
            })
        }
        None => {
            info!("dispatch: completion");
            let completion = engine.completion(&request.query, &request.context).await?;
            Ok(Response {
                result: Value::String(completion.answer),
                stats: completion.stats,
                structured_result: None,
            })
        }
    }
}

/// Build an engine for `request` and run it
pub async fn handle_request(request: Request, base: &Config) -> RlmResult<Response> {
    let engine = build_engine(&request, base)?;
    dispatch(&engine, request).await
}
