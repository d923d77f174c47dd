//! Configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::RlmError;

/// Default completion endpoint base
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Request-level keys that belong to wrappers, never to the completion body
const IGNORED_REQUEST_KEYS: &[&str] = &[
    "pythonia_timeout",
    "go_binary_path",
    "bridge",
    "structured",
    "meta_agent",
    "observability",
    "debug",
    "trace_enabled",
    "trace_endpoint",
    "service_name",
    "log_output",
    "langfuse_enabled",
    "langfuse_public_key",
    "langfuse_secret_key",
    "langfuse_host",
    "parallel",
];

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Directory with `.pmt` files overriding the embedded prompts
    #[serde(rename = "prompts-dir")]
    pub prompts_dir: Option<PathBuf>,

    /// Completion endpoint configuration
    pub llm: LlmConfig,

    /// Recursion and structured-output limits
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .rlm.yml
        let local_config = PathBuf::from(".rlm.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/rlm/rlm.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("rlm").join("rlm.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load only the log level, before logging is initialised
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Check limits before use
    pub fn validate(&self) -> Result<(), RlmError> {
        if self.engine.max_iterations == 0 {
            return Err(RlmError::InvalidRequest("max_iterations must be at least 1".to_string()));
        }
        if self.engine.max_concurrency == 0 {
            return Err(RlmError::InvalidRequest("max_concurrency must be at least 1".to_string()));
        }
        if self.engine.max_output_chars == 0 {
            return Err(RlmError::InvalidRequest("max_output_chars must be at least 1".to_string()));
        }
        if self.engine.script_timeout_ms == 0 || self.engine.script_memory_mb == 0 {
            return Err(RlmError::InvalidRequest(
                "script_timeout_ms and script_memory_mb must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply the `config` object of a JSON request on top of this configuration
    ///
    /// Known keys update the matching setting; wrapper-only keys are dropped;
    /// everything else becomes an extra completion body parameter.
    pub fn apply_request_overrides(&mut self, overrides: &serde_json::Map<String, Value>) -> Result<(), RlmError> {
        debug!(keys = overrides.len(), "apply_request_overrides: called");
        for (key, value) in overrides {
            match key.as_str() {
                "recursive_model" => self.engine.recursive_model = non_empty_string(value),
                "api_base" => {
                    if let Some(base) = non_empty_string(value) {
                        self.llm.api_base = base;
                    }
                }
                "api_key" => self.llm.api_key = non_empty_string(value),
                "max_depth" => self.engine.max_depth = require_uint(key, value)? as usize,
                "max_iterations" => self.engine.max_iterations = require_uint(key, value)? as usize,
                "max_concurrency" => self.engine.max_concurrency = require_uint(key, value)? as usize,
                "timeout" => {
                    let secs = require_uint(key, value)?;
                    self.engine.timeout_secs = (secs > 0).then_some(secs);
                }
                "temperature" => {
                    let temp = as_f64(value)
                        .ok_or_else(|| RlmError::InvalidRequest(format!("{key} must be a number")))?;
                    self.engine.temperature = Some(temp as f32);
                }
                "use_metacognitive" | "metacognitive" => {
                    if let Some(flag) = value.as_bool() {
                        self.engine.use_metacognitive = flag;
                    }
                }
                k if IGNORED_REQUEST_KEYS.contains(&k) => {
                    debug!(key = %k, "apply_request_overrides: ignoring wrapper key");
                }
                _ => {
                    self.engine.extra_params.insert(key.clone(), value.clone());
                }
            }
        }
        self.validate()
    }
}

fn non_empty_string(value: &Value) -> Option<String> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn require_uint(key: &str, value: &Value) -> Result<u64, RlmError> {
    match as_f64(value) {
        Some(n) if n >= 0.0 && n.is_finite() => Ok(n as u64),
        _ => Err(RlmError::InvalidRequest(format!("{key} must be a non-negative integer"))),
    }
}

/// Completion endpoint configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// API base URL, or a full `/chat/completions` URL
    #[serde(rename = "api-base")]
    pub api_base: String,

    /// Literal API key (takes precedence over `api-key-env`)
    #[serde(rename = "api-key")]
    pub api_key: Option<String>,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Retries for retryable HTTP statuses and network errors
    #[serde(rename = "max-retries")]
    pub max_retries: u32,
}

impl LlmConfig {
    /// Resolve the API key: literal first, then the environment
    ///
    /// A missing key is fine for local endpoints; the Authorization header is
    /// then left off.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty()))
    }

    /// Full chat completions URL for `api_base`
    pub fn endpoint(&self) -> String {
        let base = self.api_base.trim();
        let base = if base.is_empty() { DEFAULT_API_BASE } else { base };
        if base.contains("/chat/completions") {
            return base.to_string();
        }
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_ms: 60_000,
            max_retries: 2,
        }
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_env", &self.api_key_env)
            .field("timeout_ms", &self.timeout_ms)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Recursion and structured-output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Model for sessions below the root (defaults to the root model)
    #[serde(rename = "recursive-model")]
    pub recursive_model: Option<String>,

    /// Deepest allowed session depth (root is 0)
    #[serde(rename = "max-depth")]
    pub max_depth: usize,

    /// Model calls allowed per session
    #[serde(rename = "max-iterations")]
    pub max_iterations: usize,

    /// Sampling temperature
    pub temperature: Option<f32>,

    /// Use the step-by-step system prompt
    #[serde(rename = "use-metacognitive")]
    pub use_metacognitive: bool,

    /// Sandbox observation size before truncation
    #[serde(rename = "max-output-chars")]
    pub max_output_chars: usize,

    /// Time a single script may spend running, excluding nested completions
    #[serde(rename = "script-timeout-ms")]
    pub script_timeout_ms: u64,

    /// Script heap limit in MiB, on top of room for the context itself
    #[serde(rename = "script-memory-mb")]
    pub script_memory_mb: usize,

    /// Largest context embedded directly in extraction prompts
    #[serde(rename = "inline-context-limit")]
    pub inline_context_limit: usize,

    /// Concurrent subtasks during parallel structured extraction
    #[serde(rename = "max-concurrency")]
    pub max_concurrency: usize,

    /// Wall-clock bound per top-level request
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: Option<u64>,

    /// Extra parameters copied into every completion request body
    #[serde(rename = "extra-params")]
    pub extra_params: serde_json::Map<String, Value>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recursive_model: None,
            max_depth: 5,
            max_iterations: 30,
            temperature: None,
            use_metacognitive: false,
            max_output_chars: 2000,
            script_timeout_ms: 10_000,
            script_memory_mb: 256,
            inline_context_limit: 200_000,
            max_concurrency: 8,
            timeout_secs: None,
            extra_params: serde_json::Map::new(),
        }
    }
}
