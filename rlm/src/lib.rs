//! rlm - recursive language model engine
//!
//! Answers queries over contexts far larger than a model's window by keeping
//! the context in a sandbox variable the model explores with code, delegating
//! sub-questions to nested sessions. Structured requests decompose a JSON
//! Schema into independently validated subtasks.
//!
//! # Modules
//!
//! - [`engine`] - Library facade: plain and structured completions
//! - [`recursion`] - Generate → execute → observe loop and child sessions
//! - [`sandbox`] - Embedded QuickJS sandbox for model-written scripts
//! - [`structured`] - Subtasks, retry feedback, coordinator and fallback
//! - [`schema`] - JSON Schema model, validation and decomposition
//! - [`extract`] - Balanced JSON extraction from model output
//! - [`llm`] - Chat completion client
//! - [`request`] - JSON request/response surface used by the binary

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod llm;
pub mod prompts;
pub mod recursion;
pub mod request;
pub mod sandbox;
pub mod schema;
pub mod session;
pub mod structured;

pub use config::Config;
pub use engine::Engine;
pub use error::{LimitExceeded, RlmError, RlmResult};
pub use recursion::Completion;
pub use request::{Request, Response, handle_request};
pub use session::CompletionStats;
pub use structured::{StructuredConfig, StructuredOutcome};
