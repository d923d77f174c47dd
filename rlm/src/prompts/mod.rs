//! Prompt template system
//!
//! Loads and renders `.pmt` (prompt template) files.
//!
//! Template loading chain:
//! 1. `{prompts-dir}/{name}.pmt` (user override from the config file)
//! 2. Embedded default compiled into the binary
//!
//! Templates use Handlebars syntax for variable substitution.

pub mod embedded;
mod loader;

pub use loader::{
    ExtractPromptContext, FeedbackIssue, FeedbackPromptContext, PromptLoader, ResolvedValue, SystemPromptContext,
};
