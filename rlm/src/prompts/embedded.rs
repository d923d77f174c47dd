//! Embedded prompts
//!
//! These are compiled into the binary from .pmt files at build time.

use tracing::debug;

/// Minimal REPL system prompt
pub const SYSTEM: &str = include_str!("../../prompts/system.pmt");

/// Step-by-step REPL system prompt
pub const METACOGNITIVE: &str = include_str!("../../prompts/metacognitive.pmt");

/// Structured extraction prompt for one subtask
pub const EXTRACT: &str = include_str!("../../prompts/extract.pmt");

/// Validation feedback block sent after a failed attempt
pub const FEEDBACK: &str = include_str!("../../prompts/feedback.pmt");

/// Get the embedded prompt by name
pub fn get_embedded(name: &str) -> Option<&'static str> {
    debug!(%name, "get_embedded: called");
    match name {
        "system" => Some(SYSTEM),
        "metacognitive" => Some(METACOGNITIVE),
        "extract" => Some(EXTRACT),
        "feedback" => Some(FEEDBACK),
        _ => {
            debug!("get_embedded: no match found");
            None
        }
    }
}
