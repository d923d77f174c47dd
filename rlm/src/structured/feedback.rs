//! Instructor-style retry feedback
//!
//! A failed attempt becomes a message naming every missing or invalid field,
//! what was expected and what arrived, plus a snippet of the raw response.

use tracing::debug;

use crate::error::RlmResult;
use crate::prompts::{FeedbackIssue, FeedbackPromptContext, PromptLoader};
use crate::schema::ValidationIssue;

/// Raw response characters quoted back to the model
pub const SNIPPET_CHARS: usize = 200;

/// Render the feedback message for a failed attempt
pub fn feedback_message(
    prompts: &PromptLoader,
    attempt: usize,
    raw_output: &str,
    issues: &[ValidationIssue],
) -> RlmResult<String> {
    debug!(attempt, issues = issues.len(), "feedback_message: called");
    let context = FeedbackPromptContext {
        attempt,
        previous_response: snippet(raw_output.trim()),
        issues: issues
            .iter()
            .map(|issue| FeedbackIssue {
                path: issue.display_path().to_string(),
                expected: issue.expected.clone(),
                received: issue.actual.clone(),
            })
            .collect(),
    };
    prompts.feedback_prompt(&context)
}

fn snippet(text: &str) -> String {
    if text.chars().count() <= SNIPPET_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(SNIPPET_CHARS).collect();
    format!("{head}...")
}
