//! Prompt loader
//!
//! Loads prompt templates from the override directory or falls back to the
//! embedded defaults, then renders them with Handlebars.

use handlebars::Handlebars;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::embedded;
use crate::error::{RlmError, RlmResult};

/// Render context for the REPL system prompts
#[derive(Debug, Clone, Serialize)]
pub struct SystemPromptContext {
    /// Context length in characters
    pub context_len: usize,
    pub depth: usize,
    pub max_depth: usize,
    pub query: String,
}

/// A dependency value already known when a subtask runs
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedValue {
    pub path: String,
    /// Compact JSON
    pub value: String,
}

/// Render context for one extraction attempt
#[derive(Debug, Clone, Serialize)]
pub struct ExtractPromptContext {
    /// The caller's original query
    pub query: String,
    /// What this subtask extracts
    pub instruction: String,
    /// Pretty-printed sub-schema
    pub schema_json: String,
    pub required_fields: Vec<String>,
    /// Natural-language constraint lines
    pub constraints: Vec<String>,
    /// Example value built from the required fields
    pub example: Option<String>,
    pub sibling_context: Vec<String>,
    pub resolved: Vec<ResolvedValue>,
    /// Whether the context text is embedded in the prompt
    pub inline: bool,
    pub context: String,
    pub context_len: usize,
}

/// One line of a feedback block
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackIssue {
    pub path: String,
    pub expected: String,
    pub received: String,
}

/// Render context for a feedback block
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackPromptContext {
    pub attempt: usize,
    /// Start of the rejected response
    pub previous_response: String,
    pub issues: Vec<FeedbackIssue>,
}

/// Loads and renders prompt templates
pub struct PromptLoader {
    /// Handlebars template engine
    hbs: Handlebars<'static>,
    /// User override directory (`prompts-dir` in the config file)
    user_dir: Option<PathBuf>,
}

impl PromptLoader {
    /// Create a loader that checks `prompts_dir` before the embedded defaults
    pub fn new(prompts_dir: Option<&Path>) -> Self {
        debug!(?prompts_dir, "PromptLoader::new: called");
        let user_dir = prompts_dir.filter(|dir| dir.is_dir()).map(Path::to_path_buf);
        if prompts_dir.is_some() && user_dir.is_none() {
            debug!("PromptLoader::new: override directory missing, using embedded prompts");
        }
        Self {
            hbs: Self::engine(),
            user_dir,
        }
    }

    /// Create a loader that only uses embedded prompts
    pub fn embedded_only() -> Self {
        debug!("PromptLoader::embedded_only: called");
        Self {
            hbs: Self::engine(),
            user_dir: None,
        }
    }

    fn engine() -> Handlebars<'static> {
        let mut hbs = Handlebars::new();
        // Prompts are plain text, never HTML
        hbs.register_escape_fn(handlebars::no_escape);
        hbs
    }

    /// Load a template by name
    ///
    /// Checks in order:
    /// 1. User override: `{prompts-dir}/{name}.pmt`
    /// 2. Embedded fallback
    pub fn load_template(&self, name: &str) -> RlmResult<String> {
        debug!(%name, "PromptLoader::load_template: called");
        if let Some(ref user_dir) = self.user_dir {
            let path = user_dir.join(format!("{name}.pmt"));
            if path.exists() {
                debug!(?path, "PromptLoader::load_template: found in user override");
                return std::fs::read_to_string(&path)
                    .map_err(|e| RlmError::Prompt(format!("failed to read prompt {}: {e}", path.display())));
            }
        }

        embedded::get_embedded(name)
            .map(str::to_string)
            .ok_or_else(|| RlmError::Prompt(format!("prompt template not found: {name}")))
    }

    /// Render a template with the given context
    pub fn render<T: Serialize>(&self, template_name: &str, context: &T) -> RlmResult<String> {
        debug!(%template_name, "PromptLoader::render: called");
        let template = self.load_template(template_name)?;
        Ok(self.hbs.render_template(&template, context)?)
    }

    /// System prompt for a REPL session
    pub fn system_prompt(&self, context: &SystemPromptContext, metacognitive: bool) -> RlmResult<String> {
        let name = if metacognitive { "metacognitive" } else { "system" };
        info!(template = name, depth = context.depth, "Rendering system prompt");
        self.render(name, context)
    }

    /// Prompt for one extraction attempt
    pub fn extract_prompt(&self, context: &ExtractPromptContext) -> RlmResult<String> {
        self.render("extract", context)
    }

    /// Feedback block naming every problem of a rejected attempt
    pub fn feedback_prompt(&self, context: &FeedbackPromptContext) -> RlmResult<String> {
        self.render("feedback", context)
    }
}

impl Default for PromptLoader {
    fn default() -> Self {
        Self::embedded_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract_context() -> ExtractPromptContext {
        ExtractPromptContext {
            query: "Analyze the review".to_string(),
            instruction: "Extract the sentiment from the context.".to_string(),
            schema_json: "{\"type\": \"object\"}".to_string(),
            required_fields: vec!["score".to_string(), "confidence".to_string()],
            constraints: vec!["score: must be a number between 1 and 5".to_string()],
            example: Some("{\"score\": 3}".to_string()),
            sibling_context: vec!["phrases: array of object".to_string()],
            resolved: vec![],
            inline: true,
            context: "Great product & fast shipping".to_string(),
            context_len: 29,
        }
    }

    #[test]
    fn test_system_prompt_renders_values() {
        let loader = PromptLoader::embedded_only();
        let ctx = SystemPromptContext {
            context_len: 1234,
            depth: 1,
            max_depth: 5,
            query: "Who wins?".to_string(),
        };
        let prompt = loader.system_prompt(&ctx, false).unwrap();
        assert!(prompt.contains("1234 characters"));
        assert!(prompt.contains("Depth: 1 of 5"));
        assert!(prompt.contains("(\"Who wins?\")"));

        let meta = loader.system_prompt(&ctx, true).unwrap();
        assert!(meta.contains("step by step"));
    }

    #[test]
    fn test_extract_prompt_inline() {
        let loader = PromptLoader::embedded_only();
        let prompt = loader.extract_prompt(&extract_context()).unwrap();
        assert!(prompt.starts_with("Task: Analyze the review"));
        assert!(prompt.contains("REQUIRED FIELDS (must be present): score, confidence"));
        assert!(prompt.contains("- score: must be a number between 1 and 5"));
        assert!(prompt.contains("- phrases: array of object"));
        // No HTML escaping
        assert!(prompt.contains("Great product & fast shipping"));
        assert!(!prompt.contains("FINAL_VAR"));
    }

    #[test]
    fn test_extract_prompt_variable_context() {
        let loader = PromptLoader::embedded_only();
        let mut ctx = extract_context();
        ctx.inline = false;
        ctx.context = String::new();
        let prompt = loader.extract_prompt(&ctx).unwrap();
        assert!(prompt.contains("in the variable `context`"));
        assert!(prompt.contains("FINAL_VAR(result)"));
    }

    #[test]
    fn test_feedback_prompt_names_fields() {
        let loader = PromptLoader::embedded_only();
        let ctx = FeedbackPromptContext {
            attempt: 1,
            previous_response: "{\"label\": \"x\"}".to_string(),
            issues: vec![FeedbackIssue {
                path: "score".to_string(),
                expected: "required field (number)".to_string(),
                received: "missing".to_string(),
            }],
        };
        let prompt = loader.feedback_prompt(&ctx).unwrap();
        assert!(prompt.contains("attempt 1"));
        assert!(prompt.contains("- score: expected required field (number); received missing"));
        assert!(prompt.contains("{\"label\": \"x\"}"));
    }

    #[test]
    fn test_user_override() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("system.pmt"), "custom {{depth}}").unwrap();
        let loader = PromptLoader::new(Some(dir.path()));
        let ctx = SystemPromptContext {
            context_len: 1,
            depth: 2,
            max_depth: 3,
            query: String::new(),
        };
        assert_eq!(loader.system_prompt(&ctx, false).unwrap(), "custom 2");
        // Templates without an override still come from the embedded set
        assert!(loader.load_template("feedback").unwrap().contains("Problems to fix"));
    }

    #[test]
    fn test_unknown_template() {
        let loader = PromptLoader::embedded_only();
        assert!(matches!(loader.load_template("nope"), Err(RlmError::Prompt(_))));
    }
}
