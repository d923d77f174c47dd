//! Per-request session state
//!
//! A [`Session`] owns its own depth, iteration and call counters. Nested
//! sessions are separate values; their call counts are summed upward only for
//! reporting.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::error::{LimitExceeded, RlmResult};
use crate::llm::Message;

/// Variables that survive between executions within one session
pub type VariableStore = Arc<Mutex<serde_json::Map<String, serde_json::Value>>>;

/// One logical instance of the recursive completion loop
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub model: String,
    pub recursive_model: String,
    pub root_context: Arc<str>,
    pub max_depth: usize,
    pub max_iterations: usize,
    pub depth: usize,
    llm_calls: usize,
    iterations: usize,
    child_llm_calls: usize,
    variables: VariableStore,
}

impl Session {
    /// Create a root session at depth 0
    pub fn new(
        model: impl Into<String>,
        recursive_model: impl Into<String>,
        context: impl Into<Arc<str>>,
        max_depth: usize,
        max_iterations: usize,
    ) -> Self {
        let session = Self {
            id: Uuid::now_v7(),
            model: model.into(),
            recursive_model: recursive_model.into(),
            root_context: context.into(),
            max_depth,
            max_iterations,
            depth: 0,
            llm_calls: 0,
            iterations: 0,
            child_llm_calls: 0,
            variables: Arc::new(Mutex::new(serde_json::Map::new())),
        };
        debug!(id = %session.id, model = %session.model, "Session::new: called");
        session
    }

    /// Create a child session one level deeper over `context`
    ///
    /// Fails when the child would exceed `max_depth`.
    pub fn child(&self, context: impl Into<Arc<str>>) -> RlmResult<Session> {
        self.lineage().child(context)
    }

    /// Detached handle for opening children while this session is borrowed
    pub fn lineage(&self) -> Lineage {
        Lineage {
            parent: self.id,
            depth: self.depth,
            recursive_model: self.recursive_model.clone(),
            max_depth: self.max_depth,
            max_iterations: self.max_iterations,
        }
    }

    /// Model for calls made by this session
    pub fn active_model(&self) -> &str {
        if self.depth == 0 { &self.model } else { &self.recursive_model }
    }

    /// Reserve one iteration; fails once the budget is spent
    ///
    /// Called before every model call, so a session with `max_iterations`
    /// of N makes at most N calls.
    pub fn begin_iteration(&mut self) -> RlmResult<usize> {
        if self.iterations >= self.max_iterations {
            debug!(id = %self.id, iterations = self.iterations, "Session::begin_iteration: budget spent");
            return Err(LimitExceeded::Iterations {
                max_iterations: self.max_iterations,
            }
            .into());
        }
        self.iterations += 1;
        self.llm_calls += 1;
        Ok(self.iterations)
    }

    /// Record a model call that does not consume an iteration
    pub fn record_llm_call(&mut self) {
        self.llm_calls += 1;
    }

    /// Fold a finished child's totals into this session's reporting counters
    pub fn absorb_child(&mut self, stats: &CompletionStats) {
        self.child_llm_calls += stats.llm_calls;
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn llm_calls(&self) -> usize {
        self.llm_calls
    }

    pub fn variables(&self) -> VariableStore {
        Arc::clone(&self.variables)
    }

    /// Reporting totals: own calls plus every descendant's
    pub fn stats(&self) -> CompletionStats {
        CompletionStats {
            llm_calls: self.llm_calls + self.child_llm_calls,
            iterations: self.iterations,
            depth: self.depth,
            parsing_retries: 0,
        }
    }
}

/// What a session passes down to the children it spawns
#[derive(Debug, Clone)]
pub struct Lineage {
    parent: Uuid,
    depth: usize,
    recursive_model: String,
    max_depth: usize,
    max_iterations: usize,
}

impl Lineage {
    /// Open a child one level below the parent
    pub fn child(&self, context: impl Into<Arc<str>>) -> RlmResult<Session> {
        let depth = self.depth + 1;
        if depth > self.max_depth {
            debug!(depth, max_depth = self.max_depth, "Lineage::child: depth limit");
            return Err(LimitExceeded::Depth {
                max_depth: self.max_depth,
                depth,
            }
            .into());
        }
        let mut child = Session::new(
            self.recursive_model.clone(),
            self.recursive_model.clone(),
            context,
            self.max_depth,
            self.max_iterations,
        );
        child.depth = depth;
        debug!(parent = %self.parent, child = %child.id, depth, "Lineage::child: created");
        Ok(child)
    }
}

/// Counters reported with every response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionStats {
    pub llm_calls: usize,
    pub iterations: usize,
    pub depth: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub parsing_retries: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl CompletionStats {
    /// Sum counters; depth takes the maximum
    pub fn merge(&mut self, other: &CompletionStats) {
        self.llm_calls += other.llm_calls;
        self.iterations += other.iterations;
        self.depth = self.depth.max(other.depth);
        self.parsing_retries += other.parsing_retries;
    }
}

/// A turn in the execution transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Turn {
    /// Raw model output
    Assistant(String),
    /// Sandbox result fed back to the model
    Observation(String),
}

/// Append-only conversation history of one session
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::Assistant(text.into()));
    }

    pub fn push_observation(&mut self, text: impl Into<String>) {
        self.turns.push(Turn::Observation(text.into()));
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Chat messages for the turns; observations travel as user messages
    pub fn to_messages(&self) -> Vec<Message> {
        self.turns
            .iter()
            .map(|turn| match turn {
                Turn::Assistant(text) => Message::assistant(text.clone()),
                Turn::Observation(text) => Message::user(text.clone()),
            })
            .collect()
    }
}
