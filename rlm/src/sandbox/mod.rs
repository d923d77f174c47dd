//! Sandboxed execution of model-authored exploration code
//!
//! The [`Sandbox`] trait is the seam between the recursion controller and the
//! script engine. [`ScriptSandbox`] is the default implementation: JavaScript
//! on an embedded QuickJS runtime with no file, network or process access,
//! bounded in time and memory. Its only way out is [`SubCompletion`], which
//! the controller supplies to spawn child sessions.

mod quickjs;
mod source;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::RlmResult;
use crate::session::VariableStore;

/// Observation used when a script ran cleanly but produced nothing
pub const NO_OUTPUT: &str = "Code executed successfully (no output)";

/// Outcome of one execution attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxResult {
    /// Normal completion; carries printed output (possibly truncated)
    Printed(String),
    /// `FINAL(text)` was called
    Final(String),
    /// `FINAL_VAR(value)` was called; carries the serialized value
    FinalVar(String),
    /// Syntax error, uncaught exception or exhausted time/memory budget
    RuntimeError(String),
}

impl SandboxResult {
    /// Final answer text, when execution terminated the session
    pub fn final_answer(&self) -> Option<&str> {
        match self {
            SandboxResult::Final(text) | SandboxResult::FinalVar(text) => Some(text),
            _ => None,
        }
    }

    /// Text fed back to the model as the next observation
    pub fn observation(&self) -> String {
        match self {
            SandboxResult::Printed(text) | SandboxResult::Final(text) | SandboxResult::FinalVar(text) => {
                text.clone()
            }
            SandboxResult::RuntimeError(message) => format!("Error: {message}"),
        }
    }
}

impl fmt::Display for SandboxResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxResult::Printed(_) => write!(f, "printed"),
            SandboxResult::Final(_) => write!(f, "final"),
            SandboxResult::FinalVar(_) => write!(f, "final_var"),
            SandboxResult::RuntimeError(_) => write!(f, "runtime_error"),
        }
    }
}

/// Callback used by `recursive_llm(query, context)` inside scripts
#[async_trait]
pub trait SubCompletion: Send + Sync {
    /// Answer `query` over `context` in a child session
    async fn complete(&self, query: String, context: String) -> RlmResult<String>;
}

/// Everything a script can see from outside
#[derive(Clone)]
pub struct Bindings {
    pub context: Arc<str>,
    pub query: String,
    pub recurse: Arc<dyn SubCompletion>,
    /// Top-level variables carried between executions of one session
    pub variables: VariableStore,
    pub cancel: CancellationToken,
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bindings")
            .field("context_len", &self.context.len())
            .field("query", &self.query)
            .finish()
    }
}

/// Swappable code executor
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run `code` against `bindings`
    ///
    /// Script faults come back as [`SandboxResult::RuntimeError`]; only
    /// failures that must end the session (cancellation, transport errors in
    /// a nested call) are returned as `Err`.
    async fn execute(&self, code: &str, bindings: &Bindings) -> RlmResult<SandboxResult>;
}

/// Default QuickJS-backed sandbox
#[derive(Debug, Clone)]
pub struct ScriptSandbox {
    max_output_chars: usize,
    time_budget: Duration,
    memory_bytes: usize,
}

impl ScriptSandbox {
    /// Heap allowed to a script unless configured otherwise
    pub const DEFAULT_MEMORY_BYTES: usize = 256 * 1024 * 1024;

    pub fn new(max_output_chars: usize, time_budget: Duration) -> Self {
        Self {
            max_output_chars,
            time_budget,
            memory_bytes: Self::DEFAULT_MEMORY_BYTES,
        }
    }

    /// Cap the script heap at `bytes` (plus room for the context)
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_bytes = bytes;
        self
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_output_chars, Duration::from_millis(config.script_timeout_ms))
            .with_memory_limit(config.script_memory_mb.saturating_mul(1024 * 1024))
    }
}

impl Default for ScriptSandbox {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[async_trait]
impl Sandbox for ScriptSandbox {
    async fn execute(&self, code: &str, bindings: &Bindings) -> RlmResult<SandboxResult> {
        debug!(code_len = code.len(), "ScriptSandbox::execute: called");
        let limits = quickjs::Limits {
            max_output_chars: self.max_output_chars,
            time_budget: self.time_budget,
            memory_bytes: self.memory_bytes,
        };
        let code = code.to_string();
        let bindings = bindings.clone();
        let handle = Handle::current();
        let result = match tokio::task::spawn_blocking(move || quickjs::run(&code, &bindings, &limits, handle)).await {
            Ok(result) => result,
            Err(err) => {
                warn!(%err, "ScriptSandbox::execute: script thread failed");
                Ok(SandboxResult::RuntimeError(format!("InternalError: script thread failed: {err}")))
            }
        };
        if let Ok(kind) = &result {
            debug!(%kind, "ScriptSandbox::execute: finished");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LimitExceeded, RlmError};
    use crate::llm::LlmError;
    use std::sync::Mutex;

    /// Answers every sub-query by echoing it, recording the calls
    #[derive(Default)]
    struct EchoCompletion {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SubCompletion for EchoCompletion {
        async fn complete(&self, query: String, context: String) -> RlmResult<String> {
            self.calls.lock().unwrap().push((query.clone(), context.clone()));
            Ok(format!("answer to {query} ({} chars)", context.len()))
        }
    }

    struct DepthLimited;

    #[async_trait]
    impl SubCompletion for DepthLimited {
        async fn complete(&self, _query: String, _context: String) -> RlmResult<String> {
            Err(LimitExceeded::Depth { max_depth: 0, depth: 1 }.into())
        }
    }

    /// Answers after longer than the short test budget
    struct SlowCompletion;

    #[async_trait]
    impl SubCompletion for SlowCompletion {
        async fn complete(&self, _query: String, _context: String) -> RlmResult<String> {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok("slow answer".to_string())
        }
    }

    struct BrokenCompletion;

    #[async_trait]
    impl SubCompletion for BrokenCompletion {
        async fn complete(&self, _query: String, _context: String) -> RlmResult<String> {
            Err(LlmError::InvalidResponse("connection reset".to_string()).into())
        }
    }

    fn bindings_with(context: &str, recurse: Arc<dyn SubCompletion>) -> Bindings {
        Bindings {
            context: Arc::from(context),
            query: "what is it?".to_string(),
            recurse,
            variables: Arc::new(Mutex::new(serde_json::Map::new())),
            cancel: CancellationToken::new(),
        }
    }

    fn bindings(context: &str) -> Bindings {
        bindings_with(context, Arc::new(EchoCompletion::default()))
    }

    async fn run(code: &str, b: &Bindings) -> SandboxResult {
        ScriptSandbox::default().execute(code, b).await.unwrap()
    }

    async fn printed(code: &str) -> String {
        match run(code, &bindings("alpha beta gamma")).await {
            SandboxResult::Printed(text) => text,
            other => panic!("expected printed output, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_print_context_slice() {
        assert_eq!(printed("print(context.slice(0, 5))").await, "alpha");
        assert_eq!(printed("console.log(len(context), query)").await, "16 what is it?");
    }

    #[tokio::test]
    async fn test_trailing_expression_is_output() {
        assert_eq!(printed("const n = 2; n * 21").await, "42");
        assert_eq!(printed("let x = 1;").await, NO_OUTPUT);
    }

    #[tokio::test]
    async fn test_final_and_final_var() {
        let b = bindings("ctx");
        assert_eq!(run("FINAL('done')", &b).await, SandboxResult::Final("done".into()));
        assert_eq!(
            run("const result = {a: [1, 2]}; FINAL_VAR('result')", &b).await,
            SandboxResult::FinalVar(r#"{"a":[1,2]}"#.into())
        );
        assert_eq!(
            run("FINAL_VAR(context.length)", &b).await,
            SandboxResult::FinalVar("3".into())
        );
    }

    #[tokio::test]
    async fn test_final_stops_execution() {
        let b = bindings("ctx");
        let result = run("print('before'); FINAL('x'); print('after')", &b).await;
        assert_eq!(result, SandboxResult::Final("x".into()));
    }

    #[tokio::test]
    async fn test_runtime_errors_are_values() {
        let b = bindings("ctx");
        let result = run("undefinedThing.foo", &b).await;
        let SandboxResult::RuntimeError(message) = &result else {
            panic!("expected runtime error, got {result:?}");
        };
        assert!(message.starts_with("ReferenceError"));
        assert!(message.contains("undefinedThing"));
        assert!(result.observation().starts_with("Error: "));

        let result = run("let = ;", &b).await;
        assert!(matches!(result, SandboxResult::RuntimeError(m) if m.contains("SyntaxError")));

        let result = run("throw new Error('boom')", &b).await;
        assert_eq!(result, SandboxResult::RuntimeError("Error: boom".into()));
    }

    #[tokio::test]
    async fn test_error_keeps_partial_output() {
        let b = bindings("ctx");
        let result = run("print('step 1'); null.x", &b).await;
        assert!(matches!(result, SandboxResult::RuntimeError(m) if m.contains("step 1")));
    }

    fn short_budget() -> ScriptSandbox {
        ScriptSandbox::new(2000, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_infinite_loop_hits_time_budget() {
        let result = short_budget().execute("while (true) {}", &bindings("ctx")).await.unwrap();
        assert!(matches!(result, SandboxResult::RuntimeError(m) if m.contains("Execution limit exceeded")));
    }

    #[tokio::test]
    async fn test_time_budget_not_catchable() {
        let code = "print('start'); try { for (;;) {} } catch (e) { print('caught') }";
        let result = short_budget().execute(code, &bindings("ctx")).await.unwrap();
        let SandboxResult::RuntimeError(message) = result else {
            panic!("expected runtime error, got {result:?}");
        };
        assert!(message.starts_with("Execution limit exceeded"));
        assert!(message.ends_with("Output before error:\nstart"));
    }

    #[tokio::test]
    async fn test_string_doubling_hits_memory_limit() {
        let sandbox = ScriptSandbox::new(2000, Duration::from_secs(20)).with_memory_limit(16 * 1024 * 1024);
        let b = bindings("ctx");
        let result = sandbox.execute("let s = 'x'; while (true) { s = s + s; }", &b).await.unwrap();
        let SandboxResult::RuntimeError(message) = result else {
            panic!("expected runtime error, got {result:?}");
        };
        assert!(message.contains("memory") || message.contains("length"), "{message}");

        // The host is unaffected and later scripts run normally
        let result = sandbox.execute("print('still here')", &b).await.unwrap();
        assert_eq!(result, SandboxResult::Printed("still here".into()));
    }

    #[tokio::test]
    async fn test_runaway_recursion_is_an_error() {
        let b = bindings("ctx");
        let result = run("function down(n) { return down(n + 1) + 1 } down(0)", &b).await;
        assert!(matches!(result, SandboxResult::RuntimeError(m) if m.contains("stack overflow")));
    }

    #[tokio::test]
    async fn test_child_time_not_charged_to_script() {
        let b = bindings_with("ctx", Arc::new(SlowCompletion));
        let result = short_budget().execute("print(recursive_llm('q', context))", &b).await.unwrap();
        assert_eq!(result, SandboxResult::Printed("slow answer".into()));
    }

    #[tokio::test]
    async fn test_child_transport_error_is_fatal() {
        let b = bindings_with("ctx", Arc::new(BrokenCompletion));
        let code = "try { recursive_llm('q', context) } catch (e) { print('swallowed') }";
        let err = ScriptSandbox::default().execute(code, &b).await.unwrap_err();
        assert!(matches!(err, RlmError::Transport(_)));
    }

    #[tokio::test]
    async fn test_output_truncated() {
        let sandbox = ScriptSandbox::new(10, Duration::from_secs(5));
        let result = sandbox.execute("print('x'.repeat(50))", &bindings("ctx")).await.unwrap();
        let SandboxResult::Printed(text) = result else {
            panic!("expected printed output");
        };
        assert!(text.starts_with("xxxxxxxxxx"));
        assert!(text.contains("[Output truncated: 50 chars total, showing first 10]"));
    }

    #[tokio::test]
    async fn test_recursive_call() {
        let echo = Arc::new(EchoCompletion::default());
        let b = bindings_with("abcdef", echo.clone());
        let code = "const parts = [context.slice(0, 3), context.slice(3)];\n\
                    const answers = parts.map(p => recursive_llm('summarize', p));\n\
                    print(answers.join(' | '))";
        let result = run(code, &b).await;
        assert_eq!(
            result,
            SandboxResult::Printed("answer to summarize (3 chars) | answer to summarize (3 chars)".into())
        );
        let calls = echo.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], ("summarize".to_string(), "def".to_string()));
    }

    #[tokio::test]
    async fn test_child_limit_becomes_catchable_error() {
        let b = bindings_with("ctx", Arc::new(DepthLimited));
        let result = run("recursive_llm('q', context)", &b).await;
        assert!(matches!(&result, SandboxResult::RuntimeError(m) if m.contains("max recursion depth")));

        let result = run("try { recursive_llm('q', context) } catch (e) { print('fallback') }", &b).await;
        assert_eq!(result, SandboxResult::Printed("fallback".into()));
    }

    #[tokio::test]
    async fn test_cancellation_is_fatal() {
        let b = bindings("ctx");
        b.cancel.cancel();
        let err = ScriptSandbox::default().execute("let i = 0; while (true) { i++ }", &b).await.unwrap_err();
        assert!(matches!(err, RlmError::Cancelled));
    }

    #[tokio::test]
    async fn test_variables_persist_between_executions() {
        let b = bindings("ctx");
        run("var counts = {a: 1}; const label = 'x'; function f() {}", &b).await;
        let result = run("counts.a += 1; print(counts.a, label, typeof f)", &b).await;
        assert_eq!(result, SandboxResult::Printed("2 x undefined".into()));
    }

    #[tokio::test]
    async fn test_scripting_idioms() {
        let code = r#"
            const words = context.split(/\s+/);
            const lengths = words.map(w => w.length);
            const total = lengths.reduce((a, b) => a + b, 0);
            const upper = words.filter(w => w.includes('a')).map(w => w.toUpperCase());
            const counts = Counter(context.replace(/\s/g, ''));
            print(`${words.length} ${total} ${upper.join(',')} ${counts['a']}`);
            print(JSON.stringify(sorted(words, w => -w.length)));
            print(re.findall('(\\w)(\\w)a', context));
        "#;
        let out = printed(code).await;
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "3 14 ALPHA,BETA,GAMMA 5");
        assert_eq!(lines[1], r#"["alpha","gamma","beta"]"#);
        assert_eq!(lines[2], r#"[["p","h"],["e","t"],["m","m"]]"#);
    }

    #[tokio::test]
    async fn test_destructuring_and_closures() {
        let code = r#"
            const make = () => { let n = 0; return () => ++n; };
            const next = make();
            next(); next();
            const {a, b: [first, ...rest] = []} = {a: next(), b: [1, 2, 3]};
            const merged = {...{x: 1}, y: 2};
            print(a, first, rest.length, Object.keys(merged).join(''));
        "#;
        assert_eq!(printed(code).await, "3 1 2 xy");
    }

    #[tokio::test]
    async fn test_python_style_helpers() {
        let code = r#"
            const pairs = [...enumerate(['a', 'b'])].map(([i, v]) => `${i}${v}`);
            print(pairs.join(' '), sum(range(5)), max([3, 9, 2]), min(4, 1, 7));
            print(zip([1, 2, 3], ['x', 'y']).length, any([0, '', 1]), all([1, 0]));
            print(json.dumps({k: None, t: True}));
        "#;
        let out = printed(code).await;
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "0a 1b 10 9 1");
        assert_eq!(lines[1], "2 true false");
        assert_eq!(lines[2], r#"{"k":null,"t":true}"#);
    }

    #[tokio::test]
    async fn test_sort_with_comparator_and_default() {
        let code = "print([10, 9, 1, 100].sort().join(','));\n\
                    print([10, 9, 1, 100].sort((a, b) => a - b).join(','));";
        assert_eq!(printed(code).await, "1,10,100,9\n1,9,10,100");
    }

    #[tokio::test]
    async fn test_triple_quoted_final() {
        let b = bindings("ctx");
        let result = run("FINAL(\"\"\"line one\nline two\"\"\")", &b).await;
        assert_eq!(result, SandboxResult::Final("line one\nline two".into()));
    }
}
