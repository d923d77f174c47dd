//! One script execution on an embedded QuickJS runtime
//!
//! Every execution gets a fresh runtime on a blocking thread. The script talks
//! to the host through three functions installed before the prelude:
//! `__rlm_emit` (printed lines), `__rlm_finish` (`FINAL`/`FINAL_VAR`) and
//! `__rlm_recurse` (child completions, driven on the caller's tokio runtime).
//! Runtime limits come from the engine: a heap cap and an interrupt handler
//! that stops the script on cancellation, on a fatal child error or when its
//! time budget runs out. Interrupts cannot be caught by the script.

use rquickjs::context::EvalOptions;
use rquickjs::{Context, Ctx, Function, Runtime, Value};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Bindings, NO_OUTPUT, SandboxResult, SubCompletion, source};
use crate::error::{RlmError, RlmResult};

const PRELUDE: &str = include_str!("prelude.js");

/// JS stack allowed per execution; deeper recursion throws `InternalError`
const MAX_STACK_BYTES: usize = 512 * 1024;

/// Time allowed for saving variables after the script itself stopped
const SAVE_BUDGET: Duration = Duration::from_secs(1);

/// Per-execution limits
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_output_chars: usize,
    pub time_budget: Duration,
    pub memory_bytes: usize,
}

enum Terminal {
    Text(String),
    Var(String),
}

/// How the main script ended, as seen from inside the runtime
enum Ending {
    /// Ran to the end; carries the rendered completion value, if any
    Completed(Option<String>),
    /// Uncaught exception, syntax error or interrupt
    Thrown(String),
}

struct Output {
    text: String,
    kept: usize,
    total: usize,
    limit: usize,
    writes: usize,
}

impl Output {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            kept: 0,
            total: 0,
            limit,
            writes: 0,
        }
    }

    fn push(&mut self, s: &str) {
        for c in s.chars() {
            self.total += 1;
            if self.kept < self.limit {
                self.text.push(c);
                self.kept += 1;
            }
        }
    }

    fn line(&mut self, line: &str) {
        if self.writes > 0 {
            self.push("\n");
        }
        self.writes += 1;
        self.push(line);
    }

    fn render(&self) -> String {
        if self.total > self.limit {
            format!(
                "{}\n\n[Output truncated: {} chars total, showing first {}]",
                self.text, self.total, self.limit
            )
        } else {
            self.text.clone()
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between the host functions and the interrupt handler
struct ScriptState {
    output: Mutex<Output>,
    terminal: Mutex<Option<Terminal>>,
    fatal: Mutex<Option<RlmError>>,
    /// Set by `FINAL`/`FINAL_VAR` and by fatal child errors
    halted: AtomicBool,
    timed_out: AtomicBool,
    deadline: Mutex<Instant>,
    cancel: CancellationToken,
}

impl ScriptState {
    fn new(limits: &Limits, cancel: CancellationToken) -> Self {
        Self {
            output: Mutex::new(Output::new(limits.max_output_chars)),
            terminal: Mutex::new(None),
            fatal: Mutex::new(None),
            halted: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            deadline: Mutex::new(Instant::now() + limits.time_budget),
            cancel,
        }
    }

    fn should_interrupt(&self) -> bool {
        if self.halted.load(Ordering::Relaxed) || self.cancel.is_cancelled() {
            return true;
        }
        if Instant::now() >= *lock(&self.deadline) {
            self.timed_out.store(true, Ordering::Relaxed);
            return true;
        }
        false
    }

    fn emit(&self, line: &str) {
        if !self.halted.load(Ordering::Relaxed) {
            lock(&self.output).line(line);
        }
    }

    fn finish(&self, kind: &str, text: String) {
        let mut terminal = lock(&self.terminal);
        if terminal.is_none() {
            *terminal = Some(if kind == "var" { Terminal::Var(text) } else { Terminal::Text(text) });
        }
        self.halted.store(true, Ordering::Relaxed);
    }

    /// Run a child completion; the time it takes is not charged to the script
    fn recurse(&self, handle: &Handle, sub: &Arc<dyn SubCompletion>, query: String, context: String) -> String {
        if self.halted.load(Ordering::Relaxed) {
            return json!({"ok": false, "name": "InternalError", "message": "interrupted"}).to_string();
        }
        debug!(query_len = query.len(), context_len = context.len(), "recurse: called");
        let paused = Instant::now();
        let cancel = self.cancel.clone();
        let result = handle.block_on(async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(RlmError::Cancelled),
                answer = sub.complete(query, context) => answer,
            }
        });
        *lock(&self.deadline) += paused.elapsed();

        match result {
            Ok(answer) => json!({"ok": true, "value": answer}).to_string(),
            Err(RlmError::LimitExceeded(limit)) => {
                warn!(%limit, "recurse: child session hit a limit");
                json!({"ok": false, "name": "LimitExceededError", "message": limit.to_string()}).to_string()
            }
            Err(err) => {
                warn!(%err, "recurse: child failed; stopping script");
                *lock(&self.fatal) = Some(err);
                self.halted.store(true, Ordering::Relaxed);
                json!({"ok": false, "name": "InternalError", "message": "interrupted"}).to_string()
            }
        }
    }
}

/// Execute `code` to completion on the current (blocking) thread
pub fn run(code: &str, bindings: &Bindings, limits: &Limits, handle: Handle) -> RlmResult<SandboxResult> {
    if bindings.cancel.is_cancelled() {
        return Err(RlmError::Cancelled);
    }
    let state = Arc::new(ScriptState::new(limits, bindings.cancel.clone()));

    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => return Ok(SandboxResult::RuntimeError(format!("InternalError: {err}"))),
    };
    // Room for the context itself on top of the configured heap; strings may
    // be stored as UTF-16
    let memory = limits.memory_bytes.saturating_add(bindings.context.len().saturating_mul(4));
    runtime.set_memory_limit(memory);
    runtime.set_max_stack_size(MAX_STACK_BYTES);
    let watcher = Arc::clone(&state);
    runtime.set_interrupt_handler(Some(Box::new(move || watcher.should_interrupt())));
    let context = match Context::full(&runtime) {
        Ok(context) => context,
        Err(err) => return Ok(SandboxResult::RuntimeError(format!("InternalError: {err}"))),
    };

    let script = source::expand_triple_quotes(code);
    let declared: Vec<String> = source::declared_names(&script).into_iter().collect();
    let ending = context.with(|ctx| -> Ending {
        if let Err(err) = install(&ctx, bindings, &state, handle) {
            return Ending::Thrown(describe_error(&ctx, err));
        }

        let mut options = EvalOptions::default();
        options.strict = false;
        let ending = match ctx.eval_with_options::<Value, _>(&*script, options) {
            Ok(value) if value.is_undefined() => Ending::Completed(None),
            Ok(value) => Ending::Completed(Some(call_text(&ctx, "__rlm_show", value))),
            Err(err) => Ending::Thrown(describe_error(&ctx, err)),
        };

        if lock(&state.fatal).is_none() && !state.cancel.is_cancelled() {
            let timed_out = state.timed_out.load(Ordering::Relaxed);
            *lock(&state.deadline) = Instant::now() + SAVE_BUDGET;
            state.halted.store(false, Ordering::Relaxed);
            save_variables(&ctx, bindings, &declared);
            state.timed_out.store(timed_out, Ordering::Relaxed);
        }
        ending
    });

    if state.cancel.is_cancelled() {
        return Err(RlmError::Cancelled);
    }
    if let Some(err) = lock(&state.fatal).take() {
        return Err(err);
    }
    if let Some(terminal) = lock(&state.terminal).take() {
        return Ok(match terminal {
            Terminal::Text(text) => SandboxResult::Final(text),
            Terminal::Var(text) => SandboxResult::FinalVar(text),
        });
    }

    let output = lock(&state.output);
    Ok(match ending {
        Ending::Completed(_) if output.writes > 0 => SandboxResult::Printed(output.render()),
        Ending::Completed(Some(value)) => {
            let mut shown = Output::new(limits.max_output_chars);
            shown.push(&value);
            SandboxResult::Printed(shown.render())
        }
        Ending::Completed(None) => SandboxResult::Printed(NO_OUTPUT.to_string()),
        Ending::Thrown(message) => {
            let message = if state.timed_out.load(Ordering::Relaxed) {
                format!(
                    "Execution limit exceeded: script ran longer than {} ms",
                    limits.time_budget.as_millis()
                )
            } else {
                message
            };
            let printed = output.render();
            if output.writes > 0 && !printed.is_empty() {
                SandboxResult::RuntimeError(format!("{message}\nOutput before error:\n{printed}"))
            } else {
                SandboxResult::RuntimeError(message)
            }
        }
    })
}

/// Host functions, bindings, prelude and saved variables
fn install<'js>(ctx: &Ctx<'js>, bindings: &Bindings, state: &Arc<ScriptState>, handle: Handle) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let emitter = Arc::clone(state);
    globals.set(
        "__rlm_emit",
        Function::new(ctx.clone(), move |line: String| emitter.emit(&line))?,
    )?;

    let finisher = Arc::clone(state);
    globals.set(
        "__rlm_finish",
        Function::new(ctx.clone(), move |kind: String, text: String| finisher.finish(&kind, text))?,
    )?;

    let recurser = Arc::clone(state);
    let sub = Arc::clone(&bindings.recurse);
    globals.set(
        "__rlm_recurse",
        Function::new(ctx.clone(), move |query: String, context: String| {
            recurser.recurse(&handle, &sub, query, context)
        })?,
    )?;

    globals.set("context", &*bindings.context)?;
    globals.set("query", bindings.query.as_str())?;
    ctx.eval::<(), _>(PRELUDE)?;

    let saved = serde_json::to_string(&*lock(&bindings.variables)).unwrap_or_else(|_| "{}".to_string());
    let restore: Function = globals.get("__rlm_restore")?;
    restore.call::<_, ()>((saved,))
}

/// Copy JSON-representable top-level values into the session store
fn save_variables(ctx: &Ctx<'_>, bindings: &Bindings, declared: &[String]) {
    let names = serde_json::to_string(declared).unwrap_or_else(|_| "[]".to_string());
    let collected = ctx
        .globals()
        .get::<_, Function>("__rlm_collect")
        .and_then(|collect| collect.call::<_, String>((names,)));
    let text = match collected {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %describe_error(ctx, err), "save_variables: collection failed");
            return;
        }
    };
    match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&text) {
        Ok(kept) => {
            debug!(saved = kept.len(), "save_variables: persisted globals");
            lock(&bindings.variables).extend(kept);
        }
        Err(err) => warn!(%err, "save_variables: unreadable snapshot"),
    }
}

/// Render a JS value with one of the prelude's text helpers
fn call_text<'js>(ctx: &Ctx<'js>, helper: &str, value: Value<'js>) -> String {
    ctx.globals()
        .get::<_, Function>(helper)
        .and_then(|f| f.call::<_, String>((value,)))
        .unwrap_or_else(|err| format!("InternalError: {err}"))
}

/// Message for a failed evaluation, e.g. `ReferenceError: 'x' is not defined`
fn describe_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    match err {
        rquickjs::Error::Exception => {
            let thrown = ctx.catch();
            call_text(ctx, "__rlm_describe", thrown)
        }
        other => format!("InternalError: {other}"),
    }
}
