//! Condition expressions for task preconditions and workflow gates.
//!
//! A deliberately small boolean language: `&&` / `||` with short-circuit
//! evaluation over primaries that query files, the environment, the
//! platform, subprocesses, and the current run's state.
//!
//! Evaluation is fail-open: an expression that cannot be parsed or whose
//! helper errors out evaluates to `true`, so a broken condition never
//! silently hides a task. Failures are logged at warn level.

use std::process::Command;

use thiserror::Error;
use tracing::warn;
use zr_env::EnvironmentVariableMap;

use crate::{task_hash::hash_file, workflow::RuntimeState};

/// Platform name as exposed to expressions.
pub const PLATFORM: &str = if cfg!(target_os = "linux") {
    "linux"
} else if cfg!(target_os = "macos") {
    "darwin"
} else {
    "windows"
};

/// Architecture name as exposed to expressions.
pub const ARCH: &str = if cfg!(target_arch = "aarch64") {
    "aarch64"
} else {
    "x86_64"
};

/// Everything an expression may read. The evaluator never touches
/// process globals directly, which keeps it pure and testable.
#[derive(Default)]
pub struct Context<'a> {
    task_env: Option<&'a [(String, String)]>,
    process_env: Option<&'a EnvironmentVariableMap>,
    runtime: Option<&'a RuntimeState>,
}

impl<'a> Context<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-task env overlay, consulted before the process environment.
    pub fn with_task_env(mut self, env: &'a [(String, String)]) -> Self {
        self.task_env = Some(env);
        self
    }

    pub fn with_process_env(mut self, env: &'a EnvironmentVariableMap) -> Self {
        self.process_env = Some(env);
        self
    }

    pub fn with_runtime(mut self, runtime: &'a RuntimeState) -> Self {
        self.runtime = Some(runtime);
        self
    }

    fn env_var(&self, name: &str) -> Option<String> {
        if let Some(overlay) = self.task_env {
            if let Some((_, value)) = overlay.iter().find(|(key, _)| key == name) {
                return Some(value.clone());
            }
        }
        self.process_env
            .and_then(|env| env.get(name).cloned())
    }
}

#[derive(Debug, Error)]
enum EvalError {
    #[error("unrecognized expression: {0:?}")]
    Unrecognized(String),
    #[error("malformed arguments: {0:?}")]
    MalformedArgs(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no runtime state for {0:?}")]
    NoRuntimeState(String),
    #[error("invalid version: {0}")]
    Semver(#[from] semver::Error),
    #[error("invalid glob: {0}")]
    Glob(#[from] globset::Error),
}

/// Evaluates a condition expression. Any failure is fail-open.
pub fn evaluate(expression: &str, ctx: &Context) -> bool {
    match eval_or(expression, ctx) {
        Ok(value) => value,
        Err(err) => {
            warn!("condition {expression:?} failed to evaluate ({err}), running anyway");
            true
        }
    }
}

// Operator scanning is naive on purpose: primaries never contain a
// top-level "&&" or "||", so splitting is unambiguous.
fn eval_or(input: &str, ctx: &Context) -> Result<bool, EvalError> {
    for branch in input.split("||") {
        if eval_and(branch, ctx)? {
            // Short-circuit: remaining branches are never evaluated
            return Ok(true);
        }
    }
    Ok(false)
}

fn eval_and(input: &str, ctx: &Context) -> Result<bool, EvalError> {
    for clause in input.split("&&") {
        if !eval_primary(clause.trim(), ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn eval_primary(input: &str, ctx: &Context) -> Result<bool, EvalError> {
    match input {
        "true" => return Ok(true),
        "false" => return Ok(false),
        _ => {}
    }

    if let Some(args) = call_args(input, "file.exists")? {
        let [path] = one_arg(input, args)?;
        return Ok(std::path::Path::new(&path).exists());
    }
    if let Some(args) = call_args(input, "file.changed")? {
        let [pattern] = one_arg(input, args)?;
        return file_changed(&pattern);
    }
    if let Some(args) = call_args(input, "file.newer")? {
        let [target, source] = two_args(input, args)?;
        let target = std::fs::metadata(target)?.modified()?;
        let source = std::fs::metadata(source)?.modified()?;
        return Ok(target > source);
    }
    if let Some(args) = call_args(input, "file.hash")? {
        let [path] = one_arg(input, args)?;
        // Truthy when the file is hashable at all
        return Ok(!hash_file(std::path::Path::new(&path))?.is_empty());
    }
    if let Some(args) = call_args(input, "shell")? {
        let [cmd] = one_arg(input, args)?;
        return shell_succeeds(&cmd, ctx);
    }
    if let Some(args) = call_args(input, "semver.gte")? {
        let [a, b] = two_args(input, args)?;
        let a = semver::Version::parse(a.trim())?;
        let b = semver::Version::parse(b.trim())?;
        return Ok(a >= b);
    }

    if let Some(rest) = input.strip_prefix("env.") {
        return eval_env(rest, ctx);
    }
    if let Some(rest) = input.strip_prefix("platform") {
        return eval_constant_eq(input, rest, PLATFORM);
    }
    if let Some(rest) = input.strip_prefix("arch") {
        return eval_constant_eq(input, rest, ARCH);
    }
    if let Some(rest) = input.strip_prefix("stages[") {
        return eval_stage_ref(input, rest, ctx);
    }
    if let Some(rest) = input.strip_prefix("tasks[") {
        return eval_task_ref(input, rest, ctx);
    }

    Err(EvalError::Unrecognized(input.to_string()))
}

/// `name(args)` → `Some(args)`, anything else → `None`.
fn call_args<'a>(input: &'a str, name: &str) -> Result<Option<&'a str>, EvalError> {
    let Some(rest) = input.strip_prefix(name) else {
        return Ok(None);
    };
    let rest = rest.trim_start();
    let Some(inner) = rest.strip_prefix('(') else {
        return Ok(None);
    };
    let Some(args) = inner.strip_suffix(')') else {
        return Err(EvalError::MalformedArgs(input.to_string()));
    };
    Ok(Some(args))
}

fn one_arg(input: &str, args: &str) -> Result<[String; 1], EvalError> {
    let arg = unquote(args.trim()).to_string();
    if arg.is_empty() {
        return Err(EvalError::MalformedArgs(input.to_string()));
    }
    Ok([arg])
}

fn two_args(input: &str, args: &str) -> Result<[String; 2], EvalError> {
    let (a, b) = args
        .split_once(',')
        .ok_or_else(|| EvalError::MalformedArgs(input.to_string()))?;
    Ok([
        unquote(a.trim()).to_string(),
        unquote(b.trim()).to_string(),
    ])
}

/// Strips one pair of matched quotes, accepting either style.
fn unquote(text: &str) -> &str {
    let bytes = text.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &text[1..text.len() - 1];
        }
    }
    text
}

fn eval_env(rest: &str, ctx: &Context) -> Result<bool, EvalError> {
    if let Some((name, expected)) = rest.split_once("==") {
        let value = ctx.env_var(name.trim()).unwrap_or_default();
        return Ok(value == unquote(expected.trim()));
    }
    if let Some((name, expected)) = rest.split_once("!=") {
        let value = ctx.env_var(name.trim()).unwrap_or_default();
        return Ok(value != unquote(expected.trim()));
    }
    // Bare env.VAR: truthy when set and non-empty
    Ok(!ctx.env_var(rest.trim()).unwrap_or_default().is_empty())
}

fn eval_constant_eq(input: &str, rest: &str, actual: &str) -> Result<bool, EvalError> {
    let rest = rest.trim();
    if let Some(expected) = rest.strip_prefix("==") {
        Ok(unquote(expected.trim()) == actual)
    } else if let Some(expected) = rest.strip_prefix("!=") {
        Ok(unquote(expected.trim()) != actual)
    } else {
        Err(EvalError::Unrecognized(input.to_string()))
    }
}

/// `'name'].success` following `stages[`.
fn eval_stage_ref(input: &str, rest: &str, ctx: &Context) -> Result<bool, EvalError> {
    let (name, field) = bracket_ref(input, rest)?;
    match field {
        ".success" => ctx
            .runtime
            .and_then(|runtime| runtime.stage_success(&name))
            .ok_or_else(|| EvalError::NoRuntimeState(name)),
        _ => Err(EvalError::Unrecognized(input.to_string())),
    }
}

/// `'name'].success` or `'name'].duration <op> N` following `tasks[`.
fn eval_task_ref(input: &str, rest: &str, ctx: &Context) -> Result<bool, EvalError> {
    let (name, field) = bracket_ref(input, rest)?;
    let record = ctx
        .runtime
        .and_then(|runtime| runtime.task(&name))
        .ok_or(EvalError::NoRuntimeState(name))?;

    if field == ".success" {
        return Ok(record.success);
    }
    let Some(comparison) = field.strip_prefix(".duration") else {
        return Err(EvalError::Unrecognized(input.to_string()));
    };
    let comparison = comparison.trim();
    if comparison.is_empty() {
        // A bare duration reference just asserts the task ran
        return Ok(true);
    }
    for (op, compare) in [
        ("<=", u64::le as fn(&u64, &u64) -> bool),
        (">=", u64::ge),
        ("==", u64::eq),
        ("!=", u64::ne),
        ("<", u64::lt),
        (">", u64::gt),
    ] {
        if let Some(value) = comparison.strip_prefix(op) {
            let value: u64 = value
                .trim()
                .parse()
                .map_err(|_| EvalError::MalformedArgs(input.to_string()))?;
            return Ok(compare(&record.duration_ms, &value));
        }
    }
    Err(EvalError::Unrecognized(input.to_string()))
}

/// Splits `'name'].rest` into the quoted name and what follows `]`.
fn bracket_ref<'a>(input: &str, rest: &'a str) -> Result<(String, &'a str), EvalError> {
    let (name, field) = rest
        .split_once(']')
        .ok_or_else(|| EvalError::Unrecognized(input.to_string()))?;
    Ok((unquote(name.trim()).to_string(), field.trim()))
}

fn file_changed(pattern: &str) -> Result<bool, EvalError> {
    let output = match Command::new("git")
        .args(["diff", "--name-only", "HEAD"])
        .output()
    {
        Ok(output) if output.status.success() => output,
        // No VCS (or not a repository): nothing counts as changed
        _ => return Ok(false),
    };

    let matcher = globset::Glob::new(pattern)?.compile_matcher();
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .any(|line| matcher.is_match(line.trim())))
}

fn shell_succeeds(cmd: &str, ctx: &Context) -> Result<bool, EvalError> {
    let mut command = if cfg!(windows) {
        let mut command = Command::new("cmd");
        command.args(["/C", cmd]);
        command
    } else {
        let mut command = Command::new("sh");
        command.args(["-c", cmd]);
        command
    };
    if let Some(overlay) = ctx.task_env {
        command.envs(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    let status = command.status()?;
    Ok(status.success())
}
