//! Script steps: an isolated evaluation context whose only crossing
//! points are variable get/set and an append-only log.
//!
//! The bundled [`CelScriptSandbox`] runs a line-oriented language where
//! every statement is an assignment or a log call and every right-hand
//! side is a CEL expression:
//!
//! ```text
//! # comments start with '#' or '//'
//! total = int(count) + 1
//! variables["user-id"] = user + "-" + string(total)
//! log("total is " + string(total))
//! ```
//!
//! Store variables are visible as top-level identifiers (when the name
//! is a valid identifier) and as `variables["name"]`. All values are
//! strings; use `int(...)`/`double(...)` for arithmetic.

use crate::error::ScriptError;
use cel::{Context, Program};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Variable access handed to a script. Writes are staged and only
/// reach the run-scoped store once the script completes successfully.
#[derive(Debug, Clone, Default)]
pub struct ScriptVariables {
    current: HashMap<String, String>,
    writes: HashMap<String, String>,
}

impl ScriptVariables {
    pub fn new(current: HashMap<String, String>) -> Self {
        Self {
            current,
            writes: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.writes
            .get(name)
            .or_else(|| self.current.get(name))
            .map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.writes.insert(name.into(), value.into());
    }

    /// Current view: store values overlaid by staged writes.
    pub fn snapshot(&self) -> HashMap<String, String> {
        let mut merged = self.current.clone();
        merged.extend(self.writes.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    pub fn into_writes(self) -> HashMap<String, String> {
        self.writes
    }
}

/// Append-only log sink for scripts.
#[derive(Debug, Clone, Default)]
pub struct ScriptLog {
    lines: Vec<String>,
}

impl ScriptLog {
    pub fn append(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

/// Runs opaque script source synchronously to completion.
pub trait ScriptSandbox: Send + Sync {
    fn run(
        &self,
        source: &str,
        variables: &mut ScriptVariables,
        log: &mut ScriptLog,
    ) -> Result<(), ScriptError>;
}

static LOG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:console\.)?log\((.*)\)$").expect("failed to compile log regex")
});

static ASSIGN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:variables\.)?([A-Za-z_][A-Za-z0-9_]*)\s*=([^=].*)$")
        .expect("failed to compile assignment regex")
});

static INDEX_ASSIGN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^variables\[\s*["']([^"']+)["']\s*\]\s*=([^=].*)$"#)
        .expect("failed to compile index assignment regex")
});

static IDENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("failed to compile identifier regex")
});

/// CEL-backed restricted interpreter.
#[derive(Debug, Default, Clone, Copy)]
pub struct CelScriptSandbox;

impl ScriptSandbox for CelScriptSandbox {
    fn run(
        &self,
        source: &str,
        variables: &mut ScriptVariables,
        log: &mut ScriptLog,
    ) -> Result<(), ScriptError> {
        for (idx, raw) in source.lines().enumerate() {
            let line = idx + 1;
            let statement = raw.trim();
            if statement.is_empty() || statement.starts_with('#') || statement.starts_with("//") {
                continue;
            }
            let statement = statement.strip_suffix(';').unwrap_or(statement).trim();

            if let Some(caps) = LOG_RE.captures(statement) {
                let value = evaluate(caps[1].trim(), variables, line)?;
                log.append(value);
            } else if let Some(caps) = INDEX_ASSIGN_RE
                .captures(statement)
                .or_else(|| ASSIGN_RE.captures(statement))
            {
                let value = evaluate(caps[2].trim(), variables, line)?;
                debug!("script set '{}' = '{}'", &caps[1], value);
                variables.set(&caps[1], value);
            } else {
                return Err(ScriptError::Syntax {
                    line,
                    statement: statement.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn evaluate(expr: &str, variables: &ScriptVariables, line: usize) -> Result<String, ScriptError> {
    let error = |reason: String| ScriptError::Evaluation { line, reason };

    let program = Program::compile(expr)
        .map_err(|e| error(format!("CEL compile error for '{expr}': {e}")))?;
    let context = build_context(&variables.snapshot()).map_err(error)?;
    let result = program
        .execute(&context)
        .map_err(|e| error(format!("CEL execution error: {e}")))?;

    cel_to_string(&result).map_err(error)
}

fn build_context<'a>(vars: &HashMap<String, String>) -> Result<Context<'a>, String> {
    let mut context = Context::default();

    for (key, value) in vars {
        if IDENT_RE.is_match(key) && key != "variables" {
            context
                .add_variable(key.as_str(), value.clone())
                .map_err(|e| format!("Failed to add variable '{key}' to CEL context: {e}"))?;
        }
    }
    context
        .add_variable("variables", vars.clone())
        .map_err(|e| format!("Failed to add variables map to CEL context: {e}"))?;

    context.add_function("urlencode", |s: Arc<String>| -> Arc<String> {
        Arc::new(url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>())
    });

    Ok(context)
}

fn cel_to_string(value: &cel::Value) -> Result<String, String> {
    match value {
        cel::Value::String(s) => Ok(s.to_string()),
        cel::Value::Int(i) => Ok(i.to_string()),
        cel::Value::UInt(u) => Ok(u.to_string()),
        cel::Value::Float(f) => Ok(f.to_string()),
        cel::Value::Bool(b) => Ok(b.to_string()),
        cel::Value::Null => Ok("null".to_string()),
        other => other
            .json()
            .map(|json| json.to_string())
            .map_err(|e| format!("Failed to convert CEL value to string: {e}")),
    }
}
