//! Worker-side execution engine: variable store, `print` buffering, and a
//! small deterministic statement language for the code blocks a model
//! emits (`print(...)`, assignment, and bridge/tool calls such as
//! `llm_query(...)`).
//!
//! This is not meant to model any particular host language -- spec §4.2
//! describes the *bindings and suspension protocol* a submitted code block
//! runs against (`print`, `__vars`, `llm_query`, tools), not a specific
//! grammar. The interpreter here implements exactly that contract: a
//! sequence of statements over a persistent variable map, with bridge
//! calls as synchronous round trips to the host (the worker is
//! single-threaded, so blocking on a reply is equivalent to the
//! suspend-and-resume behavior spec'd for an async host language).
//!
//! Strict-mode blocklist scanning is grounded on `regex`, the same crate
//! `rlm-core::complexity` uses for pattern classification.

use crate::config::SandboxMode;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

/// A bridge call failed or was refused locally (frame too large, strict
/// mode, unknown method). Carries enough detail to become an `ExecError`.
#[derive(Debug, Clone)]
pub struct ExecFailure {
    pub message: String,
    pub stack: Option<String>,
}

impl ExecFailure {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

/// Abstraction over the synchronous host round trip a bridge call makes.
/// Implemented by the real stdin/stdout transport in `sandbox_worker`'s
/// `main`, and by an in-memory fake in tests.
pub trait BridgeTransport {
    /// Perform one bridge call and block for the result. `Err` carries the
    /// failure message from `BridgeFailed` (or a locally-synthesized one,
    /// e.g. "BridgeCall exceeds max frame size").
    fn call(&mut self, method: &str, args: &[Value]) -> Result<Value, String>;
}

fn blocklist_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\bimport\s*\(",
            r"\brequire\s*\(",
            r"\bFunction\s*\(",
            r"\.constructor\s*\(",
            r"\.constructor\.constructor\s*\(",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("blocklist pattern is valid"))
        .collect()
    })
}

/// Per-call worker state: the persistent variable map plus configuration
/// from `Init`.
pub struct WorkerState {
    pub vars: HashMap<String, Value>,
    pub call_id: String,
    pub depth: u32,
    pub sandbox_mode: SandboxMode,
    pub tool_names: HashSet<String>,
}

impl WorkerState {
    pub fn new(call_id: String, depth: u32, sandbox_mode: SandboxMode, tool_names: HashSet<String>) -> Self {
        Self {
            vars: HashMap::new(),
            call_id,
            depth,
            sandbox_mode,
            tool_names,
        }
    }

    /// Execute one code block, returning the joined `print` output or an
    /// `ExecFailure` describing what went wrong.
    pub fn execute(
        &mut self,
        code: &str,
        bridge: &mut dyn BridgeTransport,
    ) -> Result<String, ExecFailure> {
        if matches!(self.sandbox_mode, SandboxMode::Strict) {
            for pattern in blocklist_patterns() {
                if pattern.is_match(code) {
                    return Err(ExecFailure::new(format!(
                        "blocked pattern '{}' is not permitted in strict sandbox mode",
                        pattern.as_str()
                    )));
                }
            }
        }

        let mut output = Vec::new();
        for statement in split_statements(code) {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            self.run_statement(statement, bridge, &mut output)?;
        }
        Ok(output.join("\n"))
    }

    fn run_statement(
        &mut self,
        statement: &str,
        bridge: &mut dyn BridgeTransport,
        output: &mut Vec<String>,
    ) -> Result<(), ExecFailure> {
        let statement = statement.strip_prefix("await").map(str::trim_start).unwrap_or(statement);

        if let Some(rest) = statement.strip_prefix("print") {
            let rest = rest.trim_start();
            let args_src = strip_parens(rest).ok_or_else(|| {
                ExecFailure::new("print(...) requires parenthesized arguments")
            })?;
            let args = self.eval_args(args_src, bridge)?;
            let line = args
                .iter()
                .map(render_value)
                .collect::<Vec<_>>()
                .join(" ");
            output.push(line);
            return Ok(());
        }

        if let Some((name, expr_src)) = split_assignment(statement) {
            let value = self.eval_expr(expr_src.trim(), bridge)?;
            self.vars.insert(name.trim().to_string(), value);
            return Ok(());
        }

        // Bare expression statement (e.g. a bridge call with no assignment).
        self.eval_expr(statement, bridge)?;
        Ok(())
    }

    fn eval_args(&mut self, src: &str, bridge: &mut dyn BridgeTransport) -> Result<Vec<Value>, ExecFailure> {
        split_top_level(src, ',')
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| self.eval_expr(s.trim(), bridge))
            .collect()
    }

    fn eval_expr(&mut self, src: &str, bridge: &mut dyn BridgeTransport) -> Result<Value, ExecFailure> {
        let src = src.trim();

        // Binary `+` at the top level: numeric addition, or string
        // concatenation if either side is not a number.
        let parts = split_top_level(src, '+');
        if parts.len() > 1 {
            let mut acc: Option<Value> = None;
            for part in parts {
                let value = self.eval_expr(part.trim(), bridge)?;
                acc = Some(match acc {
                    None => value,
                    Some(prev) => add_values(prev, value),
                });
            }
            return Ok(acc.unwrap_or(Value::Null));
        }

        if let Some(inner) = strip_parens_whole(src) {
            return self.eval_expr(inner, bridge);
        }

        if let Some(s) = strip_string_literal(src) {
            return Ok(Value::String(s));
        }

        if let Ok(n) = src.parse::<f64>() {
            return Ok(serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null));
        }

        if let Some(paren_start) = src.find('(') {
            if src.ends_with(')') {
                let name = src[..paren_start].trim();
                let args_src = &src[paren_start + 1..src.len() - 1];
                let args = self.eval_args(args_src, bridge)?;
                return self.call_function(name, args, bridge);
            }
        }

        // Bare identifier: variable lookup via the reflective `__vars` map.
        if is_identifier(src) {
            return Ok(self.vars.get(src).cloned().unwrap_or(Value::Null));
        }

        Err(ExecFailure::new(format!("could not evaluate expression: {src}")))
    }

    fn call_function(
        &mut self,
        name: &str,
        args: Vec<Value>,
        bridge: &mut dyn BridgeTransport,
    ) -> Result<Value, ExecFailure> {
        let is_bridge_method = name == "llm_query" || name == "llm_query_batched" || self.tool_names.contains(name);

        if is_bridge_method {
            if matches!(self.sandbox_mode, SandboxMode::Strict) {
                return Err(ExecFailure::new("Bridge disabled in strict sandbox mode"));
            }
            return bridge
                .call(name, &args)
                .map_err(|message| ExecFailure::new(message));
        }

        Err(ExecFailure::new(format!("unknown function: {name}")))
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn add_values(a: Value, b: Value) -> Value {
    match (&a, &b) {
        (Value::Number(x), Value::Number(y)) => {
            let sum = x.as_f64().unwrap_or(0.0) + y.as_f64().unwrap_or(0.0);
            serde_json::Number::from_f64(sum).map(Value::Number).unwrap_or(Value::Null)
        }
        _ => Value::String(format!("{}{}", render_value(&a), render_value(&b))),
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().map(|c| c.is_alphabetic() || c == '_').unwrap_or(false)
        && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn strip_parens(s: &str) -> Option<&str> {
    let s = s.trim();
    if s.starts_with('(') && s.ends_with(')') {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

fn strip_parens_whole(s: &str) -> Option<&str> {
    if s.starts_with('(') && s.ends_with(')') && is_balanced(&s[1..s.len() - 1]) {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

fn is_balanced(s: &str) -> bool {
    let mut depth = 0i32;
    for c in s.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn strip_string_literal(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' || first == b'\'' || first == b'`') && first == last {
            return Some(s[1..s.len() - 1].to_string());
        }
    }
    None
}

/// Split `code` into statements on top-level `;` or newlines.
fn split_statements(code: &str) -> Vec<String> {
    let mut statements = Vec::new();
    for line in code.split('\n') {
        for part in split_top_level(line, ';') {
            statements.push(part.to_string());
        }
    }
    statements
}

/// Split `src` on occurrences of `delim` that are not inside parentheses or
/// string literals.
fn split_top_level(src: &str, delim: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_string: Option<char> = None;
    let mut start = 0usize;
    let bytes = src.as_bytes();

    for (i, c) in src.char_indices() {
        if let Some(quote) = in_string {
            if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => in_string = Some(c),
            '(' => depth += 1,
            ')' => depth -= 1,
            _ if c == delim && depth == 0 => {
                parts.push(&src[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    let _ = bytes;
    parts.push(&src[start..]);
    parts
}

/// Recognize `ident = expr` at the top level, distinct from `==` and from
/// `=` appearing inside nested parens/strings.
fn split_assignment(statement: &str) -> Option<(&str, &str)> {
    let bytes = statement.as_bytes();
    let mut depth = 0i32;
    let mut in_string: Option<char> = None;
    let chars: Vec<(usize, char)> = statement.char_indices().collect();

    for (idx, &(i, c)) in chars.iter().enumerate() {
        if let Some(quote) = in_string {
            if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => in_string = Some(c),
            '(' => depth += 1,
            ')' => depth -= 1,
            '=' if depth == 0 => {
                let next_is_eq = chars.get(idx + 1).map(|&(_, c)| c) == Some('=');
                let prev_is_cmp = idx > 0 && matches!(chars[idx - 1].1, '=' | '!' | '<' | '>');
                if !next_is_eq && !prev_is_cmp {
                    let name = &statement[..i];
                    if is_identifier(name.trim()) {
                        return Some((name, &statement[i + 1..]));
                    }
                }
            }
            _ => {}
        }
    }
    let _ = bytes;
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopBridge;
    impl BridgeTransport for NoopBridge {
        fn call(&mut self, _method: &str, _args: &[Value]) -> Result<Value, String> {
            Err("no bridge in this test".to_string())
        }
    }

    struct RecordingBridge {
        calls: Vec<(String, Vec<Value>)>,
        response: Result<Value, String>,
    }

    impl BridgeTransport for RecordingBridge {
        fn call(&mut self, method: &str, args: &[Value]) -> Result<Value, String> {
            self.calls.push((method.to_string(), args.to_vec()));
            self.response.clone()
        }
    }

    fn state() -> WorkerState {
        WorkerState::new("root".into(), 0, SandboxMode::Permissive, HashSet::new())
    }

    #[test]
    fn print_of_arithmetic_matches_spec_scenario_two() {
        let mut s = state();
        let mut bridge = NoopBridge;
        let output = s.execute("print(3+4)", &mut bridge).unwrap();
        assert_eq!(output, "7");
    }

    #[test]
    fn variables_persist_across_executes_on_same_sandbox() {
        let mut s = state();
        let mut bridge = NoopBridge;
        s.execute("a = 3", &mut bridge).unwrap();
        s.execute("b = 4", &mut bridge).unwrap();
        let output = s.execute("print(a+b)", &mut bridge).unwrap();
        assert_eq!(output, "7");
    }

    #[test]
    fn string_concatenation_falls_back_when_not_both_numbers() {
        let mut s = state();
        let mut bridge = NoopBridge;
        let output = s.execute(r#"print("hello " + "world")"#, &mut bridge).unwrap();
        assert_eq!(output, "hello world");
    }

    #[test]
    fn llm_query_dispatches_through_bridge_transport() {
        let mut s = state();
        let mut bridge = RecordingBridge {
            calls: Vec::new(),
            response: Ok(Value::String("Paris".into())),
        };
        let output = s
            .execute(r#"result = await llm_query("capital of France?")
print(result)"#, &mut bridge)
            .unwrap();
        assert_eq!(output, "Paris");
        assert_eq!(bridge.calls[0].0, "llm_query");
    }

    #[test]
    fn strict_mode_disables_bridge_calls() {
        let mut s = WorkerState::new("root".into(), 0, SandboxMode::Strict, HashSet::new());
        let mut bridge = NoopBridge;
        let err = s.execute(r#"llm_query("x")"#, &mut bridge).unwrap_err();
        assert!(err.message.contains("Bridge disabled in strict sandbox mode"));
    }

    #[test]
    fn strict_mode_blocks_dynamic_import_pattern() {
        let mut s = WorkerState::new("root".into(), 0, SandboxMode::Strict, HashSet::new());
        let mut bridge = NoopBridge;
        let err = s.execute("x = import('fs')", &mut bridge).unwrap_err();
        assert!(err.message.contains("blocked pattern"));
    }

    #[test]
    fn strict_mode_blocks_constructor_escape_pattern() {
        let mut s = WorkerState::new("root".into(), 0, SandboxMode::Strict, HashSet::new());
        let mut bridge = NoopBridge;
        let err = s
            .execute("x = (1).constructor.constructor(\"return 1\")", &mut bridge)
            .unwrap_err();
        assert!(err.message.contains("blocked pattern"));
    }

    #[test]
    fn unknown_function_is_a_runtime_error() {
        let mut s = state();
        let mut bridge = NoopBridge;
        let err = s.execute("mystery_call(1)", &mut bridge).unwrap_err();
        assert!(err.message.contains("unknown function"));
    }

    #[test]
    fn multiple_print_calls_join_with_newline() {
        let mut s = state();
        let mut bridge = NoopBridge;
        let output = s.execute("print(1)\nprint(2)", &mut bridge).unwrap();
        assert_eq!(output, "1\n2");
    }

    #[test]
    fn registered_tool_name_dispatches_as_bridge_call() {
        let mut tools = HashSet::new();
        tools.insert("search_docs".to_string());
        let mut s = WorkerState::new("root".into(), 0, SandboxMode::Permissive, tools);
        let mut bridge = RecordingBridge {
            calls: Vec::new(),
            response: Ok(Value::String("found".into())),
        };
        let output = s.execute(r#"print(search_docs("auth"))"#, &mut bridge).unwrap();
        assert_eq!(output, "found");
        assert_eq!(bridge.calls[0].0, "search_docs");
    }
}
