// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The declarative tool DSL and its interpreter.
//!
//! A tool's `code` document is a JSON object `{"steps": [...]}` where each
//! step names one operation over the [`ToolCtx`] capability surface:
//!
//! ```json
//! {"steps": [
//!   {"op": "log",        "message": "probing {{selector}}"},
//!   {"op": "sleep",      "ms": 250},
//!   {"op": "exec",       "command": "xdotool search '{{selector}}'", "into": "found"},
//!   {"op": "fetch",      "url": "{{url}}", "into": "body"},
//!   {"op": "screenshot", "into": "shot"},
//!   {"op": "result",     "value": {"found": "{{found.stdout}}"}}
//! ]}
//! ```
//!
//! `{{name}}` placeholders resolve against the invocation parameters first,
//! then against variables bound by earlier `into` clauses (with an optional
//! dotted path into structured values). "Compiling" a tool is parsing this
//! document; a document that is not a non-empty step list is rejected with
//! `tool_compile_failed`, which is what keeps the name-for-name contract
//! with source-code tools: reject non-programs, store the rest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use galvan_proto::{Fault, FaultKind};

use super::ctx::ToolCtx;

/// One interpreted operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ToolOp {
    Log {
        message: String,
    },
    Sleep {
        ms: u64,
    },
    Fetch {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        into: Option<String>,
    },
    Exec {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        into: Option<String>,
    },
    Screenshot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        into: Option<String>,
    },
    Result {
        value: Value,
    },
}

/// A compiled tool program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolProgram {
    pub steps: Vec<ToolOp>,
}

impl ToolProgram {
    /// "Compile" the submitted code document. Anything that does not parse
    /// into a non-empty step list is not a program.
    pub fn compile(code: &Value) -> Result<Self, Fault> {
        let program: ToolProgram = serde_json::from_value(code.clone()).map_err(|e| {
            Fault::new(FaultKind::ToolCompileFailed, format!("not a tool program: {e}"))
        })?;
        if program.steps.is_empty() {
            return Err(Fault::new(
                FaultKind::ToolCompileFailed,
                "tool program has no steps",
            ));
        }
        Ok(program)
    }

    /// Interpret the program. The caller wraps this in the hard wall-clock
    /// timeout; the program itself can only suspend inside ctx operations.
    pub async fn run(&self, params: &Map<String, Value>, ctx: &ToolCtx) -> Result<Value, Fault> {
        let mut vars: BTreeMap<String, Value> = BTreeMap::new();
        let mut last: Value = Value::Null;

        for op in &self.steps {
            match op {
                ToolOp::Log { message } => {
                    ctx.log(&substitute_str(message, params, &vars));
                }
                ToolOp::Sleep { ms } => {
                    ctx.sleep(*ms).await;
                }
                ToolOp::Fetch { url, into } => {
                    let url = substitute_str(url, params, &vars);
                    let body = ctx.fetch(&url).await?;
                    last = Value::String(body);
                    bind(&mut vars, into, &last);
                }
                ToolOp::Exec { command, into } => {
                    let command = substitute_str(command, params, &vars);
                    let result = ctx.exec(&command).await?;
                    last = serde_json::to_value(&result)
                        .map_err(|e| Fault::new(FaultKind::ToolInvokeFailed, e.to_string()))?;
                    bind(&mut vars, into, &last);
                }
                ToolOp::Screenshot { into } => {
                    let image = ctx.screenshot().await?;
                    last = Value::String(image);
                    bind(&mut vars, into, &last);
                }
                ToolOp::Result { value } => {
                    return Ok(substitute_value(value, params, &vars));
                }
            }
        }
        Ok(last)
    }
}

fn bind(vars: &mut BTreeMap<String, Value>, into: &Option<String>, value: &Value) {
    if let Some(name) = into {
        vars.insert(name.clone(), value.clone());
    }
}

/// Replace every `{{name}}` (or `{{name.path}}`) in a template string.
/// Unknown names are left in place so failures are visible in output.
fn substitute_str(template: &str, params: &Map<String, Value>, vars: &BTreeMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match lookup(key, params, vars) {
                    Some(value) => out.push_str(&render(&value)),
                    None => {
                        out.push_str("{{");
                        out.push_str(&after[..end]);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Deep substitution over a JSON value: strings are templated, containers
/// recursed, everything else copied.
fn substitute_value(value: &Value, params: &Map<String, Value>, vars: &BTreeMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            // A template that is exactly one placeholder keeps the bound
            // value's type instead of flattening it to a string.
            let trimmed = s.trim();
            if trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed.matches("{{").count() == 1 {
                let key = trimmed[2..trimmed.len() - 2].trim();
                if let Some(found) = lookup(key, params, vars) {
                    return found;
                }
            }
            Value::String(substitute_str(s, params, vars))
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_value(item, params, vars))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, params, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve `name` or `name.path.inside` against params, then vars.
fn lookup(key: &str, params: &Map<String, Value>, vars: &BTreeMap<String, Value>) -> Option<Value> {
    let mut parts = key.split('.');
    let head = parts.next()?;
    let mut current = params
        .get(head)
        .cloned()
        .or_else(|| vars.get(head).cloned())?;
    for part in parts {
        current = current.get(part)?.clone();
    }
    Some(current)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserPool;
    use crate::driver::ScriptedFactory;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn ctx() -> ToolCtx {
        let pool = BrowserPool::new(
            Arc::new(ScriptedFactory::default()),
            2,
            Duration::from_secs(60),
            true,
        );
        ToolCtx::new("t", None, Duration::from_secs(5), pool)
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn compile_accepts_a_step_list() {
        let program = ToolProgram::compile(&json!({
            "steps": [{"op": "log", "message": "hi"}]
        }))
        .unwrap();
        assert_eq!(program.steps.len(), 1);
    }

    #[test]
    fn compile_rejects_non_programs() {
        for bad in [
            json!("function() {}"),
            json!({"steps": []}),
            json!({"steps": [{"op": "dance"}]}),
            json!({"steps": [{"op": "log"}]}),
            json!(42),
        ] {
            let err = ToolProgram::compile(&bad).unwrap_err();
            assert_eq!(err.kind, FaultKind::ToolCompileFailed, "accepted: {bad}");
        }
    }

    #[test]
    fn placeholders_resolve_params_and_dotted_paths() {
        let params = params(json!({"selector": "#go", "opts": {"depth": 3}}));
        let vars = BTreeMap::new();
        assert_eq!(
            substitute_str("find {{selector}} at {{opts.depth}}", &params, &vars),
            "find #go at 3"
        );
    }

    #[test]
    fn unknown_placeholders_stay_visible() {
        let empty = Map::new();
        let vars = BTreeMap::new();
        assert_eq!(substitute_str("x {{nope}} y", &empty, &vars), "x {{nope}} y");
    }

    #[tokio::test]
    async fn exec_binds_into_vars_for_result() {
        let program = ToolProgram::compile(&json!({
            "steps": [
                {"op": "exec", "command": "echo {{word}}", "into": "run"},
                {"op": "result", "value": {"out": "{{run.stdout}}", "code": "{{run.exitCode}}"}}
            ]
        }))
        .unwrap();

        let result = program
            .run(&params(json!({"word": "marco"})), &ctx())
            .await
            .unwrap();
        assert_eq!(result["out"].as_str().unwrap().trim(), "marco");
        assert_eq!(result["code"], 0);
    }

    #[tokio::test]
    async fn single_placeholder_result_keeps_value_type() {
        let program = ToolProgram::compile(&json!({
            "steps": [
                {"op": "exec", "command": "true", "into": "run"},
                {"op": "result", "value": "{{run}}"}
            ]
        }))
        .unwrap();
        let result = program.run(&Map::new(), &ctx()).await.unwrap();
        assert!(result.is_object());
        assert_eq!(result["exitCode"], 0);
    }

    #[tokio::test]
    async fn program_without_result_returns_last_binding() {
        let program = ToolProgram::compile(&json!({
            "steps": [{"op": "exec", "command": "echo tail"}]
        }))
        .unwrap();
        let result = program.run(&Map::new(), &ctx()).await.unwrap();
        assert_eq!(result["stdout"].as_str().unwrap().trim(), "tail");
    }

    #[tokio::test]
    async fn result_short_circuits_remaining_steps() {
        let program = ToolProgram::compile(&json!({
            "steps": [
                {"op": "result", "value": "done"},
                {"op": "exec", "command": "touch /nonexistent-dir/boom"}
            ]
        }))
        .unwrap();
        let result = program.run(&Map::new(), &ctx()).await.unwrap();
        assert_eq!(result, json!("done"));
    }
}
