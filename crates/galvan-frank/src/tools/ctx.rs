// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The capability surface handed to a running tool program.
//!
//! Tool programs are untrusted; this context is the *only* door out of the
//! interpreter. It exposes logging, HTTP fetch, sleep, bounded command
//! execution, a screenshot of the live browser, and the invocation's
//! correlation id and timeout — nothing else of Frank's internals.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tracing::info;
use uuid::Uuid;

use galvan_proto::{Fault, FaultKind};

use crate::browser::BrowserPool;

/// Combined byte ceiling for captured stdout + stderr of `exec`.
const EXEC_OUTPUT_LIMIT: usize = 20_000;

/// Result of `ctx.exec`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

pub struct ToolCtx {
    /// Name of the tool being run, for log attribution.
    pub tool_name: String,
    /// Correlation id of the originating `tool.invoke`, if any.
    pub correlation_id: Option<Uuid>,
    /// The per-call timeout the registry enforces around the whole run.
    pub timeout: Duration,
    http: reqwest::Client,
    pool: Arc<BrowserPool>,
}

impl ToolCtx {
    pub fn new(
        tool_name: impl Into<String>,
        correlation_id: Option<Uuid>,
        timeout: Duration,
        pool: Arc<BrowserPool>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            correlation_id,
            timeout,
            http: reqwest::Client::new(),
            pool,
        }
    }

    /// Structured log line attributed to the tool.
    pub fn log(&self, message: &str) {
        info!(tool = %self.tool_name, "{message}");
    }

    /// GET a url and return the body as text, capped at 50 k chars.
    pub async fn fetch(&self, url: &str) -> Result<String, Fault> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                Fault::new(FaultKind::ToolInvokeFailed, format!("fetch failed: {e}"))
                    .with("url", url)
            })?;
        let body = response.text().await.map_err(|e| {
            Fault::new(FaultKind::ToolInvokeFailed, format!("fetch body: {e}")).with("url", url)
        })?;
        Ok(body.chars().take(50_000).collect())
    }

    pub async fn sleep(&self, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    /// Run a host command through `sh -c`, capturing bounded output.
    ///
    /// A non-zero exit is not an error — the program gets the exit code and
    /// decides. Spawn failures (missing binary, no /bin/sh) are.
    pub async fn exec(&self, command: &str) -> Result<ExecResult, Fault> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Fault::new(FaultKind::ToolInvokeFailed, format!("spawn failed: {e}"))
                    .with("command", command)
            })?;

        // wait_with_output drains both pipes while waiting, so a chatty
        // command can never deadlock against a full pipe buffer.
        let output = child.wait_with_output().await.map_err(|e| {
            Fault::new(FaultKind::ToolInvokeFailed, format!("wait failed: {e}"))
        })?;

        Ok(ExecResult {
            stdout: truncate_bytes(output.stdout),
            stderr: truncate_bytes(output.stderr),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Base64 screenshot of any live browser session.
    pub async fn screenshot(&self) -> Result<String, Fault> {
        self.pool.screenshot_any().await
    }
}

fn truncate_bytes(bytes: Vec<u8>) -> String {
    let text = String::from_utf8_lossy(&bytes);
    if text.len() <= EXEC_OUTPUT_LIMIT {
        text.into_owned()
    } else {
        let mut end = EXEC_OUTPUT_LIMIT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}\n[... output truncated]", &text[..end])
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
