// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Dynamic tool records and pending tool-creation requests.
//!
//! The record is the *external* contract of a Frankenstein dynamic tool:
//! name, schema, counters, promotion status. The executable side (the
//! parsed tool program) lives in `galvan-frank`; on the wire the program
//! travels as the opaque `code` document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Invocation floor for igorify candidacy.
pub const IGORIFY_MIN_INVOCATIONS: u64 = 10;

/// Success-rate floor for igorify candidacy.
pub const IGORIFY_MIN_SUCCESS_RATE: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Experimental,
    /// Operator-managed; never set automatically.
    Stable,
    /// Exported for integration into the static tool set.
    Igorified,
    Deprecated,
}

/// One dynamic tool as stored by Frankenstein.
///
/// Invariant: `name` is unique among non-deleted tools, and the id→tool and
/// name→tool lookups always agree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    /// The declarative tool program, as submitted.
    pub code: Value,
    /// JSON-Schema-shaped description of the invocation parameters.
    pub input_schema: Value,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub igorified_at: Option<DateTime<Utc>>,
}

impl ToolRecord {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        code: Value,
        input_schema: Value,
        author: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("tool-{}", Uuid::new_v4()),
            name: name.into(),
            description: description.into(),
            code,
            input_schema,
            author: author.into(),
            created_at: now,
            updated_at: now,
            invocations: 0,
            successes: 0,
            failures: 0,
            last_used: None,
            last_error: None,
            status: ToolStatus::Experimental,
            igorified_at: None,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.invocations == 0 {
            return 0.0;
        }
        self.successes as f64 / self.invocations as f64
    }

    /// An experimental tool that has proven itself is a candidate for
    /// promotion out of the experimental pool.
    pub fn igorify_candidate(&self) -> bool {
        self.status == ToolStatus::Experimental
            && self.invocations >= IGORIFY_MIN_INVOCATIONS
            && self.success_rate() >= IGORIFY_MIN_SUCCESS_RATE
    }

    /// Language-neutral export artifact: name, schema, stats, code skeleton.
    pub fn export_artifact(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
            "stats": {
                "invocations": self.invocations,
                "successes": self.successes,
                "failures": self.failures,
                "successRate": self.success_rate(),
            },
            "code": self.code,
        })
    }
}

/// Provenance of a tool-bag entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolBagKind {
    /// Curated, compiled into the Doctor's registry.
    Static,
    /// A Frankenstein dynamic tool, invocable via `tool.invoke`.
    Dynamic,
}

/// One tool attached to a plan submission. The executor may call only
/// tools from its bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolBagEntry {
    pub name: String,
    pub description: String,
    pub kind: ToolBagKind,
    /// Frank registry id, present for dynamic entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
}

/// One outstanding `tool.create` the Doctor is waiting on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingToolRequest {
    /// Id of the `tool.create` envelope; the `tool.created` / `tool.error`
    /// reply carries it as its correlation id.
    pub request_id: Uuid,
    pub plan_id: Uuid,
    pub step_index: usize,
    pub pattern_key: String,
    pub tool_name: String,
    pub created_at: DateTime<Utc>,
}

// ── Unit tests ────────────────────────────────────────────────────────────────
