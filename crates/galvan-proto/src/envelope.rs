// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The single message envelope used for every frame on the bus.
//!
//! All interior communication — point-to-point and broadcast — is a JSON
//! text frame containing one [`Envelope`]. Envelopes are immutable once
//! emitted; a reply is always a *new* envelope whose `correlation_id`
//! equals the originating request's `id`.
//!
//! ```rust
//! use galvan_proto::{Envelope, BROADCAST};
//! use serde_json::json;
//!
//! let req = Envelope::new("doctor", "frank", "tool.invoke", json!({"toolId": "t1"}));
//! let rep = req.reply("frank", "tool.result", json!({"ok": true}));
//! assert_eq!(rep.correlation_id, Some(req.id));
//!
//! let ev = Envelope::new("frank", BROADCAST, "event.console", json!({"line": "hi"}));
//! assert!(ev.is_broadcast());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Target value that addresses every connected component except the sender.
pub const BROADCAST: &str = "broadcast";

/// One frame on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique message id. Replies reference it via `correlation_id`.
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Component id of the sender.
    pub source: String,
    /// Component id of the receiver, or [`BROADCAST`].
    pub target: String,
    /// Dot-separated message type, e.g. `plan.submit` or `step.failed`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Set on replies and derived events: the id of the originating request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Build a fresh envelope with a new id and the current timestamp.
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        kind: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            target: target.into(),
            kind: kind.into(),
            correlation_id: None,
            payload,
        }
    }

    /// Build a reply to this envelope, addressed back at its sender with
    /// `correlation_id = self.id`.
    pub fn reply(&self, source: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            target: self.source.clone(),
            kind: kind.into(),
            correlation_id: Some(self.id),
            payload,
        }
    }

    /// Attach a correlation id to a fresh envelope (for derived events that
    /// are not direct replies).
    pub fn with_correlation(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target == BROADCAST
    }

    /// Encode to the JSON text-frame form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
