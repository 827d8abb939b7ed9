// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The single error taxonomy every component speaks.
//!
//! Errors cross the bus as a [`Fault`]: a closed kind tag, a human message,
//! and a flat context map. Each component recovers from whatever it can
//! locally (timeouts, retries, browser relaunch) and surfaces only the
//! irrecoverable residue as a `Fault` on a reply envelope.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of error kinds (the taxonomy tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Input rejected pre-execution. Never retried.
    ValidationFailed,
    BrowserNotLaunched,
    BrowserLimitReached,
    BrowserTimeout,
    ElementNotFound,
    NavigationFailed,
    ToolCompileFailed,
    ToolInvokeFailed,
    ToolTimeout,
    ToolNotFound,
    /// A bus peer asked for a message type nobody handles.
    UnknownAction,
    /// Bridge could not deliver a point-to-point message.
    Undeliverable,
    /// Bridge dropped a backpressured consumer.
    SlowConsumer,
    /// Rate limit or plan cap exceeded; the caller should back off.
    Overload,
    /// Synthetic: the Igor executing a plan died mid-flight.
    WorkerCrashed,
    /// Wraps an uncaught error; logged with its backtrace at the source.
    Unexpected,
}

impl FaultKind {
    /// Whether an executor may retry the failed step within its budget.
    ///
    /// Only transient browser conditions qualify; everything else is fatal
    /// to the step.
    pub fn retryable(self) -> bool {
        matches!(self, FaultKind::BrowserTimeout | FaultKind::ElementNotFound)
    }
}

/// A tagged error with its context map — the only error shape on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    /// Attach one context entry, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FaultKind::ValidationFailed, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Unexpected, message)
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    /// A stable one-line rendering used for failure-pattern extraction.
    ///
    /// Prefers the message, then a `code` context entry, then `details`,
    /// before falling back to the full JSON form.
    pub fn stable_string(&self) -> String {
        if !self.message.is_empty() {
            return self.message.clone();
        }
        if let Some(code) = self.context.get("code") {
            return code.clone();
        }
        if let Some(details) = self.context.get("details") {
            return details.clone();
        }
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self.kind))
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_as_snake_case() {
        let s = serde_json::to_string(&FaultKind::ElementNotFound).unwrap();
        assert_eq!(s, "\"element_not_found\"");
    }

    #[test]
    fn only_transient_browser_kinds_are_retryable() {
        assert!(FaultKind::BrowserTimeout.retryable());
        assert!(FaultKind::ElementNotFound.retryable());
        assert!(!FaultKind::NavigationFailed.retryable());
        assert!(!FaultKind::ValidationFailed.retryable());
        assert!(!FaultKind::WorkerCrashed.retryable());
    }

    #[test]
    fn context_map_round_trips() {
        let fault = Fault::new(FaultKind::ElementNotFound, "element not found: #submit")
            .with("selector", "#submit")
            .with("command", "click");
        let text = serde_json::to_string(&fault).unwrap();
        let back: Fault = serde_json::from_str(&text).unwrap();
        assert_eq!(back, fault);
        assert_eq!(back.context["selector"], "#submit");
    }

    #[test]
    fn empty_context_is_omitted_on_the_wire() {
        let fault = Fault::validation("bad url");
        assert!(!serde_json::to_string(&fault).unwrap().contains("context"));
    }

    #[test]
    fn stable_string_prefers_message_then_code() {
        let with_message = Fault::new(FaultKind::BrowserTimeout, "timed out after 30s");
        assert_eq!(with_message.stable_string(), "timed out after 30s");

        let code_only = Fault::new(FaultKind::BrowserTimeout, "").with("code", "ETIMEDOUT");
        assert_eq!(code_only.stable_string(), "ETIMEDOUT");
    }
}
