// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Failure patterns — normalized equivalence classes of step errors.
//!
//! The Doctor decides whether a new tool would help by counting *patterns*,
//! not raw error strings. Two errors that differ only in quoted substrings
//! or digit runs (a selector, a port, a timeout value) collapse to the same
//! key.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum key length after normalization.
const KEY_MAX_LEN: usize = 100;

/// Derive the normalized pattern key for a failed step.
///
/// Normalization, in order: strip quoted substrings (single and double),
/// replace digit runs with `N`, collapse whitespace, truncate to 100 chars.
pub fn normalize_failure_key(action: &str, selector: Option<&str>, error: &str) -> String {
    let mut raw = String::with_capacity(error.len() + 32);
    raw.push_str(action);
    raw.push(':');
    if let Some(sel) = selector {
        raw.push_str(sel);
        raw.push(':');
    }
    raw.push_str(error);

    let stripped = strip_quoted(&raw);

    let mut out = String::with_capacity(stripped.len());
    let mut in_digits = false;
    let mut in_space = false;
    for ch in stripped.chars() {
        if ch.is_ascii_digit() {
            if !in_digits {
                out.push('N');
                in_digits = true;
            }
            in_space = false;
            continue;
        }
        in_digits = false;
        if ch.is_whitespace() {
            if !in_space && !out.is_empty() {
                out.push(' ');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        out.push(ch);
    }

    let trimmed = out.trim_end();
    trimmed.chars().take(KEY_MAX_LEN).collect()
}

/// Remove the contents of quoted regions, keeping the quotes as markers.
fn strip_quoted(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut quote: Option<char> = None;
    for ch in input.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    out.push(q);
                    quote = None;
                }
                // interior characters are dropped
            }
            None => {
                out.push(ch);
                if ch == '\'' || ch == '"' {
                    quote = Some(ch);
                }
            }
        }
    }
    out
}

/// One normalized failure class and its occurrence history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailurePattern {
    pub key: String,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub plan_ids: BTreeSet<Uuid>,
    /// Set once a `tool.create` has been issued for this pattern. Cleared
    /// again if the creation errors, so it may be re-requested.
    pub tool_requested: bool,
    /// Name of the tool that was eventually created, if any. Invariant:
    /// `tool_created.is_some()` implies `tool_requested`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_created: Option<String>,
}

impl FailurePattern {
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            count: 0,
            first_seen: now,
            last_seen: now,
            plan_ids: BTreeSet::new(),
            tool_requested: false,
            tool_created: None,
        }
    }

    /// Record one more occurrence from the given plan.
    pub fn record(&mut self, plan_id: Uuid) {
        self.count += 1;
        self.last_seen = Utc::now();
        self.plan_ids.insert(plan_id);
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_strings_collapse_to_one_key() {
        let a = normalize_failure_key("click", None, "element not found: '#submit-btn'");
        let b = normalize_failure_key("click", None, "element not found: '.other-widget'");
        assert_eq!(a, b);
    }

    #[test]
    fn digit_runs_collapse_to_one_key() {
        let a = normalize_failure_key("navigate", None, "timeout after 3000 ms on port 8080");
        let b = normalize_failure_key("navigate", None, "timeout after 45000 ms on port 3000");
        assert_eq!(a, b);
        assert!(a.contains("N ms"));
    }

    #[test]
    fn whitespace_is_collapsed() {
        let a = normalize_failure_key("type", None, "bad   input\n\tvalue");
        assert_eq!(a, "type:bad input value");
    }

    #[test]
    fn key_is_truncated_to_one_hundred_chars() {
        let long = "x".repeat(500);
        let key = normalize_failure_key("wait", None, &long);
        assert_eq!(key.chars().count(), 100);
    }

    #[test]
    fn selector_participates_in_the_key() {
        let with = normalize_failure_key("click", Some("#a"), "element not found");
        let without = normalize_failure_key("click", None, "element not found");
        assert_ne!(with, without);
    }

    #[test]
    fn distinct_actions_never_collide() {
        let a = normalize_failure_key("click", None, "boom");
        let b = normalize_failure_key("type", None, "boom");
        assert_ne!(a, b);
    }

    #[test]
    fn record_tracks_count_and_plans() {
        let mut pattern = FailurePattern::new("k");
        let plan = Uuid::new_v4();
        pattern.record(plan);
        pattern.record(plan);
        assert_eq!(pattern.count, 2);
        assert_eq!(pattern.plan_ids.len(), 1);
    }
}
