// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Pre-execution validation: intents, urls, selectors, whole plans.
//!
//! Everything here rejects *before* a plan reaches a worker; a validation
//! failure is never retried and surfaces straight back to the caller as a
//! [`FaultKind::ValidationFailed`].

use serde_json::Value;

use crate::fault::{Fault, FaultKind};
use crate::plan::{Action, Plan};

/// Hard cap on plan length.
pub const MAX_PLAN_STEPS: usize = 50;

/// Hard cap on any text parameter.
pub const MAX_TEXT_LEN: usize = 10_000;

/// Intents longer than this are truncated deterministically.
pub const MAX_INTENT_LEN: usize = 2_000;

/// Sanitize an intent: drop control characters, then truncate at the cap.
///
/// Truncation is deterministic — always the same prefix for the same input.
pub fn sanitize_intent(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_control() || *c == ' ')
        .take(MAX_INTENT_LEN)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Url policy: http(s) only, with localhost gated behind a switch.
pub fn validate_url(url: &str, allow_localhost: bool) -> Result<(), Fault> {
    let rest = if let Some(rest) = url.strip_prefix("https://") {
        rest
    } else if let Some(rest) = url.strip_prefix("http://") {
        rest
    } else {
        return Err(Fault::new(
            FaultKind::ValidationFailed,
            format!("url must be http(s): {url}"),
        )
        .with("url", url));
    };

    let host = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .split(':')
        .next()
        .unwrap_or_default();

    if host.is_empty() {
        return Err(Fault::validation(format!("url has no host: {url}")).with("url", url));
    }

    if !allow_localhost && is_local_host(host) {
        return Err(
            Fault::validation(format!("localhost urls are disabled: {url}")).with("url", url),
        );
    }
    Ok(())
}

fn is_local_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host == "127.0.0.1"
        || host == "::1"
        || host == "0.0.0.0"
}

/// Selectors must be non-empty and free of control characters.
pub fn validate_selector(selector: &str) -> Result<(), Fault> {
    if selector.trim().is_empty() {
        return Err(Fault::validation("selector is empty"));
    }
    if selector.chars().any(char::is_control) {
        return Err(
            Fault::validation("selector contains control characters").with("selector", selector)
        );
    }
    Ok(())
}

pub fn validate_text(text: &str) -> Result<(), Fault> {
    if text.len() > MAX_TEXT_LEN {
        return Err(Fault::validation(format!(
            "text exceeds {MAX_TEXT_LEN} chars ({})",
            text.len()
        )));
    }
    Ok(())
}

/// Validate a whole compiled plan against the submission rules.
pub fn validate_plan(plan: &Plan, allow_localhost: bool) -> Result<(), Fault> {
    if plan.steps.is_empty() {
        return Err(Fault::validation("plan has no steps"));
    }
    if plan.steps.len() > MAX_PLAN_STEPS {
        return Err(Fault::validation(format!(
            "plan has {} steps, cap is {MAX_PLAN_STEPS}",
            plan.steps.len()
        )));
    }

    for (index, step) in plan.steps.iter().enumerate() {
        let fail = |fault: Fault| fault.with("stepIndex", index.to_string());

        if step.action == Action::Navigate {
            match step.param_str("url") {
                Some(url) => validate_url(url, allow_localhost).map_err(fail)?,
                None => return Err(fail(Fault::validation("navigate step has no url"))),
            }
        }
        if let Some(selector) = step.param_str("selector") {
            validate_selector(selector).map_err(fail)?;
        }
        for key in ["text", "value", "expected"] {
            if let Some(Value::String(text)) = step.params.get(key) {
                validate_text(text).map_err(fail)?;
            }
        }
    }
    Ok(())
}

// ── Unit tests ────────────────────────────────────────────────────────────────
