// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Step → browser-command translation and retry pacing.

use serde_json::{json, Value};

use galvan_proto::{msg, Action, Step};

/// Base delay for the first retry.
const BACKOFF_BASE_MS: u64 = 500;

/// Longest single backoff.
const BACKOFF_CAP_MS: u64 = 15_000;

/// The bus message a browser-backed step turns into, or `None` for steps
/// Igor performs locally (`wait`, and the verify bookkeeping around its
/// screenshot).
pub fn browser_command(step: &Step) -> Option<(&'static str, Value)> {
    let mut payload = match step.action {
        Action::Launch => json!({}),
        Action::Navigate => json!({"url": step.param_str("url")}),
        Action::Click => {
            let mut p = json!({});
            if let Some(selector) = step.param_str("selector") {
                p["selector"] = json!(selector);
            }
            if let Some(text) = step.param_str("text") {
                p["text"] = json!(text);
            }
            if let Some(wait) = step.params.get("waitForNavigation") {
                p["waitForNavigation"] = wait.clone();
            }
            p
        }
        Action::Type => json!({
            "selector": step.param_str("selector"),
            "text": step.param_str("text"),
        }),
        Action::Select => json!({
            "selector": step.param_str("selector"),
            "value": step.param_str("value"),
        }),
        Action::Screenshot | Action::Verify => json!({}),
        Action::Close => json!({}),
        Action::Wait => return None,
    };

    let kind = match step.action {
        Action::Launch => msg::BROWSER_LAUNCH,
        Action::Navigate => msg::BROWSER_NAVIGATE,
        Action::Click => msg::BROWSER_CLICK,
        Action::Type => msg::BROWSER_TYPE,
        Action::Select => msg::BROWSER_SELECT,
        Action::Screenshot | Action::Verify => msg::BROWSER_SCREENSHOT,
        Action::Close => msg::BROWSER_CLOSE,
        Action::Wait => unreachable!(),
    };

    if let Some(timeout) = step.timeout_ms {
        payload["timeoutMs"] = json!(timeout);
    }
    Some((kind, payload))
}

/// Milliseconds a `wait` step pauses for.
pub fn wait_duration_ms(step: &Step) -> u64 {
    step.params
        .get("ms")
        .and_then(Value::as_u64)
        .unwrap_or(1_000)
}

/// Exponential backoff with ±20% jitter: 500 ms, 1 s, 2 s, ... capped.
pub fn backoff_ms(attempt: u32, jitter: f64) -> u64 {
    debug_assert!((-1.0..=1.0).contains(&jitter));
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(10)) as f64;
    let jittered = base * (1.0 + 0.2 * jitter);
    (jittered as u64).min(BACKOFF_CAP_MS)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_steps_are_local() {
        let step = Step::new(Action::Wait).with("ms", 250);
        assert!(browser_command(&step).is_none());
        assert_eq!(wait_duration_ms(&step), 250);
    }

    #[test]
    fn wait_defaults_to_one_second() {
        assert_eq!(wait_duration_ms(&Step::new(Action::Wait)), 1_000);
    }

    #[test]
    fn click_payload_carries_target_and_navigation_flag() {
        let step = Step::new(Action::Click)
            .with("text", "Submit Post")
            .with("waitForNavigation", true);
        let (kind, payload) = browser_command(&step).unwrap();
        assert_eq!(kind, msg::BROWSER_CLICK);
        assert_eq!(payload["text"], "Submit Post");
        assert_eq!(payload["waitForNavigation"], true);
    }

    #[test]
    fn step_timeout_rides_along() {
        let step = Step::new(Action::Navigate).with("url", "http://a.test");
        let (_, payload) = browser_command(&step).unwrap();
        assert_eq!(payload["timeoutMs"], 30_000);
    }

    #[test]
    fn verify_maps_to_screenshot() {
        let step = Step::new(Action::Verify).with("expected", "logged in");
        let (kind, _) = browser_command(&step).unwrap();
        assert_eq!(kind, msg::BROWSER_SCREENSHOT);
    }

    #[test]
    fn backoff_doubles_and_respects_jitter_band() {
        assert_eq!(backoff_ms(0, 0.0), 500);
        assert_eq!(backoff_ms(1, 0.0), 1_000);
        assert_eq!(backoff_ms(2, 0.0), 2_000);

        // ±20% envelope around the 500 ms base.
        assert_eq!(backoff_ms(0, 1.0), 600);
        assert_eq!(backoff_ms(0, -1.0), 400);
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_ms(30, 1.0), BACKOFF_CAP_MS);
    }
}
