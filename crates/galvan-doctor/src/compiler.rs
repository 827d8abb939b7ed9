// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The plan compiler: intent text → ordered steps.
//!
//! Compilation is pattern matching against a closed set of recognizers in
//! a fixed order. Each recognizer is independent — it inspects the whole
//! sanitized intent and contributes zero or more steps. The frame is
//! always the same: `launch` first, `screenshot` + `close` last, and a
//! `verify` inserted before the final screenshot when any recognizer
//! derived an expected outcome.
//!
//! Timeouts come from per-action defaults (navigate 30 s, click/type 5 s,
//! verify 10 s) via [`Step::new`].

use regex::Regex;

use galvan_proto::{validate, Action, Plan, Step};

/// Everything a recognizer pass produced.
#[derive(Debug)]
pub struct CompiledIntent {
    pub steps: Vec<Step>,
    pub expected: Option<String>,
}

pub struct Compiler {
    navigation: Regex,
    login: Regex,
    post: Regex,
    approval: Regex,
    click: Regex,
    type_into: Regex,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        // Literal patterns: a failed compile here is a build defect, not a
        // runtime condition.
        let re = |pattern: &str| Regex::new(pattern).expect("recognizer pattern");
        Self {
            navigation: re(r"(?i)(?:navigate|go)\s+to\s+(\S+)"),
            // Password capture must stop at a comma so chained clauses
            // ("..., then click 'X'") survive.
            login: re(r"(?i)login\s+as\s+(\S+?)\s+with\s+password\s+([^,\s]+)"),
            post: re(
                r#"(?i)(?:submit|create|post)\s+(?:a\s+)?(?:post\s+)?titled\s+['"]?([^'",]+?)['"]?\s+with\s+content\s+['"]?([^'"]+?)['"]?(?:\s+to\s+(\w+))?\s*$"#,
            ),
            approval: re(r#"(?i)\bapprove\s+(?:post\s+titled\s+)?['"]?([^'"]+?)['"]?\s*$"#),
            click: re(r"(?i)\bclick\s+(?:'([^']+)'|([#.\[][^\s,]*|[^\s,]+))"),
            type_into: re(r"(?i)\btype\s+'([^']+)'\s+into\s+(\S+)"),
        }
    }

    /// Compile a sanitized intent into a plan. `explicit_url` is prepended
    /// as a navigation when the intent itself names none.
    pub fn compile(&self, intent: &str, explicit_url: Option<&str>) -> Plan {
        let intent = validate::sanitize_intent(intent);
        let mut steps = vec![Step::new(Action::Launch)];
        let mut expected: Option<String> = None;
        let mut base_url: Option<String> = None;

        // ── Navigation ────────────────────────────────────────────────────────
        if let Some(captures) = self.navigation.captures(&intent) {
            let url = captures[1].trim_end_matches(&[',', '.'][..]).to_string();
            base_url = Some(url.clone());
            steps.push(Step::new(Action::Navigate).with("url", url));
        } else if let Some(url) = explicit_url {
            base_url = Some(url.to_string());
            steps.push(Step::new(Action::Navigate).with("url", url));
        }

        // ── Login ─────────────────────────────────────────────────────────────
        if let Some(captures) = self.login.captures(&intent) {
            let email = captures[1].to_string();
            let password = captures[2].to_string();
            steps.push(Step::new(Action::Wait).with("ms", 1_000));
            steps.push(
                Step::new(Action::Type)
                    .with("selector", "[name=email]")
                    .with("text", email.clone()),
            );
            steps.push(
                Step::new(Action::Type)
                    .with("selector", "[name=password]")
                    .with("text", password),
            );
            steps.push(Step::new(Action::Screenshot));
            steps.push(
                Step::new(Action::Click)
                    .with("selector", "[type=submit]")
                    .with("waitForNavigation", true),
            );
            steps.push(Step::new(Action::Wait).with("ms", 500));
            expected = Some(format!("logged in as {email}"));
        }

        // ── Post submission ───────────────────────────────────────────────────
        if let Some(captures) = self.post.captures(&intent) {
            let title = captures[1].trim().to_string();
            let content = captures[2].trim().to_string();
            let subreddit = captures.get(3).map(|m| m.as_str().to_string());

            steps.push(Step::new(Action::Wait).with("ms", 2_000));
            steps.push(Step::new(Action::Screenshot));
            steps.push(
                Step::new(Action::Click)
                    .with("text", "Submit Post")
                    .with("waitForNavigation", true),
            );
            steps.push(
                Step::new(Action::Type)
                    .with("selector", "[name=title]")
                    .with("text", title.clone()),
            );
            steps.push(
                Step::new(Action::Type)
                    .with("selector", "[name=content]")
                    .with("text", content),
            );
            if let Some(sub) = subreddit {
                steps.push(
                    Step::new(Action::Select)
                        .with("selector", "[name=subreddit]")
                        .with("value", sub),
                );
            }
            steps.push(
                Step::new(Action::Click)
                    .with("selector", "[type=submit]")
                    .with("waitForNavigation", true),
            );
            steps.push(Step::new(Action::Wait).with("ms", 1_000));
            expected = Some(format!("post \"{title}\" submitted"));
        }

        // ── Approval ──────────────────────────────────────────────────────────
        if let Some(captures) = self.approval.captures(&intent) {
            let title = captures[1].trim().to_string();
            if let Some(base) = &base_url {
                steps.push(
                    Step::new(Action::Navigate)
                        .with("url", format!("{}/mod/queue", base.trim_end_matches('/'))),
                );
            }
            steps.push(Step::new(Action::Click).with("text", "Approve"));
            steps.push(Step::new(Action::Wait).with("ms", 500));
            expected = Some(format!("\"{title}\" approved"));
        }

        // ── Click ─────────────────────────────────────────────────────────────
        for captures in self.click.captures_iter(&intent) {
            let target = captures
                .get(1)
                .or_else(|| captures.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            if target.is_empty() {
                continue;
            }
            if looks_like_selector(target) {
                steps.push(Step::new(Action::Click).with("selector", target));
            } else {
                steps.push(Step::new(Action::Click).with("text", target));
            }
        }

        // ── Type ──────────────────────────────────────────────────────────────
        for captures in self.type_into.captures_iter(&intent) {
            steps.push(
                Step::new(Action::Type)
                    .with("selector", &captures[2])
                    .with("text", &captures[1]),
            );
        }

        // ── Frame ─────────────────────────────────────────────────────────────
        if let Some(outcome) = &expected {
            steps.push(
                Step::new(Action::Verify)
                    .with("expected", outcome.clone())
                    .with("captureScreenshot", true),
            );
        }
        steps.push(Step::new(Action::Screenshot));
        steps.push(Step::new(Action::Close));

        let mut plan = Plan::new(intent, steps);
        plan.expected_outcome = expected;
        plan
    }
}

/// `#id`, `.class` and `[attr=...]` targets are selectors; anything else
/// is visible text.
fn looks_like_selector(target: &str) -> bool {
    target.starts_with('#') || target.starts_with('.') || target.starts_with('[')
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn actions(plan: &Plan) -> Vec<Action> {
        plan.steps.iter().map(|s| s.action).collect()
    }

    #[test]
    fn happy_navigate_compiles_to_four_steps() {
        let plan = Compiler::new().compile("navigate to http://localhost:8080", None);
        assert_eq!(
            actions(&plan),
            vec![Action::Launch, Action::Navigate, Action::Screenshot, Action::Close]
        );
        assert_eq!(plan.steps[1].param_str("url"), Some("http://localhost:8080"));
    }

    #[test]
    fn login_pattern_with_chained_click() {
        let plan = Compiler::new().compile(
            "login as alice@example.com with password hunter2, then click 'Submit Post'",
            None,
        );

        let email_step = plan
            .steps
            .iter()
            .find(|s| s.action == Action::Type && s.param_str("selector") == Some("[name=email]"))
            .expect("email type step");
        assert_eq!(email_step.param_str("text"), Some("alice@example.com"));

        // Password capture terminates at the comma.
        let password_step = plan
            .steps
            .iter()
            .find(|s| s.param_str("selector") == Some("[name=password]"))
            .expect("password type step");
        assert_eq!(password_step.param_str("text"), Some("hunter2"));

        let submit = plan
            .steps
            .iter()
            .find(|s| s.action == Action::Click && s.param_str("selector") == Some("[type=submit]"))
            .expect("submit click");
        assert_eq!(submit.params["waitForNavigation"], json!(true));

        // The chained click lands after the login block.
        let chained = plan
            .steps
            .iter()
            .position(|s| s.param_str("text") == Some("Submit Post"))
            .expect("chained click");
        let submit_pos = plan
            .steps
            .iter()
            .position(|s| s.param_str("selector") == Some("[type=submit]"))
            .unwrap();
        assert!(chained > submit_pos);
    }

    #[test]
    fn explicit_url_is_prepended_when_intent_has_none() {
        let plan = Compiler::new().compile("click '#go'", Some("http://site.test"));
        assert_eq!(plan.steps[1].action, Action::Navigate);
        assert_eq!(plan.steps[1].param_str("url"), Some("http://site.test"));
    }

    #[test]
    fn intent_url_wins_over_explicit() {
        let plan = Compiler::new().compile("go to http://a.test", Some("http://b.test"));
        let navigations: Vec<_> = plan
            .steps
            .iter()
            .filter(|s| s.action == Action::Navigate)
            .collect();
        assert_eq!(navigations.len(), 1);
        assert_eq!(navigations[0].param_str("url"), Some("http://a.test"));
    }

    #[test]
    fn selector_click_heuristics() {
        let compiler = Compiler::new();
        let plan = compiler.compile("click #submit-button", None);
        let click = plan.steps.iter().find(|s| s.action == Action::Click).unwrap();
        assert_eq!(click.param_str("selector"), Some("#submit-button"));
        assert!(click.param_str("text").is_none());

        let plan = compiler.compile("click Approve", None);
        let click = plan.steps.iter().find(|s| s.action == Action::Click).unwrap();
        assert_eq!(click.param_str("text"), Some("Approve"));
    }

    #[test]
    fn type_into_recognizer() {
        let plan = Compiler::new().compile("type 'hello world' into [name=comment]", None);
        let typed = plan.steps.iter().find(|s| s.action == Action::Type).unwrap();
        assert_eq!(typed.param_str("text"), Some("hello world"));
        assert_eq!(typed.param_str("selector"), Some("[name=comment]"));
    }

    #[test]
    fn post_submission_with_subreddit() {
        let plan = Compiler::new().compile(
            "submit a post titled 'Hello' with content 'First post' to testsub",
            None,
        );
        let select = plan.steps.iter().find(|s| s.action == Action::Select).unwrap();
        assert_eq!(select.param_str("value"), Some("testsub"));
        assert!(plan.expected_outcome.as_deref().unwrap().contains("Hello"));
    }

    #[test]
    fn verify_precedes_the_final_screenshot_when_outcome_known() {
        let plan = Compiler::new().compile(
            "login as a@b.c with password x",
            Some("http://site.test"),
        );
        let verify = plan.steps.iter().position(|s| s.action == Action::Verify).unwrap();
        assert_eq!(plan.steps[verify + 1].action, Action::Screenshot);
        assert_eq!(plan.steps[verify + 2].action, Action::Close);
        assert_eq!(plan.steps[verify].params["captureScreenshot"], json!(true));
    }

    #[test]
    fn no_recognizer_still_yields_the_frame() {
        let plan = Compiler::new().compile("do something mysterious", None);
        assert_eq!(actions(&plan), vec![Action::Launch, Action::Screenshot, Action::Close]);
        assert!(plan.expected_outcome.is_none());
    }

    #[test]
    fn per_action_default_timeouts_are_attached() {
        let plan = Compiler::new().compile("navigate to http://a.test and click '#b'", None);
        let nav = plan.steps.iter().find(|s| s.action == Action::Navigate).unwrap();
        assert_eq!(nav.timeout_ms, Some(30_000));
        let click = plan.steps.iter().find(|s| s.action == Action::Click).unwrap();
        assert_eq!(click.timeout_ms, Some(5_000));
    }
}
