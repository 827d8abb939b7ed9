// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Branching detection — the second, orthogonal analyzer over an intent.
//!
//! A fixed table of branch rules looks for flows that must be exercised as
//! several variants at once (male/female signup, admin/user/guest, A/B).
//! On a hit the compiler produces one independent route plan per variant,
//! each with a route-specific interaction inserted right after the first
//! navigation, and the scheduler asks for one route-specialized Igor per
//! route.

use regex::Regex;

use galvan_proto::{Action, Plan, RouteDescriptor, Step};

use crate::compiler::Compiler;

/// A detected branch point.
#[derive(Debug, Clone)]
pub struct BranchPoint {
    pub description: String,
    pub routes: Vec<RouteDescriptor>,
}

struct BranchRule {
    pattern: Regex,
    description: &'static str,
    routes: fn() -> Vec<RouteDescriptor>,
}

pub struct BranchDetector {
    rules: Vec<BranchRule>,
}

fn route(id: &str, name: &str, selector: &str, value: &str) -> RouteDescriptor {
    RouteDescriptor {
        id: id.to_string(),
        name: name.to_string(),
        selector: Some(selector.to_string()),
        value: Some(value.to_string()),
    }
}

impl Default for BranchDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl BranchDetector {
    pub fn new() -> Self {
        let re = |pattern: &str| Regex::new(pattern).expect("branch pattern");
        Self {
            rules: vec![
                BranchRule {
                    pattern: re(
                        r"(?i)\b(?:boy|male)\b.*\b(?:girl|female)\b|\b(?:girl|female)\b.*\b(?:boy|male)\b",
                    ),
                    description: "gender selection",
                    routes: || {
                        vec![
                            route("boy", "Boy", "[name=gender]", "boy"),
                            route("girl", "Girl", "[name=gender]", "girl"),
                        ]
                    },
                },
                BranchRule {
                    pattern: re(r"(?i)\badmin\b.*\b(?:user|guest)\b|\b(?:user|guest)\b.*\badmin\b"),
                    description: "role selection",
                    routes: || {
                        vec![
                            route("admin", "Admin", "[name=role]", "admin"),
                            route("user", "User", "[name=role]", "user"),
                            route("guest", "Guest", "[name=role]", "guest"),
                        ]
                    },
                },
                BranchRule {
                    pattern: re(r"(?i)\bvariant\s+a\b.*\bvariant\s+b\b|\ba/b\s+(?:test|variant)"),
                    description: "a/b variant",
                    routes: || {
                        vec![
                            route("variant-a", "Variant A", "[data-variant=a]", "a"),
                            route("variant-b", "Variant B", "[data-variant=b]", "b"),
                        ]
                    },
                },
            ],
        }
    }

    /// First matching rule wins; the table order is fixed.
    pub fn detect(&self, intent: &str) -> Option<BranchPoint> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(intent))
            .map(|rule| BranchPoint {
                description: rule.description.to_string(),
                routes: (rule.routes)(),
            })
    }
}

/// Compile one plan per route: the base recognizer pipeline plus the
/// route-specific first interaction inserted after `navigate` (or after
/// `launch` when the plan never navigates).
pub fn compile_route_plans(
    compiler: &Compiler,
    intent: &str,
    explicit_url: Option<&str>,
    parent_id: uuid::Uuid,
    branch: &BranchPoint,
) -> Vec<Plan> {
    branch
        .routes
        .iter()
        .map(|descriptor| {
            let mut plan = compiler.compile(intent, explicit_url);
            plan.parent_plan_id = Some(parent_id);
            plan.route = Some(descriptor.clone());

            let interaction = route_interaction(descriptor);
            let insert_at = plan
                .steps
                .iter()
                .position(|s| s.action == Action::Navigate)
                .map(|index| index + 1)
                .unwrap_or(1);
            if let Some(step) = interaction {
                plan.steps.insert(insert_at, step);
            }
            plan
        })
        .collect()
}

fn route_interaction(descriptor: &RouteDescriptor) -> Option<Step> {
    match (&descriptor.selector, &descriptor.value) {
        (Some(selector), Some(value)) => Some(
            Step::new(Action::Select)
                .with("selector", selector.clone())
                .with("value", value.clone()),
        ),
        (Some(selector), None) => Some(Step::new(Action::Click).with("selector", selector.clone())),
        _ => None,
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gender_branching_is_detected() {
        let detector = BranchDetector::new();
        let branch = detector
            .detect("run the full signup flow for both boy and girl users")
            .expect("branch point");
        assert_eq!(branch.description, "gender selection");
        let ids: Vec<_> = branch.routes.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["boy", "girl"]);
    }

    #[test]
    fn role_branching_covers_three_routes() {
        let detector = BranchDetector::new();
        let branch = detector
            .detect("exercise the dashboard as admin and as a normal user")
            .expect("branch point");
        assert_eq!(branch.description, "role selection");
        assert_eq!(branch.routes.len(), 3);
    }

    #[test]
    fn plain_intents_do_not_branch() {
        let detector = BranchDetector::new();
        assert!(detector.detect("navigate to http://a.test").is_none());
        assert!(detector.detect("login as x@y.z with password w").is_none());
    }

    #[test]
    fn route_plans_get_the_interaction_after_navigate() {
        let compiler = Compiler::new();
        let detector = BranchDetector::new();
        let intent = "go to http://signup.test and register both boy and girl users";
        let branch = detector.detect(intent).unwrap();
        let parent = uuid::Uuid::new_v4();

        let plans = compile_route_plans(&compiler, intent, None, parent, &branch);
        assert_eq!(plans.len(), 2);

        for (plan, expected_route) in plans.iter().zip(["boy", "girl"]) {
            assert_eq!(plan.parent_plan_id, Some(parent));
            assert_eq!(plan.route.as_ref().unwrap().id, expected_route);

            let nav = plan
                .steps
                .iter()
                .position(|s| s.action == Action::Navigate)
                .unwrap();
            let interaction = &plan.steps[nav + 1];
            assert_eq!(interaction.action, Action::Select);
            assert_eq!(interaction.param_str("value"), Some(expected_route));
        }
    }

    #[test]
    fn route_plans_without_navigation_insert_after_launch() {
        let compiler = Compiler::new();
        let detector = BranchDetector::new();
        let intent = "sign up both boy and girl users";
        let branch = detector.detect(intent).unwrap();

        let plans = compile_route_plans(&compiler, intent, None, uuid::Uuid::new_v4(), &branch);
        assert_eq!(plans[0].steps[0].action, Action::Launch);
        assert_eq!(plans[0].steps[1].action, Action::Select);
    }
}
