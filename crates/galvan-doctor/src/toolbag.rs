// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Tool bag selection: which tools ride along with a plan submission.
//!
//! Static tools are scored by keyword hits against the intent (weighted,
//! highest first, deduplicated, capped); every currently-known Frank
//! dynamic tool is appended unconditionally — the executor decides at
//! failure time whether any of them applies. The bag is a hard boundary:
//! Igor may call only tools listed in it.

use galvan_proto::{ToolBagEntry, ToolBagKind, ToolRecord};

/// Cap on static entries per bag.
pub const MAX_STATIC_TOOLS: usize = 5;

/// One curated static tool.
pub struct StaticTool {
    pub name: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub weight: u32,
    pub keywords: &'static [&'static str],
}

pub const STATIC_TOOLS: &[StaticTool] = &[
    StaticTool {
        name: "navigation_helper",
        description: "Resolves relative urls and waits out redirects",
        category: "navigation",
        weight: 3,
        keywords: &["navigate", "go to", "url", "page", "redirect"],
    },
    StaticTool {
        name: "login_helper",
        description: "Fills credential forms and waits for the session cookie",
        category: "auth",
        weight: 5,
        keywords: &["login", "log in", "sign in", "password", "credentials"],
    },
    StaticTool {
        name: "form_filler",
        description: "Types into labeled inputs and textareas",
        category: "forms",
        weight: 4,
        keywords: &["type", "fill", "form", "input", "field", "content"],
    },
    StaticTool {
        name: "submit_helper",
        description: "Finds and clicks the effective submit control",
        category: "forms",
        weight: 4,
        keywords: &["submit", "post", "create", "send", "save"],
    },
    StaticTool {
        name: "moderation_helper",
        description: "Navigates moderation queues and approval controls",
        category: "moderation",
        weight: 5,
        keywords: &["approve", "moderate", "mod queue", "reject"],
    },
    StaticTool {
        name: "screenshot_compare",
        description: "Captures and diffs screenshots for verification",
        category: "verification",
        weight: 2,
        keywords: &["verify", "screenshot", "compare", "expect"],
    },
    StaticTool {
        name: "scroll_helper",
        description: "Scrolls elements into view before interaction",
        category: "interaction",
        weight: 2,
        keywords: &["scroll", "below", "bottom", "into view"],
    },
    StaticTool {
        name: "signup_helper",
        description: "Walks multi-step registration flows",
        category: "auth",
        weight: 4,
        keywords: &["signup", "sign up", "register", "registration", "account"],
    },
];

/// Score the intent against the static table and assemble the bag.
/// Returns the bag plus a human-readable selection rationale (attached to
/// `plan.submit` as `toolSelectionReasoning`).
pub fn select_tool_bag(intent: &str, dynamic_tools: &[ToolRecord]) -> (Vec<ToolBagEntry>, String) {
    let lowered = intent.to_ascii_lowercase();

    let mut scored: Vec<(u32, &StaticTool, Vec<&str>)> = STATIC_TOOLS
        .iter()
        .filter_map(|tool| {
            let hits: Vec<&str> = tool
                .keywords
                .iter()
                .copied()
                .filter(|keyword| lowered.contains(keyword))
                .collect();
            if hits.is_empty() {
                None
            } else {
                Some((tool.weight * hits.len() as u32, tool, hits))
            }
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.name.cmp(b.1.name)));

    let mut bag: Vec<ToolBagEntry> = Vec::new();
    let mut reasoning = String::new();
    for (score, tool, hits) in scored.into_iter().take(MAX_STATIC_TOOLS) {
        if bag.iter().any(|entry| entry.name == tool.name) {
            continue;
        }
        reasoning.push_str(&format!(
            "{} (score {score}, matched {}); ",
            tool.name,
            hits.join(", ")
        ));
        bag.push(ToolBagEntry {
            name: tool.name.to_string(),
            description: tool.description.to_string(),
            kind: ToolBagKind::Static,
            tool_id: None,
        });
    }

    for record in dynamic_tools {
        bag.push(ToolBagEntry {
            name: record.name.clone(),
            description: record.description.clone(),
            kind: ToolBagKind::Dynamic,
            tool_id: Some(record.id.clone()),
        });
    }
    if !dynamic_tools.is_empty() {
        reasoning.push_str(&format!("{} dynamic tools appended", dynamic_tools.len()));
    }
    if reasoning.is_empty() {
        reasoning.push_str("no keyword matches; empty static selection");
    }

    (bag, reasoning.trim_end_matches(&[' ', ';'][..]).to_string())
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dynamic(name: &str) -> ToolRecord {
        ToolRecord::new(name, "generated", json!({"steps": []}), json!({}), "doctor")
    }

    #[test]
    fn login_intents_rank_the_login_helper_first() {
        let (bag, reasoning) =
            select_tool_bag("login as a@b.c with password x", &[]);
        assert_eq!(bag[0].name, "login_helper");
        assert!(reasoning.contains("login_helper"));
    }

    #[test]
    fn static_selection_is_capped() {
        let intent = "login and sign up, navigate to the page, type into the form, \
                      submit the post, verify the screenshot, scroll down, approve it";
        let (bag, _) = select_tool_bag(intent, &[]);
        let statics = bag.iter().filter(|e| e.kind == ToolBagKind::Static).count();
        assert!(statics <= MAX_STATIC_TOOLS);
    }

    #[test]
    fn dynamic_tools_are_always_appended() {
        let tools = vec![dynamic("auto_smart_selector_1"), dynamic("auto_wait_helper_2")];
        let (bag, reasoning) = select_tool_bag("navigate to http://x.test", &tools);
        let dynamics: Vec<_> = bag
            .iter()
            .filter(|e| e.kind == ToolBagKind::Dynamic)
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(dynamics, vec!["auto_smart_selector_1", "auto_wait_helper_2"]);
        assert!(bag.iter().all(|e| e.kind != ToolBagKind::Dynamic || e.tool_id.is_some()));
        assert!(reasoning.contains("2 dynamic tools"));
    }

    #[test]
    fn no_matches_yields_only_dynamics() {
        let (bag, reasoning) = select_tool_bag("frobnicate the quux", &[dynamic("t")]);
        assert_eq!(bag.len(), 1);
        assert!(reasoning.contains("no keyword matches"));
    }
}
