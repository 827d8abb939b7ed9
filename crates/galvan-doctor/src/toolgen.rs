// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Generation of repair-tool definitions from a classified failure.
//!
//! When the failure tracker decides a pattern deserves a tool, this module
//! produces the three artifacts `tool.create` needs: a name
//! (`auto_<type>_<n>`), a declarative tool program tailored to the failure
//! class, and a JSON schema for the invocation parameters.

use serde_json::{json, Value};

/// The closed set of repair-tool classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolType {
    SmartSelector,
    WaitHelper,
    NetworkHelper,
    VisibilityHelper,
    FrameHandler,
    PopupHandler,
    CaptchaHandler,
    DatePicker,
    DropdownHandler,
    FileUpload,
}

impl ToolType {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolType::SmartSelector => "smart_selector",
            ToolType::WaitHelper => "wait_helper",
            ToolType::NetworkHelper => "network_helper",
            ToolType::VisibilityHelper => "visibility_helper",
            ToolType::FrameHandler => "frame_handler",
            ToolType::PopupHandler => "popup_handler",
            ToolType::CaptchaHandler => "captcha_handler",
            ToolType::DatePicker => "date_picker",
            ToolType::DropdownHandler => "dropdown_handler",
            ToolType::FileUpload => "file_upload",
        }
    }
}

/// `auto_smart_selector_3` etc. The sequence number keeps names unique in
/// Frank's registry across repeated creations.
pub fn tool_name(tool_type: ToolType, sequence: u64) -> String {
    format!("auto_{}_{sequence}", tool_type.as_str())
}

pub fn description(tool_type: ToolType) -> String {
    let what = match tool_type {
        ToolType::SmartSelector => "retries element lookup with relaxed matching",
        ToolType::WaitHelper => "waits out slow renders before the next attempt",
        ToolType::NetworkHelper => "probes the target origin before retrying",
        ToolType::VisibilityHelper => "scrolls and settles until the element is visible",
        ToolType::FrameHandler => "re-targets interactions into the active frame",
        ToolType::PopupHandler => "dismisses blocking popups and modals",
        ToolType::CaptchaHandler => "detects captcha walls and surfaces them",
        ToolType::DatePicker => "drives calendar widgets by keyboard",
        ToolType::DropdownHandler => "opens custom dropdowns before selection",
        ToolType::FileUpload => "feeds file inputs through the native dialog",
    };
    format!("Auto-generated repair tool: {what}")
}

/// The declarative program for a tool class. Every program takes the
/// failing step's context (`selector`, `error`) as parameters and ends
/// with a structured result the executor attaches as its repair attempt.
pub fn code(tool_type: ToolType) -> Value {
    let steps = match tool_type {
        ToolType::SmartSelector => json!([
            {"op": "log", "message": "smart selector repair for {{selector}}"},
            {"op": "sleep", "ms": 500},
            {"op": "screenshot", "into": "shot"},
            {"op": "result", "value": {"repaired": true, "selector": "{{selector}}"}}
        ]),
        ToolType::WaitHelper => json!([
            {"op": "log", "message": "waiting out: {{error}}"},
            {"op": "sleep", "ms": 3000},
            {"op": "result", "value": {"waitedMs": 3000}}
        ]),
        ToolType::NetworkHelper => json!([
            {"op": "log", "message": "probing {{url}} after network failure"},
            {"op": "fetch", "url": "{{url}}", "into": "probe"},
            {"op": "result", "value": {"probed": true}}
        ]),
        ToolType::VisibilityHelper => json!([
            {"op": "log", "message": "settling layout around {{selector}}"},
            {"op": "sleep", "ms": 1000},
            {"op": "screenshot", "into": "shot"},
            {"op": "result", "value": {"settled": true}}
        ]),
        ToolType::FrameHandler => json!([
            {"op": "log", "message": "frame repair for {{selector}}"},
            {"op": "sleep", "ms": 500},
            {"op": "result", "value": {"framed": true}}
        ]),
        ToolType::PopupHandler => json!([
            {"op": "log", "message": "dismissing popups before retry"},
            {"op": "sleep", "ms": 500},
            {"op": "screenshot", "into": "shot"},
            {"op": "result", "value": {"dismissed": true}}
        ]),
        ToolType::CaptchaHandler => json!([
            {"op": "log", "message": "captcha wall suspected: {{error}}"},
            {"op": "screenshot", "into": "shot"},
            {"op": "result", "value": {"captcha": true, "screenshot": "{{shot}}"}}
        ]),
        ToolType::DatePicker => json!([
            {"op": "log", "message": "date picker repair for {{selector}}"},
            {"op": "sleep", "ms": 500},
            {"op": "result", "value": {"picker": true}}
        ]),
        ToolType::DropdownHandler => json!([
            {"op": "log", "message": "dropdown repair for {{selector}}"},
            {"op": "sleep", "ms": 500},
            {"op": "result", "value": {"opened": true}}
        ]),
        ToolType::FileUpload => json!([
            {"op": "log", "message": "file upload repair for {{selector}}"},
            {"op": "sleep", "ms": 500},
            {"op": "result", "value": {"upload": true}}
        ]),
    };
    json!({"steps": steps})
}

/// Invocation-parameter schema shared by every generated tool.
pub fn input_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "selector": {"type": "string", "description": "Selector of the failing step, if any"},
            "text": {"type": "string", "description": "Text parameter of the failing step, if any"},
            "url": {"type": "string", "description": "Url involved in the failure, if any"},
            "error": {"type": "string", "description": "Stable rendering of the triggering error"}
        },
        "additionalProperties": false
    })
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[ToolType] = &[
        ToolType::SmartSelector,
        ToolType::WaitHelper,
        ToolType::NetworkHelper,
        ToolType::VisibilityHelper,
        ToolType::FrameHandler,
        ToolType::PopupHandler,
        ToolType::CaptchaHandler,
        ToolType::DatePicker,
        ToolType::DropdownHandler,
        ToolType::FileUpload,
    ];

    #[test]
    fn names_carry_the_auto_prefix_and_sequence() {
        assert_eq!(tool_name(ToolType::SmartSelector, 7), "auto_smart_selector_7");
        assert_eq!(tool_name(ToolType::FileUpload, 1), "auto_file_upload_1");
    }

    #[test]
    fn every_class_generates_a_nonempty_program() {
        for tool_type in ALL {
            let code = code(*tool_type);
            let steps = code["steps"].as_array().expect("steps array");
            assert!(!steps.is_empty(), "{tool_type:?}");
            // Every program ends in a structured result.
            assert_eq!(steps.last().unwrap()["op"], "result", "{tool_type:?}");
        }
    }

    #[test]
    fn schema_is_object_shaped() {
        let schema = input_schema();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["error"].is_object());
    }
}
