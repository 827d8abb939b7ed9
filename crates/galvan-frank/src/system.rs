// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Host automation probing.
//!
//! At startup Frank checks `PATH` for screenshot, mouse, keyboard and
//! window-management binaries in a fixed priority order and registers one
//! dynamic tool per available capability group. A missing binary only
//! omits its tool — startup never fails over an empty desktop.

use std::path::PathBuf;

use serde_json::json;
use tracing::{debug, info};

use crate::tools::DynamicToolRegistry;

/// One capability group and its candidate binaries, best first.
pub struct SystemCapability {
    pub group: &'static str,
    pub tool_name: &'static str,
    pub description: &'static str,
    pub candidates: &'static [&'static str],
    /// Command template; `{bin}` is replaced with the found binary.
    pub command: &'static str,
    pub schema: fn() -> serde_json::Value,
}

pub const SYSTEM_CAPABILITIES: &[SystemCapability] = &[
    SystemCapability {
        group: "screenshot",
        tool_name: "system_screenshot",
        description: "Capture the desktop to a file using the host screenshot binary",
        candidates: &["gnome-screenshot", "scrot", "screencapture", "import"],
        command: "{bin} {{outfile}}",
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "outfile": {"type": "string", "description": "Path the capture is written to"}
                },
                "required": ["outfile"]
            })
        },
    },
    SystemCapability {
        group: "mouse",
        tool_name: "system_mouse_click",
        description: "Click at absolute screen coordinates",
        candidates: &["xdotool", "ydotool", "cliclick"],
        command: "{bin} mousemove {{x}} {{y}} click 1",
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "x": {"type": "integer"},
                    "y": {"type": "integer"}
                },
                "required": ["x", "y"]
            })
        },
    },
    SystemCapability {
        group: "keyboard",
        tool_name: "system_type_text",
        description: "Type text into the focused window",
        candidates: &["xdotool", "ydotool"],
        command: "{bin} type '{{text}}'",
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string"}
                },
                "required": ["text"]
            })
        },
    },
    SystemCapability {
        group: "window",
        tool_name: "system_focus_window",
        description: "Focus a window by title substring",
        candidates: &["wmctrl", "xdotool"],
        command: "{bin} -a '{{title}}'",
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string"}
                },
                "required": ["title"]
            })
        },
    },
];

/// Search `PATH` for a binary, the way a shell would.
pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// First available candidate for a capability group.
pub fn probe(capability: &SystemCapability) -> Option<PathBuf> {
    capability
        .candidates
        .iter()
        .find_map(|binary| find_in_path(binary))
}

/// Probe every group and register a dynamic tool for each hit. Returns how
/// many tools were registered.
pub async fn register_system_tools(registry: &DynamicToolRegistry) -> usize {
    let mut registered = 0;
    for capability in SYSTEM_CAPABILITIES {
        let Some(binary) = probe(capability) else {
            debug!(group = capability.group, "no host binary, tool omitted");
            continue;
        };
        let command = capability
            .command
            .replace("{bin}", &binary.display().to_string());
        let code = json!({"steps": [
            {"op": "exec", "command": command, "into": "run"},
            {"op": "result", "value": "{{run}}"}
        ]});
        match registry.create(
            capability.tool_name,
            capability.description,
            code,
            (capability.schema)(),
            "system",
        ) {
            Ok(_) => {
                info!(
                    group = capability.group,
                    binary = %binary.display(),
                    "system tool registered"
                );
                registered += 1;
            }
            Err(e) => debug!(group = capability.group, "system tool skipped: {e}"),
        }
    }
    registered
}

// ── Unit tests ────────────────────────────────────────────────────────────────
