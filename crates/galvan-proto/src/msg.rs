// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The fixed, dot-separated message-type namespace.
//!
//! Components match on these strings in their ingress loops; keeping them in
//! one module prevents the silent drift that plagues stringly-typed buses.

// ── Lifecycle & transport ─────────────────────────────────────────────────────

pub const COMPONENT_REGISTER: &str = "component.register";
pub const COMPONENT_REGISTERED: &str = "component.registered";
pub const COMPONENT_HEARTBEAT: &str = "component.heartbeat";
pub const VERSION_ANNOUNCE: &str = "version.announce";
pub const UNDELIVERABLE: &str = "undeliverable";
pub const SLOW_CONSUMER: &str = "slow_consumer";
pub const SHUTDOWN: &str = "shutdown";
pub const UNKNOWN_ACTION: &str = "unknown_action";

// ── Plan lifecycle ────────────────────────────────────────────────────────────

pub const PLAN_SUBMIT: &str = "plan.submit";
pub const PLAN_ACCEPTED: &str = "plan.accepted";
pub const PLAN_COMPLETED: &str = "plan.completed";
pub const PLAN_CANCEL: &str = "plan.cancel";
pub const PLAN_CANCELLED: &str = "plan.cancelled";

pub const STEP_STARTED: &str = "step.started";
pub const STEP_COMPLETED: &str = "step.completed";
pub const STEP_FAILED: &str = "step.failed";
pub const STEP_RETRYING: &str = "step.retrying";

// ── Igor pool ─────────────────────────────────────────────────────────────────

pub const IGOR_SPAWN: &str = "igor.spawn";
pub const IGOR_SPAWNED: &str = "igor.spawned";
pub const IGOR_EXITED: &str = "igor.exited";
pub const IGOR_THOUGHT: &str = "igor.thought";

// ── Dynamic tools ─────────────────────────────────────────────────────────────

pub const TOOL_CREATE: &str = "tool.create";
pub const TOOL_CREATED: &str = "tool.created";
pub const TOOL_UPDATE: &str = "tool.update";
pub const TOOL_UPDATED: &str = "tool.updated";
pub const TOOL_INVOKE: &str = "tool.invoke";
pub const TOOL_RESULT: &str = "tool.result";
pub const TOOL_DELETE: &str = "tool.delete";
pub const TOOL_EXPORT: &str = "tool.export";
pub const TOOL_ERROR: &str = "tool.error";

// ── Browser surface ───────────────────────────────────────────────────────────

pub const BROWSER_RESULT: &str = "browser.result";
pub const BROWSER_LAUNCH: &str = "browser.launch";
pub const BROWSER_NAVIGATE: &str = "browser.navigate";
pub const BROWSER_CLICK: &str = "browser.click";
pub const BROWSER_TYPE: &str = "browser.type";
pub const BROWSER_SELECT: &str = "browser.select";
pub const BROWSER_SCREENSHOT: &str = "browser.screenshot";
pub const BROWSER_CLOSE: &str = "browser.close";

// ── Page events ───────────────────────────────────────────────────────────────

pub const EVENT_CONSOLE: &str = "event.console";
pub const EVENT_ERROR: &str = "event.error";
