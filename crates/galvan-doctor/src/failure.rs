// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The failure-pattern tracker and the tool-creation trigger.
//!
//! Every `step.failed` event flows through [`FailureTracker::on_step_failed`]:
//! the error is rendered to a stable string, normalized into a pattern key,
//! counted, and classified against a fixed regex → tool-type table. Once a
//! pattern crosses the threshold (default 2) with no tool yet requested and
//! a recognized class, the tracker hands back a [`ToolCreateSpec`] for the
//! service to turn into a `tool.create` message.
//!
//! Bookkeeping invariants: `tool_created` implies
//! `tool_requested`; one pending request per issued `tool.create`;
//! `tool.error` clears `tool_requested` so the pattern may try again.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use regex::Regex;
use tracing::{info, warn};
use uuid::Uuid;

use galvan_proto::{normalize_failure_key, Fault, FailurePattern, PendingToolRequest};

use crate::toolgen::{self, ToolType};

/// Rolling window of tool-creation latencies.
const LATENCY_WINDOW: usize = 100;

/// Everything the service needs to issue one `tool.create`.
#[derive(Debug, Clone)]
pub struct ToolCreateSpec {
    pub tool_name: String,
    pub tool_type: ToolType,
    pub description: String,
    pub code: serde_json::Value,
    pub input_schema: serde_json::Value,
    pub pattern_key: String,
    pub plan_id: Uuid,
    pub step_index: usize,
}

/// Counters surfaced on `GET /frank`.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolLoopMetrics {
    pub tools_requested: u64,
    pub tools_created: u64,
    pub tool_errors: u64,
    pub mean_latency_ms: Option<f64>,
    pub pending: usize,
}

pub struct FailureTracker {
    patterns: Mutex<HashMap<String, FailurePattern>>,
    pending: Mutex<HashMap<Uuid, PendingToolRequest>>,
    latencies: Mutex<VecDeque<u64>>,
    classifier: Vec<(Regex, ToolType)>,
    sequence: AtomicU64,
    tools_requested: AtomicU64,
    tools_created: AtomicU64,
    tool_errors: AtomicU64,
    enabled: bool,
    threshold: u64,
}

impl FailureTracker {
    pub fn new(enabled: bool, threshold: u64) -> Self {
        let re = |pattern: &str| Regex::new(pattern).expect("classifier pattern");
        Self {
            patterns: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            classifier: vec![
                (re(r"(?i)element not found|no such element|could not find"), ToolType::SmartSelector),
                (re(r"(?i)timed? ?out|waiting for"), ToolType::WaitHelper),
                (re(r"(?i)net::|network|connection refused|fetch failed|dns"), ToolType::NetworkHelper),
                (re(r"(?i)not visible|hidden|zero.size|obscured"), ToolType::VisibilityHelper),
                (re(r"(?i)iframe|frame detached|cross.frame"), ToolType::FrameHandler),
                (re(r"(?i)popup|modal|dialog|overlay"), ToolType::PopupHandler),
                (re(r"(?i)captcha|recaptcha|hcaptcha"), ToolType::CaptchaHandler),
                (re(r"(?i)date.?picker|calendar widget"), ToolType::DatePicker),
                (re(r"(?i)dropdown|option not|select option"), ToolType::DropdownHandler),
                (re(r"(?i)file upload|type=.?file|filechooser"), ToolType::FileUpload),
            ],
            sequence: AtomicU64::new(1),
            tools_requested: AtomicU64::new(0),
            tools_created: AtomicU64::new(0),
            tool_errors: AtomicU64::new(0),
            enabled,
            threshold,
        }
    }

    /// Classify an error string into a repair-tool class.
    pub fn classify(&self, error: &str) -> Option<ToolType> {
        self.classifier
            .iter()
            .find(|(pattern, _)| pattern.is_match(error))
            .map(|(_, tool_type)| *tool_type)
    }

    /// Record one step failure. Returns a creation spec when this failure
    /// tips a pattern over the threshold.
    pub fn on_step_failed(
        &self,
        plan_id: Uuid,
        step_index: usize,
        action: &str,
        selector: Option<&str>,
        fault: &Fault,
    ) -> Option<ToolCreateSpec> {
        let error = fault.stable_string();
        let key = normalize_failure_key(action, selector, &error);

        let should_request = {
            let mut patterns = self.patterns.lock().expect("patterns poisoned");
            let pattern = patterns
                .entry(key.clone())
                .or_insert_with(|| FailurePattern::new(key.clone()));
            pattern.record(plan_id);
            self.enabled && !pattern.tool_requested && pattern.count >= self.threshold
        };
        if !should_request {
            return None;
        }

        let tool_type = match self.classify(&error) {
            Some(tool_type) => tool_type,
            None => return None,
        };

        // Mark before the message leaves so a racing second failure cannot
        // double-request.
        {
            let mut patterns = self.patterns.lock().expect("patterns poisoned");
            if let Some(pattern) = patterns.get_mut(&key) {
                if pattern.tool_requested {
                    return None;
                }
                pattern.tool_requested = true;
            }
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let tool_name = toolgen::tool_name(tool_type, sequence);
        self.tools_requested.fetch_add(1, Ordering::Relaxed);
        info!(%tool_name, pattern = %key, "failure pattern crossed threshold, requesting tool");

        Some(ToolCreateSpec {
            tool_name,
            tool_type,
            description: toolgen::description(tool_type),
            code: toolgen::code(tool_type),
            input_schema: toolgen::input_schema(),
            pattern_key: key,
            plan_id,
            step_index,
        })
    }

    /// Register the outstanding request once the `tool.create` envelope is
    /// actually on the wire.
    pub fn record_pending(&self, request_id: Uuid, spec: &ToolCreateSpec) {
        self.pending.lock().expect("pending poisoned").insert(
            request_id,
            PendingToolRequest {
                request_id,
                plan_id: spec.plan_id,
                step_index: spec.step_index,
                pattern_key: spec.pattern_key.clone(),
                tool_name: spec.tool_name.clone(),
                created_at: Utc::now(),
            },
        );
    }

    /// Match a `tool.created` reply to its pending request. Returns the
    /// resolved request so the caller can retry the originating plan.
    pub fn on_tool_created(&self, correlation_id: Uuid, name: &str) -> Option<PendingToolRequest> {
        let request = self
            .pending
            .lock()
            .expect("pending poisoned")
            .remove(&correlation_id)?;

        let latency = (Utc::now() - request.created_at).num_milliseconds().max(0) as u64;
        {
            let mut latencies = self.latencies.lock().expect("latencies poisoned");
            if latencies.len() == LATENCY_WINDOW {
                latencies.pop_front();
            }
            latencies.push_back(latency);
        }

        {
            let mut patterns = self.patterns.lock().expect("patterns poisoned");
            if let Some(pattern) = patterns.get_mut(&request.pattern_key) {
                pattern.tool_created = Some(name.to_string());
            }
        }
        self.tools_created.fetch_add(1, Ordering::Relaxed);
        info!(tool = %name, latency_ms = latency, "tool created");
        Some(request)
    }

    /// A `tool.error` reply: drop the pending request and re-open the
    /// pattern for a later attempt.
    pub fn on_tool_error(&self, correlation_id: Uuid) -> Option<PendingToolRequest> {
        let request = self
            .pending
            .lock()
            .expect("pending poisoned")
            .remove(&correlation_id)?;
        {
            let mut patterns = self.patterns.lock().expect("patterns poisoned");
            if let Some(pattern) = patterns.get_mut(&request.pattern_key) {
                pattern.tool_requested = false;
            }
        }
        self.tool_errors.fetch_add(1, Ordering::Relaxed);
        warn!(tool = %request.tool_name, "tool creation failed");
        Some(request)
    }

    pub fn patterns_snapshot(&self) -> Vec<FailurePattern> {
        let mut patterns: Vec<FailurePattern> = self
            .patterns
            .lock()
            .expect("patterns poisoned")
            .values()
            .cloned()
            .collect();
        patterns.sort_by(|a, b| b.count.cmp(&a.count));
        patterns
    }

    pub fn pending_snapshot(&self) -> Vec<PendingToolRequest> {
        self.pending
            .lock()
            .expect("pending poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn metrics(&self) -> ToolLoopMetrics {
        let latencies = self.latencies.lock().expect("latencies poisoned");
        let mean = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<u64>() as f64 / latencies.len() as f64)
        };
        ToolLoopMetrics {
            tools_requested: self.tools_requested.load(Ordering::Relaxed),
            tools_created: self.tools_created.load(Ordering::Relaxed),
            tool_errors: self.tool_errors.load(Ordering::Relaxed),
            mean_latency_ms: mean,
            pending: self.pending.lock().expect("pending poisoned").len(),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
