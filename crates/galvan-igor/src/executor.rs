// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The plan walker.
//!
//! Runs one plan start to finish, emitting per-step progress to the
//! Doctor. The per-step attempt loop:
//!
//! 1. Perform the action (a `browser.*` request, or a local pause for
//!    `wait`). Success → `step.completed`, next step.
//! 2. Failure → `step.failed` (every attempt's failure is reported; the
//!    Doctor's pattern tracker counts occurrences, not steps).
//! 3. If retries remain and the fault is retryable: optionally invoke one
//!    applicable Frank dynamic tool from the bag as a repair attempt, emit
//!    `step.retrying`, back off with jitter, and go again.
//! 4. Exhausted → halt the plan with `plan.completed{success:false}`.
//!
//! Cancellation is level-triggered: a watch flag checked at every await
//! point; the abort replies `plan.completed{success:false, cancelled:true}`.

use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use galvan_bus::{BusError, BusHandle};
use galvan_proto::{msg, Action, Fault, FaultKind, Plan, Step, ToolBagEntry, ToolBagKind};

use crate::steps;

const DOCTOR: &str = "doctor";
const FRANK: &str = "frank";

/// Deadline for one repair-tool invocation.
const TOOL_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How a finished run is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
    Cancelled,
}

pub struct Executor {
    pub igor_id: String,
    pub bus: BusHandle,
}

impl Executor {
    pub fn new(igor_id: String, bus: BusHandle) -> Self {
        Self { igor_id, bus }
    }

    /// Execute `plan` from `start_step`, consuming the cancel flag.
    pub async fn execute(
        &self,
        plan: &Plan,
        tool_bag: &[ToolBagEntry],
        start_step: usize,
        cancel: &mut watch::Receiver<bool>,
    ) -> Outcome {
        for (index, step) in plan.steps.iter().enumerate().skip(start_step) {
            if *cancel.borrow() {
                return Outcome::Cancelled;
            }

            self.emit(
                msg::STEP_STARTED,
                json!({
                    "planId": plan.id,
                    "stepIndex": index,
                    "action": step.action.as_str(),
                }),
            )
            .await;

            match self.run_step(plan.id, index, step, tool_bag, cancel).await {
                StepOutcome::Completed => {}
                StepOutcome::Cancelled => return Outcome::Cancelled,
                StepOutcome::Exhausted => return Outcome::Failed,
            }
        }
        Outcome::Success
    }

    async fn run_step(
        &self,
        plan_id: Uuid,
        index: usize,
        step: &Step,
        tool_bag: &[ToolBagEntry],
        cancel: &mut watch::Receiver<bool>,
    ) -> StepOutcome {
        let budget = step.retry_budget();
        let mut attempt: u32 = 0;

        loop {
            let started = Instant::now();
            let result = self.perform(step, cancel).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Perform::Cancelled => return StepOutcome::Cancelled,
                Perform::Ok(result) => {
                    self.emit(
                        msg::STEP_COMPLETED,
                        json!({
                            "planId": plan_id,
                            "stepIndex": index,
                            "action": step.action.as_str(),
                            "result": result,
                            "durationMs": duration_ms,
                        }),
                    )
                    .await;
                    return StepOutcome::Completed;
                }
                Perform::Err(fault) => {
                    warn!(
                        %plan_id, step = index, attempt,
                        action = step.action.as_str(),
                        "step failed: {fault}"
                    );
                    self.emit(
                        msg::STEP_FAILED,
                        json!({
                            "planId": plan_id,
                            "stepIndex": index,
                            "action": step.action.as_str(),
                            "selector": step.param_str("selector"),
                            "error": fault,
                            "attempt": attempt,
                        }),
                    )
                    .await;

                    let retries_left = budget.saturating_sub(attempt);
                    if retries_left == 0 || !fault.retryable() {
                        return StepOutcome::Exhausted;
                    }

                    // One repair attempt per failure, drawn from the bag.
                    let repair = applicable_tool(tool_bag, &fault);
                    let frank_tool_used = match &repair {
                        Some(entry) => {
                            self.attempt_repair(plan_id, index, step, entry, &fault).await;
                            Some(entry.name.clone())
                        }
                        None => None,
                    };

                    let backoff_ms =
                        steps::backoff_ms(attempt, rand::thread_rng().gen_range(-1.0..=1.0));
                    self.emit(
                        msg::STEP_RETRYING,
                        json!({
                            "planId": plan_id,
                            "stepIndex": index,
                            "attemptNumber": attempt + 1,
                            "backoffMs": backoff_ms,
                            "retriesLeft": retries_left - 1,
                            "frankToolUsed": frank_tool_used,
                        }),
                    )
                    .await;

                    if sleep_cancellable(Duration::from_millis(backoff_ms), cancel).await {
                        return StepOutcome::Cancelled;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// One attempt at one step.
    async fn perform(&self, step: &Step, cancel: &mut watch::Receiver<bool>) -> Perform {
        if step.action == Action::Wait {
            let ms = steps::wait_duration_ms(step);
            if sleep_cancellable(Duration::from_millis(ms), cancel).await {
                return Perform::Cancelled;
            }
            return Perform::Ok(json!({"waitedMs": ms}));
        }

        let Some((kind, payload)) = steps::browser_command(step) else {
            return Perform::Ok(Value::Null);
        };
        let timeout = step
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(step.action.default_timeout_ms()));

        let request = galvan_proto::Envelope::new(self.igor_id.clone(), FRANK, kind, payload);
        let reply = tokio::select! {
            reply = self.bus.request(request, timeout) => reply,
            _ = wait_for_cancel(cancel) => return Perform::Cancelled,
        };

        match reply {
            Ok(reply) => {
                if reply.payload["ok"].as_bool().unwrap_or(false) {
                    let mut result = reply.payload["result"].clone();
                    // Verify steps wrap the screenshot with the expectation
                    // so the Doctor can archive the pair.
                    if step.action == Action::Verify {
                        result = json!({
                            "expected": step.param_str("expected"),
                            "screenshot": result["image"],
                            "captureScreenshot": step.params.get("captureScreenshot"),
                        });
                    }
                    Perform::Ok(result)
                } else {
                    let fault = serde_json::from_value(reply.payload["error"].clone())
                        .unwrap_or_else(|_| {
                            Fault::unexpected(format!("malformed error reply: {}", reply.payload))
                        });
                    Perform::Err(fault)
                }
            }
            Err(BusError::Timeout(t)) => Perform::Err(
                Fault::new(FaultKind::BrowserTimeout, format!("no reply within {t:?}"))
                    .with("command", kind),
            ),
            Err(e) => Perform::Err(Fault::unexpected(format!("bus error: {e}"))),
        }
    }

    /// Invoke one dynamic tool against the failure, then tell the Doctor
    /// what we were thinking. The result only matters as a side effect on
    /// the page; the retry that follows is the real test.
    async fn attempt_repair(
        &self,
        plan_id: Uuid,
        index: usize,
        step: &Step,
        entry: &ToolBagEntry,
        fault: &Fault,
    ) {
        info!(%plan_id, step = index, tool = %entry.name, "attempting tool repair");

        let params = json!({
            "selector": step.param_str("selector"),
            "text": step.param_str("text"),
            "error": fault.stable_string(),
        });
        let request = galvan_proto::Envelope::new(
            self.igor_id.clone(),
            FRANK,
            msg::TOOL_INVOKE,
            json!({
                "toolId": entry.tool_id.clone().unwrap_or_else(|| entry.name.clone()),
                "params": params,
                "timeoutMs": TOOL_INVOKE_TIMEOUT.as_millis() as u64,
            }),
        );
        match self.bus.request(request, TOOL_INVOKE_TIMEOUT).await {
            Ok(reply) if reply.payload["ok"].as_bool().unwrap_or(false) => {
                debug!(tool = %entry.name, "repair tool succeeded");
            }
            Ok(reply) => {
                debug!(tool = %entry.name, "repair tool failed: {}", reply.payload["error"]);
            }
            Err(e) => debug!(tool = %entry.name, "repair tool unreachable: {e}"),
        }

        self.emit(
            msg::IGOR_THOUGHT,
            json!({
                "planId": plan_id,
                "prompt": format!("step {index} failed: {}", fault.stable_string()),
                "thought": format!("trying {} before the next attempt", entry.name),
                "context": {
                    "action": step.action.as_str(),
                    "error": fault.stable_string(),
                },
            }),
        )
        .await;
    }

    async fn emit(&self, kind: &str, payload: Value) {
        let env = galvan_proto::Envelope::new(self.igor_id.clone(), DOCTOR, kind, payload);
        if let Err(e) = self.bus.send(env).await {
            warn!("progress event lost: {e}");
        }
    }
}

enum Perform {
    Ok(Value),
    Err(Fault),
    Cancelled,
}

enum StepOutcome {
    Completed,
    Exhausted,
    Cancelled,
}

/// Pick the first dynamic tool in the bag whose name suggests it addresses
/// the fault's error class. The bag is the boundary: a tool not in it is
/// never called, whatever the error says.
pub fn applicable_tool<'bag>(bag: &'bag [ToolBagEntry], fault: &Fault) -> Option<&'bag ToolBagEntry> {
    let text = fault.stable_string().to_ascii_lowercase();
    let hint = if text.contains("not found") || text.contains("no such element") {
        "smart_selector"
    } else if text.contains("timeout") || text.contains("timed out") {
        "wait_helper"
    } else if text.contains("network") || text.contains("fetch") || text.contains("connection") {
        "network_helper"
    } else if text.contains("not visible") || text.contains("hidden") {
        "visibility_helper"
    } else if text.contains("iframe") || text.contains("frame") {
        "frame_handler"
    } else if text.contains("popup") || text.contains("dialog") || text.contains("modal") {
        "popup_handler"
    } else {
        return None;
    };

    bag.iter()
        .find(|entry| entry.kind == ToolBagKind::Dynamic && entry.name.contains(hint))
}

/// Sleep, returning `true` if cancellation arrived first.
async fn sleep_cancellable(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = wait_for_cancel(cancel) => true,
    }
}

async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone: treat as never-cancelled and park forever; the
            // other select branch decides.
            std::future::pending::<()>().await;
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn bag() -> Vec<ToolBagEntry> {
        vec![
            ToolBagEntry {
                name: "navigation".into(),
                description: "static nav helper".into(),
                kind: ToolBagKind::Static,
                tool_id: None,
            },
            ToolBagEntry {
                name: "auto_smart_selector_1".into(),
                description: "fuzzy selector".into(),
                kind: ToolBagKind::Dynamic,
                tool_id: Some("tool-1".into()),
            },
            ToolBagEntry {
                name: "auto_wait_helper_2".into(),
                description: "wait longer".into(),
                kind: ToolBagKind::Dynamic,
                tool_id: Some("tool-2".into()),
            },
        ]
    }

    fn fault(kind: FaultKind, message: &str) -> Fault {
        Fault::new(kind, message)
    }

    #[test]
    fn element_errors_pick_the_selector_tool() {
        let bag = bag();
        let found = applicable_tool(&bag, &fault(FaultKind::ElementNotFound, "element not found: '#x'"));
        assert_eq!(found.unwrap().name, "auto_smart_selector_1");
    }

    #[test]
    fn timeout_errors_pick_the_wait_tool() {
        let bag = bag();
        let found = applicable_tool(&bag, &fault(FaultKind::BrowserTimeout, "navigate timed out after 30s"));
        assert_eq!(found.unwrap().name, "auto_wait_helper_2");
    }

    #[test]
    fn static_tools_are_never_invoked_as_repairs() {
        let only_static = vec![ToolBagEntry {
            name: "smart_selector_static".into(),
            description: String::new(),
            kind: ToolBagKind::Static,
            tool_id: None,
        }];
        assert!(applicable_tool(&only_static, &fault(FaultKind::ElementNotFound, "not found")).is_none());
    }

    #[test]
    fn unclassified_errors_get_no_tool() {
        let bag = bag();
        assert!(applicable_tool(&bag, &fault(FaultKind::NavigationFailed, "dns exploded")).is_none());
    }

    #[tokio::test]
    async fn cancellable_sleep_aborts_on_flag() {
        let (tx, mut rx) = watch::channel(false);
        let sleeper = tokio::spawn(async move {
            sleep_cancellable(Duration::from_secs(30), &mut rx).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(1), sleeper)
            .await
            .unwrap()
            .unwrap());
    }
}
