// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The Doctor's bus dispatcher: progress events in, decisions out.
//!
//! Most handlers are thin translations onto [`DoctorState`]; the
//! interesting path is `step.failed` → failure tracker → `tool.create` →
//! `tool.created` → frank restart → failed-plan resubmission, which is the
//! one place a plan legally leaves a terminal state.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use galvan_bus::BusHandle;
use galvan_proto::{msg, Envelope, Fault, PlanStatus};

use crate::failure::ToolCreateSpec;
use crate::restart::RestartCoordinator;
use crate::scheduler::DoctorState;

const FRANK: &str = "frank";

pub struct DoctorService {
    pub state: Arc<DoctorState>,
    pub bus: BusHandle,
    pub restart: Arc<RestartCoordinator>,
}

impl DoctorService {
    pub fn new(state: Arc<DoctorState>, bus: BusHandle) -> Self {
        Self {
            state,
            bus,
            restart: Arc::new(RestartCoordinator::new()),
        }
    }

    pub async fn handle(self: Arc<Self>, env: Envelope) {
        // The arms move `env` into their handlers, so the discriminant
        // cannot borrow from it.
        let kind = env.kind.clone();
        match kind.as_str() {
            msg::PLAN_ACCEPTED => {
                if let Some(plan_id) = payload_uuid(&env, "planId") {
                    self.state.on_plan_accepted(plan_id);
                }
            }
            msg::PLAN_COMPLETED => self.handle_plan_completed(env),
            msg::STEP_STARTED => {
                debug!(
                    plan = %env.payload["planId"], step = %env.payload["stepIndex"],
                    action = %env.payload["action"], "step started"
                );
            }
            msg::STEP_COMPLETED => {
                if let (Some(plan_id), Some(index)) = (
                    payload_uuid(&env, "planId"),
                    env.payload["stepIndex"].as_u64(),
                ) {
                    self.state
                        .on_step_completed(plan_id, index as usize, env.payload["result"].clone());
                }
            }
            msg::STEP_FAILED => self.handle_step_failed(env).await,
            msg::STEP_RETRYING => {
                debug!(
                    plan = %env.payload["planId"],
                    attempt = %env.payload["attemptNumber"],
                    tool = %env.payload["frankToolUsed"],
                    "step retrying"
                );
            }
            msg::IGOR_THOUGHT => {
                self.state.record_thought(
                    payload_uuid(&env, "planId"),
                    env.payload["thought"].as_str().unwrap_or_default().to_string(),
                    env.payload["context"].clone(),
                );
            }
            msg::IGOR_SPAWNED => {
                if let Some(id) = env.payload["id"].as_str() {
                    let route = env.payload["route"].as_str().map(String::from);
                    self.state.igor_seen(id, route);
                }
            }
            msg::IGOR_EXITED => {
                let id = env.payload["id"].as_str().unwrap_or(&env.source).to_string();
                let exit_code = env.payload["exitCode"].as_i64().unwrap_or(-1);
                self.state.on_igor_exited(&id, exit_code);
            }
            msg::VERSION_ANNOUNCE => {
                // Igor liveness rides on bridge announcements.
                if let Some(component) = env.payload["component"].as_str() {
                    if let Some(route) = component.strip_prefix("igor-") {
                        self.state.igor_seen(component, Some(route.to_string()));
                    } else if component == "igor" {
                        self.state.igor_seen(component, None);
                    }
                }
            }
            msg::TOOL_CREATED => self.handle_tool_created(env).await,
            msg::TOOL_ERROR => {
                if let Some(correlation_id) = env.correlation_id {
                    self.state.failures.on_tool_error(correlation_id);
                }
            }
            msg::UNDELIVERABLE => self.handle_undeliverable(env).await,
            msg::COMPONENT_REGISTERED | msg::SLOW_CONSUMER | msg::EVENT_CONSOLE
            | msg::EVENT_ERROR | msg::TOOL_RESULT | msg::PLAN_CANCELLED | msg::TOOL_UPDATED
            | msg::BROWSER_RESULT | msg::UNKNOWN_ACTION | msg::IGOR_SPAWN => {}
            other => {
                warn!(kind = %other, from = %env.source, "unknown action");
            }
        }
    }

    fn handle_plan_completed(&self, env: Envelope) {
        let Some(plan_id) = payload_uuid(&env, "planId") else {
            warn!("plan.completed without planId");
            return;
        };
        let success = env.payload["success"].as_bool().unwrap_or(false);
        let cancelled = env.payload["cancelled"].as_bool().unwrap_or(false);
        info!(%plan_id, success, cancelled, from = %env.source, "plan completed");
        self.state.on_plan_completed(&env.source, plan_id, success);
    }

    /// The failure → tool-creation pipeline.
    async fn handle_step_failed(&self, env: Envelope) {
        let Some(plan_id) = payload_uuid(&env, "planId") else { return };
        let step_index = env.payload["stepIndex"].as_u64().unwrap_or(0) as usize;
        let action = env.payload["action"].as_str().unwrap_or("unknown").to_string();
        let selector = env.payload["selector"].as_str().map(String::from);
        let fault: Fault = match serde_json::from_value(env.payload["error"].clone()) {
            Ok(fault) => fault,
            Err(_) => Fault::unexpected(env.payload["error"].to_string()),
        };

        self.state
            .record_step_failure(plan_id, step_index, fault.clone());

        let spec = self.state.failures.on_step_failed(
            plan_id,
            step_index,
            &action,
            selector.as_deref(),
            &fault,
        );
        if let Some(spec) = spec {
            self.send_tool_create(spec).await;
        }
    }

    async fn send_tool_create(&self, spec: ToolCreateSpec) {
        let envelope = Envelope::new(
            self.bus.component_id().to_string(),
            FRANK,
            msg::TOOL_CREATE,
            json!({
                "name": spec.tool_name,
                "description": spec.description,
                "code": spec.code,
                "inputSchema": spec.input_schema,
                "author": "doctor",
            }),
        );
        self.state.failures.record_pending(envelope.id, &spec);
        info!(tool = %spec.tool_name, "tool.create sent");
        if let Err(e) = self.bus.send(envelope).await {
            warn!("tool.create lost: {e}");
        }
    }

    /// `tool.created`: latency bookkeeping, broadcast, restart, retry.
    async fn handle_tool_created(self: Arc<Self>, env: Envelope) {
        let Some(correlation_id) = env.correlation_id else {
            debug!("tool.created without correlation id ignored");
            return;
        };
        let name = env.payload["name"].as_str().unwrap_or_default().to_string();
        let Some(request) = self.state.failures.on_tool_created(correlation_id, &name) else {
            // Late reply to a purged request: discard.
            return;
        };

        // Informational broadcast for dashboards and peers.
        let notice = Envelope::new(
            self.bus.component_id().to_string(),
            galvan_proto::BROADCAST,
            msg::EVENT_CONSOLE,
            json!({
                "notice": "tool.created",
                "tool": name,
                "pattern": request.pattern_key,
            }),
        );
        let _ = self.bus.send(notice).await;

        // Restart frank so the new tool is live, then retry the plan that
        // earned it — in the background, the ingress loop must not stall.
        let service = self.clone();
        tokio::spawn(async move {
            let reason = format!("activating {name}");
            match service
                .restart
                .restart(&service.state.config, &service.bus, &reason)
                .await
            {
                Ok(tools) => {
                    *service
                        .state
                        .dynamic_tools
                        .lock()
                        .expect("tool cache poisoned") = tools;
                    service.retry_plan(request.plan_id).await;
                }
                Err(e) => {
                    warn!("frank restart failed: {e}");
                }
            }
        });
    }

    /// Resubmit a failed plan after its causally-linked tool arrived.
    async fn retry_plan(&self, plan_id: Uuid) {
        let is_failed = {
            let plans = self.state.plans.lock().expect("plan table poisoned");
            plans
                .get(&plan_id)
                .map(|state| state.status == PlanStatus::Failed)
                .unwrap_or(false)
        };
        if !is_failed {
            debug!(%plan_id, "tool arrived but plan is not failed; no retry");
            return;
        }

        match self.state.resubmit_after_tool(plan_id) {
            Ok(submission) => {
                info!(%plan_id, igor = %submission.igor_id, "retrying plan after tool creation");
                if let Err(e) = self.bus.send(submission.envelope).await {
                    warn!("retry submission lost: {e}");
                }
            }
            Err(e) => warn!(%plan_id, "retry refused: {e}"),
        }
    }

    /// A plan.submit we sent bounced; queue the plan on the default Igor.
    async fn handle_undeliverable(&self, env: Envelope) {
        let Some(original_id) = payload_uuid(&env, "originalId") else { return };
        if env.payload["originalType"] != msg::PLAN_SUBMIT {
            debug!(
                reason = %env.payload["reason"],
                kind = %env.payload["originalType"],
                "undeliverable (no reassignment)"
            );
            return;
        }
        if let Some(submission) = self.state.reassign_to_default(original_id) {
            if let Err(e) = self.bus.send(submission.envelope).await {
                warn!("reassigned submission lost: {e}");
            }
        }
    }
}

fn payload_uuid(env: &Envelope, key: &str) -> Option<Uuid> {
    env.payload[key].as_str().and_then(|raw| raw.parse().ok())
}
