// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Igor's bus dispatcher: plan admission, queueing, cancellation.
//!
//! Execution is strictly one plan at a time. Submissions that arrive while
//! a plan is executing are queued (bounded) and started in arrival order;
//! `plan.accepted` is emitted when execution actually begins, which is
//! what the Doctor keys its busy-tracking on. A route-bound Igor refuses
//! plans for other routes outright.
//!
//! `plan.cancel` is idempotent: cancelling a running plan aborts it at the
//! next await point, cancelling a queued plan removes it, and cancelling
//! an unknown or already-terminal plan succeeds without side effects.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use galvan_bus::BusHandle;
use galvan_proto::{msg, Envelope, Fault, FaultKind, Plan, ToolBagEntry};

use crate::executor::{Executor, Outcome};

/// Submissions parked behind the executing plan.
const QUEUE_DEPTH: usize = 32;

struct QueuedPlan {
    envelope: Envelope,
    plan: Plan,
    tool_bag: Vec<ToolBagEntry>,
    start_step: usize,
}

struct RunningPlan {
    plan_id: Uuid,
    cancel_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct Inner {
    current: Option<RunningPlan>,
    queue: VecDeque<QueuedPlan>,
}

pub struct IgorService {
    pub id: String,
    pub route: Option<String>,
    bus: BusHandle,
    inner: Mutex<Inner>,
}

impl IgorService {
    pub fn new(id: String, route: Option<String>, bus: BusHandle) -> Self {
        Self {
            id,
            route,
            bus,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub async fn handle(self: std::sync::Arc<Self>, env: Envelope) {
        // The arms move `env` into their handlers, so the discriminant
        // cannot borrow from it.
        let kind = env.kind.clone();
        match kind.as_str() {
            msg::PLAN_SUBMIT => self.handle_submit(env).await,
            msg::PLAN_CANCEL => self.handle_cancel(env).await,
            // Broadcasts, transport noise, and late correlated replies
            // (browser.result / tool.result whose request already timed
            // out). Never answer unknown_action with unknown_action.
            msg::COMPONENT_REGISTERED
            | msg::VERSION_ANNOUNCE
            | msg::EVENT_CONSOLE
            | msg::EVENT_ERROR
            | msg::UNDELIVERABLE
            | msg::SLOW_CONSUMER
            | msg::BROWSER_RESULT
            | msg::TOOL_RESULT
            | msg::IGOR_SPAWN
            | msg::UNKNOWN_ACTION => {}
            other => {
                warn!(kind = %other, "unknown action");
                let fault = Fault::new(FaultKind::UnknownAction, format!("no handler for {other}"));
                let _ = self
                    .bus
                    .reply(&env, msg::UNKNOWN_ACTION, json!({"error": fault}))
                    .await;
            }
        }
    }

    async fn handle_submit(self: std::sync::Arc<Self>, env: Envelope) {
        let plan: Plan = match serde_json::from_value(env.payload["plan"].clone()) {
            Ok(plan) => plan,
            Err(e) => {
                let fault = Fault::validation(format!("malformed plan: {e}"));
                let _ = self
                    .bus
                    .reply(&env, msg::PLAN_COMPLETED, json!({"success": false, "error": fault}))
                    .await;
                return;
            }
        };
        let tool_bag: Vec<ToolBagEntry> =
            serde_json::from_value(env.payload["toolBag"].clone()).unwrap_or_default();
        let start_step = env.payload["startStep"].as_u64().unwrap_or(0) as usize;

        // Route binding: a specialized worker only runs its own route.
        if let Some(route) = &self.route {
            let plan_route = plan.route.as_ref().map(|r| r.id.as_str());
            if plan_route != Some(route.as_str()) {
                let fault = Fault::validation(format!(
                    "route mismatch: this worker is bound to {route}"
                ));
                let _ = self
                    .bus
                    .reply(
                        &env,
                        msg::PLAN_COMPLETED,
                        json!({"planId": plan.id, "success": false, "error": fault}),
                    )
                    .await;
                return;
            }
        }

        let queued = QueuedPlan {
            envelope: env,
            plan,
            tool_bag,
            start_step,
        };

        let start_now = {
            let mut inner = self.inner.lock().expect("igor state poisoned");
            if inner.current.is_some() {
                if inner.queue.len() >= QUEUE_DEPTH {
                    None
                } else {
                    info!(
                        id = %self.id, plan = %queued.plan.id, depth = inner.queue.len() + 1,
                        "plan queued behind executing plan"
                    );
                    inner.queue.push_back(queued);
                    return;
                }
            } else {
                Some(())
            }
        };

        match start_now {
            Some(()) => self.clone().start(queued).await,
            None => {
                let fault = Fault::new(FaultKind::Overload, "submission queue full");
                let _ = self
                    .bus
                    .reply(
                        &queued.envelope,
                        msg::PLAN_COMPLETED,
                        json!({"planId": queued.plan.id, "success": false, "error": fault}),
                    )
                    .await;
            }
        }
    }

    /// Begin executing one plan, then drain the queue.
    async fn start(self: std::sync::Arc<Self>, queued: QueuedPlan) {
        let mut next = Some(queued);
        while let Some(queued) = next.take() {
            let (cancel_tx, mut cancel_rx) = watch::channel(false);
            {
                let mut inner = self.inner.lock().expect("igor state poisoned");
                inner.current = Some(RunningPlan {
                    plan_id: queued.plan.id,
                    cancel_tx,
                });
            }

            let _ = self
                .bus
                .reply(&queued.envelope, msg::PLAN_ACCEPTED, json!({"planId": queued.plan.id}))
                .await;
            info!(
                id = %self.id, plan = %queued.plan.id,
                steps = queued.plan.steps.len(), start_step = queued.start_step,
                "plan accepted"
            );

            let executor = Executor::new(self.id.clone(), self.bus.clone());
            let outcome = executor
                .execute(&queued.plan, &queued.tool_bag, queued.start_step, &mut cancel_rx)
                .await;

            let payload = match outcome {
                Outcome::Success => json!({"planId": queued.plan.id, "success": true}),
                Outcome::Failed => json!({"planId": queued.plan.id, "success": false}),
                Outcome::Cancelled => {
                    json!({"planId": queued.plan.id, "success": false, "cancelled": true})
                }
            };
            info!(id = %self.id, plan = %queued.plan.id, ?outcome, "plan finished");
            let _ = self
                .bus
                .reply(&queued.envelope, msg::PLAN_COMPLETED, payload)
                .await;

            next = {
                let mut inner = self.inner.lock().expect("igor state poisoned");
                inner.current = None;
                inner.queue.pop_front()
            };
        }
    }

    async fn handle_cancel(&self, env: Envelope) {
        let plan_id = env.payload["planId"].as_str().unwrap_or_default().to_string();

        enum Hit {
            Running,
            Queued(QueuedPlan),
            None,
        }
        let hit = {
            let mut inner = self.inner.lock().expect("igor state poisoned");
            if inner
                .current
                .as_ref()
                .map(|current| current.plan_id.to_string() == plan_id)
                .unwrap_or(false)
            {
                if let Some(current) = inner.current.as_ref() {
                    let _ = current.cancel_tx.send(true);
                }
                Hit::Running
            } else if let Some(index) = inner
                .queue
                .iter()
                .position(|queued| queued.plan.id.to_string() == plan_id)
            {
                Hit::Queued(inner.queue.remove(index).expect("index just found"))
            } else {
                Hit::None
            }
        };

        let was_running = match hit {
            Hit::Running => {
                info!(%plan_id, "cancelling executing plan");
                true
            }
            Hit::Queued(queued) => {
                info!(%plan_id, "cancelled queued plan");
                // The Doctor still needs a terminal message for it.
                let _ = self
                    .bus
                    .reply(
                        &queued.envelope,
                        msg::PLAN_COMPLETED,
                        json!({"planId": queued.plan.id, "success": false, "cancelled": true}),
                    )
                    .await;
                false
            }
            Hit::None => false,
        };

        // Idempotent: cancelling a terminal/unknown plan is a no-op success.
        let _ = self
            .bus
            .reply(
                &env,
                msg::PLAN_CANCELLED,
                json!({"ok": true, "wasRunning": was_running}),
            )
            .await;
    }
}
