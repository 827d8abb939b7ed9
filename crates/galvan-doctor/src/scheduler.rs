// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The Igor scheduler and the Doctor's plan/branch/worker state.
//!
//! State is split into one mutex per collection (plans, branches, igors);
//! every operation under a lock is short and never awaits, so one lock per
//! collection is enough. The scheduler decides,
//! the service transmits: admission returns a [`Submission`] describing
//! the `plan.submit` to send rather than touching the bus itself, which is
//! what keeps all of this testable without a cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use galvan_config::DoctorConfig;
use galvan_proto::{
    msg, BranchStatus, BranchingPlan, Envelope, Fault, FaultKind, IgorInstance, IgorStatus, Plan,
    PlanState, PlanStatus, RouteResult, ToolRecord, DEFAULT_IGOR_ID,
};

use crate::failure::FailureTracker;
use crate::toolbag;

/// A decided plan assignment, ready to put on the bus.
#[derive(Debug)]
pub struct Submission {
    pub igor_id: String,
    pub envelope: Envelope,
}

/// A remembered `igor.thought`, surfaced as a remediation hint.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThoughtRecord {
    pub plan_id: Option<Uuid>,
    pub thought: String,
    pub context: serde_json::Value,
    pub at: chrono::DateTime<chrono::Utc>,
}

pub struct DoctorState {
    pub config: DoctorConfig,
    pub plans: Mutex<HashMap<Uuid, PlanState>>,
    pub branches: Mutex<HashMap<Uuid, BranchingPlan>>,
    pub igors: Mutex<HashMap<String, IgorInstance>>,
    /// Frank's dynamic tool inventory, refreshed on sync and restart.
    pub dynamic_tools: Mutex<Vec<ToolRecord>>,
    /// submit-envelope id → plan id, for undeliverable reassignment.
    pub outstanding_submits: Mutex<HashMap<Uuid, Uuid>>,
    pub failures: FailureTracker,
    pub thoughts: Mutex<Vec<ThoughtRecord>>,
    pub started_at: Instant,
    rr_cursor: AtomicUsize,
}

const COMPONENT: &str = "doctor";

/// Kept remediation hints.
const THOUGHT_CAP: usize = 100;

impl DoctorState {
    pub fn new(config: DoctorConfig) -> Self {
        let failures = FailureTracker::new(
            config.tool_creation_enabled,
            config.failure_threshold_for_tool,
        );
        let state = Self {
            config,
            plans: Mutex::new(HashMap::new()),
            branches: Mutex::new(HashMap::new()),
            igors: Mutex::new(HashMap::new()),
            dynamic_tools: Mutex::new(Vec::new()),
            outstanding_submits: Mutex::new(HashMap::new()),
            failures,
            thoughts: Mutex::new(Vec::new()),
            started_at: Instant::now(),
            rr_cursor: AtomicUsize::new(0),
        };
        // The default worker always exists as far as scheduling goes.
        state
            .igors
            .lock()
            .expect("igor table poisoned")
            .insert(DEFAULT_IGOR_ID.to_string(), {
                let mut igor = IgorInstance::new(DEFAULT_IGOR_ID, None);
                igor.status = IgorStatus::Unknown;
                igor
            });
        state
    }

    // ── Igor table ────────────────────────────────────────────────────────────

    /// A worker announced itself (registration or spawn acknowledgement).
    pub fn igor_seen(&self, id: &str, route: Option<String>) {
        let mut igors = self.igors.lock().expect("igor table poisoned");
        match igors.get_mut(id) {
            Some(igor) => {
                igor.last_seen = Utc::now();
                if igor.status == IgorStatus::Unknown {
                    igor.status = IgorStatus::Idle;
                }
            }
            None => {
                igors.insert(id.to_string(), IgorInstance::new(id, route));
                info!(%id, "igor registered");
            }
        }
    }

    /// Create the `unknown` placeholder for a just-requested spawn.
    pub fn igor_placeholder(&self, route_id: &str) -> String {
        let placeholder = IgorInstance::placeholder(route_id);
        let id = placeholder.id.clone();
        self.igors
            .lock()
            .expect("igor table poisoned")
            .entry(id.clone())
            .or_insert(placeholder);
        id
    }

    /// Round-robin over idle/unknown workers.
    pub fn available_igor(&self) -> Option<String> {
        let igors = self.igors.lock().expect("igor table poisoned");
        let mut eligible: Vec<&IgorInstance> =
            igors.values().filter(|igor| igor.schedulable()).collect();
        if eligible.is_empty() {
            return None;
        }
        eligible.sort_by(|a, b| a.id.cmp(&b.id));
        let cursor = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
        Some(eligible[cursor % eligible.len()].id.clone())
    }

    /// Prefer the route's own worker, else fall back to round-robin.
    pub fn igor_for_route(&self, route_id: &str) -> Option<String> {
        {
            let igors = self.igors.lock().expect("igor table poisoned");
            let candidate = format!("igor-{route_id}");
            if let Some(igor) = igors.get(&candidate) {
                if igor.schedulable() {
                    return Some(candidate);
                }
            }
        }
        self.available_igor()
    }

    // ── Plan admission ────────────────────────────────────────────────────────

    pub fn active_plan_count(&self) -> usize {
        self.plans
            .lock()
            .expect("plan table poisoned")
            .values()
            .filter(|state| !state.status.is_terminal())
            .count()
    }

    /// Admit a compiled plan: capacity gate, worker choice, bookkeeping.
    /// The returned [`Submission`] carries the `plan.submit` envelope.
    pub fn admit(&self, plan: Plan) -> Result<Submission, Fault> {
        if self.active_plan_count() >= self.config.max_active_plans {
            return Err(Fault::new(
                FaultKind::Overload,
                format!("{} active plans, cap is {}", self.active_plan_count(), self.config.max_active_plans),
            ));
        }

        let igor_id = self
            .pick_igor(plan.route.as_ref().map(|route| route.id.as_str()))
            .ok_or_else(|| Fault::new(FaultKind::Overload, "no igor to queue on"))?;

        let state = PlanState::new(plan);
        let submission = self.build_submission(state, &igor_id, 0)?;
        Ok(submission)
    }

    /// Worker choice: the route's own worker, else round-robin over the
    /// schedulable set, else the default worker's queue. `None` only when
    /// even the default worker is gone.
    fn pick_igor(&self, route_id: Option<&str>) -> Option<String> {
        let preferred = match route_id {
            Some(route) => self.igor_for_route(route),
            None => self.available_igor(),
        };
        preferred.or_else(|| {
            let igors = self.igors.lock().expect("igor table poisoned");
            igors.contains_key(DEFAULT_IGOR_ID).then(|| DEFAULT_IGOR_ID.to_string())
        })
    }

    /// Shared tail of first admission and post-tool retry: mark the worker
    /// busy, stash the plan state, build the envelope.
    fn build_submission(
        &self,
        mut state: PlanState,
        igor_id: &str,
        start_step: usize,
    ) -> Result<Submission, Fault> {
        let (bag, reasoning) = {
            let dynamic = self.dynamic_tools.lock().expect("tool cache poisoned");
            toolbag::select_tool_bag(&state.plan.intent, &dynamic)
        };

        {
            let mut igors = self.igors.lock().expect("igor table poisoned");
            let igor = igors
                .get_mut(igor_id)
                .ok_or_else(|| Fault::new(FaultKind::Overload, "chosen igor vanished"))?;
            // A busy worker queues the submission; its current plan stays
            // whatever it is executing (at most one plan per worker). The
            // eventual plan.accepted flips the tracking to the new plan.
            if igor.schedulable() {
                igor.status = IgorStatus::Busy;
                igor.current_plan_id = Some(state.plan.id);
            }
        }

        state.assigned_to = Some(igor_id.to_string());
        let envelope = Envelope::new(
            COMPONENT,
            igor_id,
            msg::PLAN_SUBMIT,
            json!({
                "plan": state.plan,
                "toolBag": bag,
                "toolSelectionReasoning": reasoning,
                "startStep": start_step,
            }),
        );

        self.outstanding_submits
            .lock()
            .expect("submit map poisoned")
            .insert(envelope.id, state.plan.id);
        let plan_id = state.plan.id;
        self.plans
            .lock()
            .expect("plan table poisoned")
            .insert(plan_id, state);

        info!(plan = %plan_id, igor = %igor_id, start_step, "plan assigned");
        Ok(Submission {
            igor_id: igor_id.to_string(),
            envelope,
        })
    }

    // ── Lifecycle events ──────────────────────────────────────────────────────

    pub fn on_plan_accepted(&self, plan_id: Uuid) {
        let assigned = {
            let mut plans = self.plans.lock().expect("plan table poisoned");
            let Some(state) = plans.get_mut(&plan_id) else { return };
            if state.status == PlanStatus::Pending {
                let _ = state.transition(PlanStatus::Executing);
            }
            state.assigned_to.clone()
        };
        // Acceptance means execution actually began on that worker.
        if let Some(igor_id) = assigned {
            let mut igors = self.igors.lock().expect("igor table poisoned");
            if let Some(igor) = igors.get_mut(&igor_id) {
                igor.status = IgorStatus::Busy;
                igor.current_plan_id = Some(plan_id);
                igor.last_seen = Utc::now();
            }
        }
    }

    pub fn on_step_completed(&self, plan_id: Uuid, step_index: usize, result: serde_json::Value) {
        let mut plans = self.plans.lock().expect("plan table poisoned");
        if let Some(state) = plans.get_mut(&plan_id) {
            state.record_step_result(step_index, result);
        }
    }

    pub fn record_step_failure(&self, plan_id: Uuid, step_index: usize, fault: Fault) {
        let mut plans = self.plans.lock().expect("plan table poisoned");
        if let Some(state) = plans.get_mut(&plan_id) {
            state.record_step_failure(step_index, fault);
        }
    }

    /// Terminal `plan.completed` from a worker. Updates the worker, the
    /// plan, and (for branch children) the parent aggregate.
    pub fn on_plan_completed(&self, igor_id: &str, plan_id: Uuid, success: bool) {
        let parent = {
            let mut plans = self.plans.lock().expect("plan table poisoned");
            let Some(state) = plans.get_mut(&plan_id) else {
                warn!(%plan_id, "plan.completed for unknown plan");
                return;
            };
            if state.status.is_terminal() {
                // Terminal at most once; a duplicate completion is dropped
                // before it can double-count anything.
                warn!(%plan_id, "duplicate terminal transition ignored");
                return;
            }
            if state.status == PlanStatus::Pending {
                let _ = state.transition(PlanStatus::Executing);
            }
            let target = if success {
                PlanStatus::Completed
            } else {
                PlanStatus::Failed
            };
            let _ = state.transition(target);
            state
                .plan
                .parent_plan_id
                .map(|parent| (parent, state.plan.route.clone(), state.errors.clone()))
        };

        {
            let mut igors = self.igors.lock().expect("igor table poisoned");
            if let Some(igor) = igors.get_mut(igor_id) {
                if igor.current_plan_id == Some(plan_id) {
                    igor.current_plan_id = None;
                    igor.status = IgorStatus::Idle;
                }
                if success {
                    igor.completed += 1;
                } else {
                    igor.failed += 1;
                }
                igor.last_seen = Utc::now();
            }
        }

        if let Some((parent_id, route, errors)) = parent {
            self.update_branch(parent_id, route.map(|r| r.id), plan_id, success, errors);
        }
    }

    /// Recompute a branching parent after one child reached terminal state.
    fn update_branch(
        &self,
        parent_id: Uuid,
        route_id: Option<String>,
        child_id: Uuid,
        success: bool,
        errors: Vec<Fault>,
    ) {
        let plans = self.plans.lock().expect("plan table poisoned");
        let mut branches = self.branches.lock().expect("branch table poisoned");
        let Some(branch) = branches.get_mut(&parent_id) else {
            warn!(%parent_id, "terminal child for unknown branch");
            return;
        };

        if let Some(route_id) = route_id {
            branch.routes.insert(
                route_id,
                RouteResult {
                    success,
                    result: None,
                    error: errors.last().map(|fault| fault.stable_string()),
                },
            );
        }

        let child_statuses: Vec<PlanStatus> = branch
            .child_plan_ids
            .iter()
            .map(|child| {
                plans
                    .get(child)
                    .map(|state| state.status)
                    .unwrap_or(PlanStatus::Failed)
            })
            .collect();
        branch.status = BranchStatus::aggregate(&child_statuses);
        info!(
            branch = %parent_id, child = %child_id, status = ?branch.status,
            "branch child terminal"
        );
    }

    /// `igor.exited`: fail its in-flight plan with `worker_crashed` and
    /// reap the worker unless it is the default.
    pub fn on_igor_exited(&self, igor_id: &str, exit_code: i64) -> Option<Uuid> {
        let held_plan = {
            let mut igors = self.igors.lock().expect("igor table poisoned");
            let held = igors.get(igor_id).and_then(|igor| igor.current_plan_id);
            if igor_id == DEFAULT_IGOR_ID {
                if let Some(igor) = igors.get_mut(igor_id) {
                    igor.status = IgorStatus::Unknown;
                    igor.current_plan_id = None;
                }
            } else {
                igors.remove(igor_id);
            }
            held
        };
        warn!(%igor_id, exit_code, plan = ?held_plan, "igor exited");

        let plan_id = held_plan?;
        let fault = Fault::new(
            FaultKind::WorkerCrashed,
            format!("worker {igor_id} exited with code {exit_code}"),
        )
        .with("igor", igor_id);
        {
            // The crash is not tied to a step index; keep current_step at
            // wherever execution stopped.
            let mut plans = self.plans.lock().expect("plan table poisoned");
            if let Some(state) = plans.get_mut(&plan_id) {
                state.errors.push(fault);
            }
        }
        // A crashed worker never sends plan.completed; synthesize it.
        self.on_plan_completed(igor_id, plan_id, false);
        Some(plan_id)
    }

    /// The single legal failed→pending transition: retry after a causally
    /// linked tool creation, resuming from the failing step.
    pub fn resubmit_after_tool(&self, plan_id: Uuid) -> Result<Submission, Fault> {
        let (state, start_step) = {
            let mut plans = self.plans.lock().expect("plan table poisoned");
            let state = plans.get_mut(&plan_id).ok_or_else(|| {
                Fault::new(FaultKind::ValidationFailed, format!("no such plan {plan_id}"))
            })?;
            if state.status != PlanStatus::Failed {
                return Err(Fault::new(
                    FaultKind::ValidationFailed,
                    format!("plan {plan_id} is {:?}, not failed", state.status),
                ));
            }
            state.reset_for_retry().map_err(|e| {
                Fault::new(FaultKind::Unexpected, format!("retry reset refused: {e}"))
            })?;
            (state.clone(), state.current_step.min(state.plan.steps.len().saturating_sub(1)))
        };

        let igor_id = self
            .pick_igor(state.plan.route.as_ref().map(|route| route.id.as_str()))
            .ok_or_else(|| Fault::new(FaultKind::Overload, "no igor for retry"))?;

        self.build_submission(state, &igor_id, start_step)
    }

    /// Reassign an undeliverable submission to the default worker.
    pub fn reassign_to_default(&self, submit_envelope_id: Uuid) -> Option<Submission> {
        let plan_id = self
            .outstanding_submits
            .lock()
            .expect("submit map poisoned")
            .remove(&submit_envelope_id)?;

        let (state, previous) = {
            let mut plans = self.plans.lock().expect("plan table poisoned");
            let state = plans.get_mut(&plan_id)?;
            if state.status.is_terminal() {
                return None;
            }
            let previous = state.assigned_to.take();
            (state.clone(), previous)
        };

        // The specialized worker never got the plan; its placeholder goes
        // back to unknown.
        if let Some(previous) = previous {
            let mut igors = self.igors.lock().expect("igor table poisoned");
            if let Some(igor) = igors.get_mut(&previous) {
                if igor.current_plan_id == Some(plan_id) {
                    igor.current_plan_id = None;
                    igor.status = IgorStatus::Unknown;
                }
            }
        }

        warn!(plan = %plan_id, "submission undeliverable, queueing on default igor");
        let start = state.current_step;
        self.build_submission(state, DEFAULT_IGOR_ID, start).ok()
    }

    pub fn record_thought(&self, plan_id: Option<Uuid>, thought: String, context: serde_json::Value) {
        let mut thoughts = self.thoughts.lock().expect("thoughts poisoned");
        if thoughts.len() == THOUGHT_CAP {
            thoughts.remove(0);
        }
        thoughts.push(ThoughtRecord {
            plan_id,
            thought,
            context,
            at: Utc::now(),
        });
    }

    /// Drop terminal plans older than the TTL, and branches whose children
    /// are all gone. Returns how many plans were evicted.
    pub fn evict_expired(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.config.plan_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let cutoff = Utc::now() - ttl;

        let mut plans = self.plans.lock().expect("plan table poisoned");
        let before = plans.len();
        plans.retain(|_, state| match (state.status.is_terminal(), state.completed_at) {
            (true, Some(completed_at)) => completed_at > cutoff,
            _ => true,
        });
        let evicted = before - plans.len();

        let mut branches = self.branches.lock().expect("branch table poisoned");
        branches.retain(|_, branch| {
            !branch.status.is_terminal()
                || branch
                    .child_plan_ids
                    .iter()
                    .any(|child| plans.contains_key(child))
        });
        evicted
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use galvan_config::Env;
    use galvan_proto::{Action, Step};

    fn state_with_cap(max_active: usize) -> DoctorState {
        let env = Env::from_pairs([("MAX_ACTIVE_PLANS", max_active.to_string())]);
        let state = DoctorState::new(DoctorConfig::from_vars(&env));
        state.igor_seen(DEFAULT_IGOR_ID, None);
        state
    }

    fn plan() -> Plan {
        Plan::new(
            "navigate to http://a.test",
            vec![
                Step::new(Action::Launch),
                Step::new(Action::Navigate).with("url", "http://a.test"),
                Step::new(Action::Close),
            ],
        )
    }

    #[test]
    fn admission_respects_the_plan_cap() {
        let state = state_with_cap(2);
        state.igor_seen("igor-a", None);
        state.igor_seen("igor-b", None);

        assert!(state.admit(plan()).is_ok());
        assert!(state.admit(plan()).is_ok());
        let err = state.admit(plan()).unwrap_err();
        assert_eq!(err.kind, FaultKind::Overload);
    }

    #[test]
    fn cap_edge_one_below_is_accepted() {
        let state = state_with_cap(2);
        state.igor_seen("igor-a", None);
        state.admit(plan()).unwrap();
        // Exactly MAX_ACTIVE_PLANS - 1 others in flight: accepted.
        assert!(state.admit(plan()).is_ok());
    }

    #[test]
    fn round_robin_spreads_load() {
        let state = state_with_cap(10);
        state.igor_seen("igor-a", None);
        state.igor_seen("igor-b", None);

        let mut seen = std::collections::HashSet::new();
        // Default igor plus a and b are all schedulable.
        for _ in 0..6 {
            if let Some(id) = state.available_igor() {
                seen.insert(id);
            }
        }
        assert!(seen.len() >= 3);
    }

    #[test]
    fn route_prefers_its_own_worker() {
        let state = state_with_cap(10);
        state.igor_seen("igor-boy", Some("boy".into()));
        assert_eq!(state.igor_for_route("boy").unwrap(), "igor-boy");
        // Unknown route falls back to anything schedulable.
        assert!(state.igor_for_route("girl").is_some());
    }

    #[test]
    fn busy_route_worker_falls_back() {
        let state = state_with_cap(10);
        state.igor_seen("igor-boy", Some("boy".into()));
        {
            let mut igors = state.igors.lock().unwrap();
            igors.get_mut("igor-boy").unwrap().status = IgorStatus::Busy;
        }
        assert_ne!(state.igor_for_route("boy").unwrap(), "igor-boy");
    }

    #[test]
    fn completion_frees_the_worker_and_bumps_counters() {
        let state = state_with_cap(10);
        let submission = state.admit(plan()).unwrap();
        let plan_id: Uuid =
            serde_json::from_value(submission.envelope.payload["plan"]["id"].clone()).unwrap();

        state.on_plan_accepted(plan_id);
        state.on_plan_completed(&submission.igor_id, plan_id, true);

        let igors = state.igors.lock().unwrap();
        let igor = igors.get(&submission.igor_id).unwrap();
        assert_eq!(igor.status, IgorStatus::Idle);
        assert_eq!(igor.completed, 1);
        assert!(igor.current_plan_id.is_none());

        let plans = state.plans.lock().unwrap();
        assert_eq!(plans[&plan_id].status, PlanStatus::Completed);
    }

    #[test]
    fn duplicate_completion_is_ignored() {
        let state = state_with_cap(10);
        let submission = state.admit(plan()).unwrap();
        let plan_id: Uuid =
            serde_json::from_value(submission.envelope.payload["plan"]["id"].clone()).unwrap();

        state.on_plan_completed(&submission.igor_id, plan_id, false);
        state.on_plan_completed(&submission.igor_id, plan_id, true);

        let plans = state.plans.lock().unwrap();
        assert_eq!(plans[&plan_id].status, PlanStatus::Failed);
        let igors = state.igors.lock().unwrap();
        // The second completion still bumped nothing.
        assert_eq!(igors[&submission.igor_id].failed, 1);
        assert_eq!(igors[&submission.igor_id].completed, 0);
    }

    #[test]
    fn igor_exit_mid_plan_injects_worker_crashed() {
        let state = state_with_cap(10);
        state.igor_seen("igor-boy", Some("boy".into()));
        let mut route_plan = plan();
        route_plan.route = Some(galvan_proto::RouteDescriptor {
            id: "boy".into(),
            name: "Boy".into(),
            selector: None,
            value: None,
        });
        let submission = state.admit(route_plan).unwrap();
        assert_eq!(submission.igor_id, "igor-boy");
        let plan_id: Uuid =
            serde_json::from_value(submission.envelope.payload["plan"]["id"].clone()).unwrap();
        state.on_plan_accepted(plan_id);

        let crashed = state.on_igor_exited("igor-boy", 137).unwrap();
        assert_eq!(crashed, plan_id);

        let plans = state.plans.lock().unwrap();
        let plan_state = &plans[&plan_id];
        assert_eq!(plan_state.status, PlanStatus::Failed);
        assert!(plan_state
            .errors
            .iter()
            .any(|fault| fault.kind == FaultKind::WorkerCrashed));

        // Non-default worker is reaped.
        assert!(!state.igors.lock().unwrap().contains_key("igor-boy"));
    }

    #[test]
    fn branch_aggregation_follows_children() {
        let state = state_with_cap(10);
        state.igor_seen("igor-a", None);
        state.igor_seen("igor-b", None);

        let mut branch = BranchingPlan::new("gender selection");
        let mut boy = plan();
        boy.parent_plan_id = Some(branch.id);
        boy.route = Some(galvan_proto::RouteDescriptor {
            id: "boy".into(),
            name: "Boy".into(),
            selector: None,
            value: None,
        });
        let mut girl = plan();
        girl.parent_plan_id = Some(branch.id);
        girl.route = Some(galvan_proto::RouteDescriptor {
            id: "girl".into(),
            name: "Girl".into(),
            selector: None,
            value: None,
        });
        branch.child_plan_ids = vec![boy.id, girl.id];
        let branch_id = branch.id;
        state.branches.lock().unwrap().insert(branch_id, branch);

        let boy_id = boy.id;
        let girl_id = girl.id;
        let sub_a = state.admit(boy).unwrap();
        let sub_b = state.admit(girl).unwrap();

        state.on_plan_completed(&sub_a.igor_id, boy_id, true);
        {
            let branches = state.branches.lock().unwrap();
            assert_eq!(branches[&branch_id].status, BranchStatus::Executing);
        }

        state.on_plan_completed(&sub_b.igor_id, girl_id, false);
        let branches = state.branches.lock().unwrap();
        let branch = &branches[&branch_id];
        assert_eq!(branch.status, BranchStatus::Partial);
        assert!(branch.routes["boy"].success);
        assert!(!branch.routes["girl"].success);
    }

    #[test]
    fn resubmit_after_tool_resumes_from_failing_step() {
        let state = state_with_cap(10);
        let submission = state.admit(plan()).unwrap();
        let plan_id: Uuid =
            serde_json::from_value(submission.envelope.payload["plan"]["id"].clone()).unwrap();
        state.on_plan_accepted(plan_id);
        state.on_step_completed(plan_id, 0, serde_json::json!({}));
        state.record_step_failure(
            plan_id,
            1,
            Fault::new(FaultKind::ElementNotFound, "element not found"),
        );
        state.on_plan_completed(&submission.igor_id, plan_id, false);

        let retry = state.resubmit_after_tool(plan_id).unwrap();
        assert_eq!(retry.envelope.payload["startStep"], 1);

        let plans = state.plans.lock().unwrap();
        assert_eq!(plans[&plan_id].status, PlanStatus::Pending);
    }

    #[test]
    fn resubmit_requires_failed_state() {
        let state = state_with_cap(10);
        let submission = state.admit(plan()).unwrap();
        let plan_id: Uuid =
            serde_json::from_value(submission.envelope.payload["plan"]["id"].clone()).unwrap();
        // Still pending/executing: the retry transition is illegal.
        assert!(state.resubmit_after_tool(plan_id).is_err());
        drop(submission);
    }

    #[test]
    fn ttl_eviction_drops_only_old_terminal_plans() {
        let env = Env::from_pairs([("PLAN_TTL_MS", "0")]);
        let state = DoctorState::new(DoctorConfig::from_vars(&env));
        state.igor_seen(DEFAULT_IGOR_ID, None);

        let submission = state.admit(plan()).unwrap();
        let plan_id: Uuid =
            serde_json::from_value(submission.envelope.payload["plan"]["id"].clone()).unwrap();
        let keep = state.admit(plan()).unwrap();
        let keep_id: Uuid =
            serde_json::from_value(keep.envelope.payload["plan"]["id"].clone()).unwrap();

        state.on_plan_completed(&submission.igor_id, plan_id, true);
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert_eq!(state.evict_expired(), 1);
        let plans = state.plans.lock().unwrap();
        assert!(!plans.contains_key(&plan_id));
        assert!(plans.contains_key(&keep_id));
    }
}
