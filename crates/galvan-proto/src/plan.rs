// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Plans, steps and their Doctor-side execution state.
//!
//! A [`Plan`] is the compiled form of a natural-language intent: an ordered
//! list of [`Step`]s over a closed action set. The Doctor tracks each plan
//! in a [`PlanState`] whose status moves `pending → executing → completed |
//! failed`; the only legal non-monotonic transition is `failed → pending`,
//! taken when a tool creation is causally linked to one of the plan's
//! accumulated errors ([`PlanState::reset_for_retry`]).
//!
//! Branching intents get a parent [`BranchingPlan`] whose status is a pure
//! function of its children's terminal states ([`BranchStatus::aggregate`]).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::fault::Fault;

// ── Actions & steps ───────────────────────────────────────────────────────────

/// The closed set of step actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Launch,
    Navigate,
    Click,
    Type,
    Select,
    Screenshot,
    Wait,
    Verify,
    Close,
}

impl Action {
    /// Recommended per-action timeout attached by the compiler.
    pub fn default_timeout_ms(self) -> u64 {
        match self {
            Action::Navigate => 30_000,
            Action::Click | Action::Type | Action::Select => 5_000,
            Action::Verify => 10_000,
            Action::Launch | Action::Close => 15_000,
            Action::Screenshot => 10_000,
            Action::Wait => 60_000,
        }
    }

    /// Default retry budget for the action; the effective budget is
    /// `min(step.retries, default)`.
    pub fn default_retries(self) -> u32 {
        match self {
            Action::Click | Action::Type | Action::Select => 3,
            Action::Navigate | Action::Verify => 2,
            Action::Launch | Action::Screenshot => 1,
            Action::Wait | Action::Close => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Launch => "launch",
            Action::Navigate => "navigate",
            Action::Click => "click",
            Action::Type => "type",
            Action::Select => "select",
            Action::Screenshot => "screenshot",
            Action::Wait => "wait",
            Action::Verify => "verify",
            Action::Close => "close",
        }
    }
}

/// One compiled step: an action plus its parameter map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub action: Action,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl Step {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            params: BTreeMap::new(),
            timeout_ms: Some(action.default_timeout_ms()),
            retries: None,
        }
    }

    /// Attach one parameter, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Effective retry budget: `min(step.retries, action default)`.
    pub fn retry_budget(&self) -> u32 {
        let default = self.action.default_retries();
        match self.retries {
            Some(r) => r.min(default),
            None => default,
        }
    }
}

// ── Routes ────────────────────────────────────────────────────────────────────

/// One user-flow variant detected inside a single intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDescriptor {
    /// Stable route id, e.g. `boy` or `admin`. Also the suffix of the
    /// route-specialized Igor (`igor-boy`).
    pub id: String,
    pub name: String,
    /// Selector for the route-specific first interaction, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Value to select for the route, if the interaction is a `select`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

// ── Plans ─────────────────────────────────────────────────────────────────────

/// A compiled plan, immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: Uuid,
    /// The sanitized originating intent.
    pub intent: String,
    pub steps: Vec<Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_plan_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteDescriptor>,
}

impl Plan {
    pub fn new(intent: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: Uuid::new_v4(),
            intent: intent.into(),
            steps,
            expected_outcome: None,
            created_at: Utc::now(),
            parent_plan_id: None,
            route: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Failed)
    }
}

/// Doctor-side execution state of one plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanState {
    pub plan: Plan,
    pub status: PlanStatus,
    /// Index of the step currently (or next to be) executed.
    pub current_step: usize,
    /// Per-step result slots, filled as `step.completed` events arrive.
    pub step_results: Vec<Option<Value>>,
    /// Accumulated step errors, in arrival order.
    pub errors: Vec<Fault>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Id of the Igor currently executing the plan, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
}

/// Error returned for a status transition the state machine forbids.
#[derive(Debug, thiserror::Error, PartialEq)]
#[error("illegal plan transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: PlanStatus,
    pub to: PlanStatus,
}

impl PlanState {
    pub fn new(plan: Plan) -> Self {
        let slots = plan.steps.len();
        Self {
            plan,
            status: PlanStatus::Pending,
            current_step: 0,
            step_results: vec![None; slots],
            errors: Vec::new(),
            completed_at: None,
            assigned_to: None,
        }
    }

    /// Move the plan forward. Status is monotonic: pending → executing →
    /// terminal. Terminal states accept no further transition here; the
    /// retry path goes through [`PlanState::reset_for_retry`].
    pub fn transition(&mut self, to: PlanStatus) -> Result<(), IllegalTransition> {
        use PlanStatus::*;
        let legal = matches!(
            (self.status, to),
            (Pending, Executing) | (Executing, Completed) | (Executing, Failed) | (Pending, Failed)
        );
        if !legal {
            return Err(IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// The single legal non-monotonic transition: `failed → pending`, taken
    /// only when a tool creation is causally linked to one of this plan's
    /// accumulated errors. Execution resumes from the failing step; earlier
    /// step results are retained.
    pub fn reset_for_retry(&mut self) -> Result<(), IllegalTransition> {
        if self.status != PlanStatus::Failed {
            return Err(IllegalTransition {
                from: self.status,
                to: PlanStatus::Pending,
            });
        }
        self.status = PlanStatus::Pending;
        self.completed_at = None;
        self.assigned_to = None;
        Ok(())
    }

    pub fn record_step_result(&mut self, index: usize, result: Value) {
        if let Some(slot) = self.step_results.get_mut(index) {
            *slot = Some(result);
        }
        self.current_step = index + 1;
    }

    pub fn record_step_failure(&mut self, index: usize, fault: Fault) {
        self.current_step = index;
        self.errors.push(fault);
    }
}

// ── Branching plans ───────────────────────────────────────────────────────────

/// Terminal outcome of one route inside a branching plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Pending,
    Executing,
    /// Every child completed successfully.
    Completed,
    /// At least one child failed, but not all.
    Partial,
    /// Every child failed.
    Failed,
}

impl BranchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BranchStatus::Completed | BranchStatus::Partial | BranchStatus::Failed
        )
    }

    /// Compute the parent status from the children's statuses. Pure: called
    /// on every child transition rather than tracked separately.
    pub fn aggregate(children: &[PlanStatus]) -> BranchStatus {
        if children.is_empty() {
            return BranchStatus::Pending;
        }
        if !children.iter().all(|s| s.is_terminal()) {
            return BranchStatus::Executing;
        }
        let failed = children
            .iter()
            .filter(|s| **s == PlanStatus::Failed)
            .count();
        match failed {
            0 => BranchStatus::Completed,
            n if n == children.len() => BranchStatus::Failed,
            _ => BranchStatus::Partial,
        }
    }
}

/// Parent container for per-route plans executed concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchingPlan {
    pub id: Uuid,
    pub description: String,
    pub child_plan_ids: Vec<Uuid>,
    /// route id → terminal result, filled as children finish.
    pub routes: BTreeMap<String, RouteResult>,
    pub status: BranchStatus,
    pub created_at: DateTime<Utc>,
}

impl BranchingPlan {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            child_plan_ids: Vec::new(),
            routes: BTreeMap::new(),
            status: BranchStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
