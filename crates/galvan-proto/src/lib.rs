// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Shared wire types for the galvan cluster.
//!
//! Everything that crosses the bus lives here: the [`Envelope`] every frame
//! is wrapped in, the plan/step model the Doctor compiles and the Igors
//! execute, the dynamic-tool records Frankenstein owns, and the single
//! error taxonomy ([`Fault`]) all components speak.
//!
//! The crate is deliberately free of async machinery — it is data only, so
//! every component (and every test) can depend on it without dragging in a
//! runtime.

pub mod envelope;
pub mod fault;
pub mod failure;
pub mod igor;
pub mod msg;
pub mod plan;
pub mod tool;
pub mod validate;

pub use envelope::{Envelope, BROADCAST};
pub use fault::{Fault, FaultKind};
pub use failure::{normalize_failure_key, FailurePattern};
pub use igor::{IgorInstance, IgorStatus, DEFAULT_IGOR_ID};
pub use plan::{
    Action, BranchStatus, BranchingPlan, Plan, PlanState, PlanStatus, RouteDescriptor,
    RouteResult, Step,
};
pub use tool::{PendingToolRequest, ToolBagEntry, ToolBagKind, ToolRecord, ToolStatus};

/// Expected heartbeat cadence for every registered component.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// A component is considered dead once its last heartbeat is older than
/// three intervals.
pub const LIVENESS_WINDOW_SECS: u64 = 3 * HEARTBEAT_INTERVAL_SECS;
