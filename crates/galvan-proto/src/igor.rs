// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Igor worker bookkeeping, as tracked by the Doctor's scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Id of the statically-started default worker. Route-specialized workers
/// are named `igor-<routeId>`.
pub const DEFAULT_IGOR_ID: &str = "igor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgorStatus {
    Idle,
    Busy,
    /// Spawn requested but no acknowledgement seen yet. Schedulable.
    Unknown,
}

/// One worker as seen by the Doctor.
///
/// Invariant: at any instant a plan id appears in at most one Igor's
/// `current_plan_id` — the scheduler assigns under its table lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IgorInstance {
    pub id: String,
    pub status: IgorStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_plan_id: Option<Uuid>,
    pub completed: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl IgorInstance {
    pub fn new(id: impl Into<String>, route: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: IgorStatus::Idle,
            current_plan_id: None,
            completed: 0,
            failed: 0,
            route,
            registered_at: now,
            last_seen: now,
        }
    }

    /// Placeholder entry created when `igor.spawn` is issued; stays
    /// `Unknown` until the worker acknowledges.
    pub fn placeholder(route_id: &str) -> Self {
        let mut igor = Self::new(format!("igor-{route_id}"), Some(route_id.to_string()));
        igor.status = IgorStatus::Unknown;
        igor
    }

    /// Idle and unknown workers are both eligible for assignment.
    pub fn schedulable(&self) -> bool {
        matches!(self.status, IgorStatus::Idle | IgorStatus::Unknown)
    }

    pub fn is_default(&self) -> bool {
        self.id == DEFAULT_IGOR_ID
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
