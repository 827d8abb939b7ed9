// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Best-effort crash-recovery snapshots.
//!
//! Plan states are mirrored as one JSON file each under
//! `<experience_dir>/plans/`. Durability is deliberately not ACID: a write
//! failure is logged and forgotten, and the TTL sweeper that evicts
//! in-memory plans removes their files too.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use galvan_proto::PlanState;

pub struct PlanStore {
    dir: PathBuf,
}

impl PlanStore {
    pub fn new(experience_dir: &Path) -> Self {
        Self {
            dir: experience_dir.join("plans"),
        }
    }

    pub async fn save(&self, state: &PlanState) {
        if let Err(e) = self.try_save(state).await {
            warn!(plan = %state.plan.id, "plan snapshot failed: {e}");
        }
    }

    async fn try_save(&self, state: &PlanState) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(state.plan.id);
        let body = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&path, body).await?;
        debug!(plan = %state.plan.id, "plan snapshot written");
        Ok(())
    }

    pub async fn remove(&self, plan_id: Uuid) {
        let _ = tokio::fs::remove_file(self.path_for(plan_id)).await;
    }

    /// Load every snapshot on disk (crash recovery at startup). Unreadable
    /// files are skipped, not fatal.
    pub async fn load_all(&self) -> Vec<PlanState> {
        let mut out = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return out;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<PlanState>(&bytes) {
                    Ok(state) => out.push(state),
                    Err(e) => warn!(path = %path.display(), "unreadable snapshot skipped: {e}"),
                },
                Err(e) => warn!(path = %path.display(), "snapshot read failed: {e}"),
            }
        }
        out
    }

    fn path_for(&self, plan_id: Uuid) -> PathBuf {
        self.dir.join(format!("{plan_id}.json"))
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
