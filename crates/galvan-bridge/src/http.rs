// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The Bridge's small HTTP surface: health, event log, screenshot intake.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::server::BridgeState;

/// GET /health — per-component liveness.
pub async fn health(State(state): State<Arc<BridgeState>>) -> impl IntoResponse {
    let components = state.router.health();
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "components": components,
        "eventLogSize": state.router.event_count(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_events_limit")]
    pub limit: usize,
}

fn default_events_limit() -> usize {
    100
}

/// GET /events — the recent routed-message log, newest first.
pub async fn events(
    State(state): State<Arc<BridgeState>>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let events = state.router.recent_events(query.limit.min(1_000));
    Json(json!({"events": events}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotBody {
    pub base64: String,
    #[serde(default)]
    pub plan_id: Option<Uuid>,
    #[serde(default)]
    pub step_index: Option<usize>,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
}

/// POST /screenshots — ingest a base64 image blob and persist it under the
/// screenshots directory, named after the message it belongs to.
pub async fn screenshots(
    State(state): State<Arc<BridgeState>>,
    Json(body): Json<ScreenshotBody>,
) -> impl IntoResponse {
    let bytes = match base64::engine::general_purpose::STANDARD.decode(&body.base64) {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("invalid base64: {e}")})),
            )
                .into_response();
        }
    };

    let dir = &state.config.screenshots_dir;
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        warn!("screenshots dir unavailable: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "screenshots dir unavailable"})),
        )
            .into_response();
    }

    let stem = body
        .correlation_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let name = match (body.plan_id, body.step_index) {
        (Some(plan), Some(step)) => format!("{plan}_step{step}_{stem}.png"),
        (Some(plan), None) => format!("{plan}_{stem}.png"),
        _ => format!("{stem}.png"),
    };
    let path = dir.join(name);

    if let Err(e) = tokio::fs::write(&path, &bytes).await {
        warn!("screenshot write failed: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "write failed"})),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(json!({"path": path.display().to_string(), "bytes": bytes.len()})),
    )
        .into_response()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use galvan_config::{BridgeConfig, Env};

    fn state_with_dir(dir: &std::path::Path) -> Arc<BridgeState> {
        let env = Env::from_pairs([("SCREENSHOTS_DIR", dir.to_str().unwrap())]);
        Arc::new(BridgeState::new(BridgeConfig::from_vars(&env)))
    }

    #[tokio::test]
    async fn screenshot_is_written_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_dir(dir.path());
        let plan = Uuid::new_v4();

        let response = screenshots(
            State(state),
            Json(ScreenshotBody {
                base64: base64::engine::general_purpose::STANDARD.encode(b"png-bytes"),
                plan_id: Some(plan),
                step_index: Some(2),
                correlation_id: None,
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].as_ref().unwrap().file_name();
        assert!(name.to_string_lossy().starts_with(&format!("{plan}_step2_")));
    }

    #[tokio::test]
    async fn invalid_base64_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_dir(dir.path());
        let response = screenshots(
            State(state),
            Json(ScreenshotBody {
                base64: "!!!not-base64!!!".into(),
                plan_id: None,
                step_index: None,
                correlation_id: None,
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
