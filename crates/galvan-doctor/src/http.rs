// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The Doctor's HTTP API.
//!
//! `POST /plan` is the cluster's front door: sanitize the intent, detect
//! branching, compile, validate, admit, submit. Reads expose the plan,
//! igor, branch and tool-loop state for dashboards.
//!
//! Every endpoint except `/health` sits behind a per-IP sliding-window
//! rate limit (`RATE_LIMIT_MAX_REQUESTS` per `RATE_LIMIT_WINDOW_MS`);
//! over-limit requests get `429` with `Retry-After`. Mutating routes are
//! additionally gated by the `ALLOWED_ORIGINS` CORS allowlist.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::process::Stdio;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use galvan_proto::{msg, validate, BranchingPlan, Envelope, Fault, FaultKind, PlanState};

use crate::branching::{compile_route_plans, BranchDetector};
use crate::compiler::Compiler;
use crate::persist::PlanStore;
use crate::service::DoctorService;

type IpLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

pub struct HttpState {
    pub service: Arc<DoctorService>,
    pub compiler: Compiler,
    pub detector: BranchDetector,
    pub store: Arc<PlanStore>,
    limiter: IpLimiter,
    retry_after_secs: u64,
}

impl HttpState {
    pub fn new(service: Arc<DoctorService>, store: Arc<PlanStore>) -> Self {
        let config = &service.state.config;
        let max = NonZeroU32::new(config.rate_limit_max_requests.max(1))
            .expect("nonzero by construction");
        let period = config
            .rate_limit_window
            .checked_div(config.rate_limit_max_requests.max(1))
            .unwrap_or(std::time::Duration::from_secs(1));
        let quota = Quota::with_period(period.max(std::time::Duration::from_millis(1)))
            .expect("nonzero period")
            .allow_burst(max);
        let retry_after_secs = config.rate_limit_window.as_secs().max(1);
        Self {
            service,
            compiler: Compiler::new(),
            detector: BranchDetector::new(),
            store,
            limiter: RateLimiter::keyed(quota),
            retry_after_secs,
        }
    }

    /// Sliding-window check for one client IP.
    pub fn check_rate(&self, ip: IpAddr) -> Result<(), u64> {
        self.limiter
            .check_key(&ip)
            .map_err(|_| self.retry_after_secs)
    }
}

pub fn build_app(state: Arc<HttpState>) -> Router {
    // /health is exempt from rate limiting; everything else is gated.
    let limited = Router::new()
        .route("/plans", get(list_plans))
        .route("/plan/:id", get(get_plan))
        .route("/plan", axum::routing::post(post_plan))
        .route("/igors", get(list_igors))
        .route("/branches", get(list_branches))
        .route("/branches/:id", get(get_branch))
        .route("/frank", get(frank_status))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_mw))
        .layer(middleware::from_fn_with_state(state.clone(), cors_mw));

    Router::new()
        .route("/health", get(health))
        .merge(limited)
        .with_state(state)
}

// ── Middleware ────────────────────────────────────────────────────────────────

async fn rate_limit_mw(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    match state.check_rate(addr.ip()) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            warn!(ip = %addr.ip(), "rate limit exceeded");
            let fault = Fault::new(FaultKind::Overload, "rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(axum::http::header::RETRY_AFTER, retry_after.to_string())],
                Json(json!({"error": fault})),
            )
                .into_response()
        }
    }
}

/// Origin allowlist: echo the origin header back when it is allowed, and
/// refuse cross-origin mutations from anywhere else.
async fn cors_mw(
    State(state): State<Arc<HttpState>>,
    request: Request,
    next: Next,
) -> Response {
    let allowed = &state.service.state.config.allowed_origins;
    let origin = request
        .headers()
        .get(axum::http::header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(String::from);

    if let Some(origin) = &origin {
        let permitted =
            allowed.iter().any(|entry| entry == origin) || allowed.iter().any(|entry| entry == "*");
        if !permitted && request.method() != axum::http::Method::GET {
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }

    let mut response = next.run(request).await;
    if let Some(origin) = origin {
        if let Ok(value) = HeaderValue::from_str(&origin) {
            response
                .headers_mut()
                .insert(axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }
    response
}

// ── Read endpoints ────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let doctor = &state.service.state;
    let igors = doctor.igors.lock().expect("igor table poisoned");
    let config = &doctor.config;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": doctor.started_at.elapsed().as_secs(),
        "pid": std::process::id(),
        "bridgeConnected": state.service.bus.is_connected(),
        "planLimits": {
            "active": doctor.active_plan_count(),
            "max": config.max_active_plans,
        },
        "reconnection": {
            "maxAttempts": config.reconnect.max_attempts,
            "initialDelayMs": config.reconnect.initial_delay.as_millis() as u64,
            "maxDelayMs": config.reconnect.max_delay.as_millis() as u64,
        },
        "experience": {
            "dir": config.experience_dir.display().to_string(),
        },
        "igors": igors.values().collect::<Vec<_>>(),
    }))
}

async fn list_plans(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let plans = state.service.state.plans.lock().expect("plan table poisoned");
    let view: Vec<_> = plans
        .values()
        .map(|plan_state| {
            json!({
                "id": plan_state.plan.id,
                "intent": plan_state.plan.intent,
                "status": plan_state.status,
                "currentStep": plan_state.current_step,
                "totalSteps": plan_state.plan.steps.len(),
                "errors": plan_state.errors,
                "assignedTo": plan_state.assigned_to,
            })
        })
        .collect();
    Json(json!({"plans": view}))
}

async fn get_plan(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
) -> Response {
    let plans = state.service.state.plans.lock().expect("plan table poisoned");
    match plans.get(&id) {
        Some(plan_state) => Json(json!({"plan": plan_state})).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no plan {id}")})),
        )
            .into_response(),
    }
}

async fn list_igors(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let igors = state.service.state.igors.lock().expect("igor table poisoned");
    let (mut idle, mut busy, mut unknown) = (0usize, 0usize, 0usize);
    for igor in igors.values() {
        match igor.status {
            galvan_proto::IgorStatus::Idle => idle += 1,
            galvan_proto::IgorStatus::Busy => busy += 1,
            galvan_proto::IgorStatus::Unknown => unknown += 1,
        }
    }
    Json(json!({
        "summary": {"total": igors.len(), "idle": idle, "busy": busy, "unknown": unknown},
        "instances": igors.values().collect::<Vec<_>>(),
    }))
}

async fn list_branches(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let branches = state
        .service
        .state
        .branches
        .lock()
        .expect("branch table poisoned");
    Json(json!({"branches": branches.values().collect::<Vec<_>>()}))
}

async fn get_branch(
    State(state): State<Arc<HttpState>>,
    Path(id): Path<Uuid>,
) -> Response {
    let branches = state
        .service
        .state
        .branches
        .lock()
        .expect("branch table poisoned");
    match branches.get(&id) {
        Some(branch) => Json(json!({"branch": branch})).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no branch {id}")})),
        )
            .into_response(),
    }
}

async fn frank_status(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let doctor = &state.service.state;
    let config = &doctor.config;
    Json(json!({
        "toolCreation": {
            "enabled": config.tool_creation_enabled,
            "threshold": config.failure_threshold_for_tool,
        },
        "metrics": doctor.failures.metrics(),
        "failurePatterns": doctor.failures.patterns_snapshot(),
        "pendingRequests": doctor.failures.pending_snapshot(),
        "restartInFlight": state.service.restart.is_restarting(),
        "knownDynamicTools": doctor
            .dynamic_tools
            .lock()
            .expect("tool cache poisoned")
            .len(),
    }))
}

// ── POST /plan ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub intent: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub force_branching: bool,
}

async fn post_plan(
    State(state): State<Arc<HttpState>>,
    Json(body): Json<PlanRequest>,
) -> Response {
    let intent = validate::sanitize_intent(&body.intent);
    if intent.is_empty() {
        return fault_response(Fault::validation("intent is empty"));
    }
    if let Some(url) = &body.url {
        if let Err(fault) = validate::validate_url(url, state.service.state.config.allow_localhost)
        {
            return fault_response(fault);
        }
    }

    let branch = state.detector.detect(&intent);
    match branch {
        Some(branch_point) if body.force_branching || branch_point.routes.len() > 1 => {
            submit_branching(&state, &intent, body.url.as_deref(), branch_point).await
        }
        _ => submit_standard(&state, &intent, body.url.as_deref()).await,
    }
}

async fn submit_standard(
    state: &Arc<HttpState>,
    intent: &str,
    url: Option<&str>,
) -> Response {
    let doctor = &state.service.state;
    let plan = state.compiler.compile(intent, url);
    if let Err(fault) = validate::validate_plan(&plan, doctor.config.allow_localhost) {
        return fault_response(fault);
    }

    let steps = plan.steps.clone();
    let plan_id = plan.id;
    match doctor.admit(plan) {
        Ok(submission) => {
            snapshot(state, plan_id).await;
            let assigned = submission.igor_id.clone();
            if let Err(e) = state.service.bus.send(submission.envelope).await {
                warn!("plan submission lost: {e}");
            }
            info!(%plan_id, igor = %assigned, "standard plan submitted");
            Json(json!({
                "type": "standard",
                "planId": plan_id,
                "assignedTo": assigned,
                "steps": steps,
            }))
            .into_response()
        }
        Err(fault) => fault_response(fault),
    }
}

async fn submit_branching(
    state: &Arc<HttpState>,
    intent: &str,
    url: Option<&str>,
    branch_point: crate::branching::BranchPoint,
) -> Response {
    let doctor = &state.service.state;

    // Capacity gate for the whole family, up front.
    if doctor.active_plan_count() + branch_point.routes.len() > doctor.config.max_active_plans {
        return fault_response(Fault::new(
            FaultKind::Overload,
            "branching plan would exceed the active-plan cap",
        ));
    }

    let mut branch = BranchingPlan::new(branch_point.description.clone());
    let plans = compile_route_plans(&state.compiler, intent, url, branch.id, &branch_point);
    for plan in &plans {
        if let Err(fault) = validate::validate_plan(plan, doctor.config.allow_localhost) {
            return fault_response(fault);
        }
    }
    branch.child_plan_ids = plans.iter().map(|plan| plan.id).collect();
    let branch_id = branch.id;
    doctor
        .branches
        .lock()
        .expect("branch table poisoned")
        .insert(branch_id, branch);

    // One specialized worker per route: placeholder, spawn, announce.
    for route in &branch_point.routes {
        let igor_id = doctor.igor_placeholder(&route.id);
        spawn_igor_process(state, &route.id);
        let announce = Envelope::new(
            state.service.bus.component_id().to_string(),
            galvan_proto::BROADCAST,
            msg::IGOR_SPAWN,
            json!({
                "id": igor_id,
                "route": route.id,
                "conditions": {"selector": route.selector, "value": route.value},
            }),
        );
        let _ = state.service.bus.send(announce).await;
    }

    let mut routes_view = Vec::new();
    for plan in plans {
        let plan_id = plan.id;
        let route_id = plan
            .route
            .as_ref()
            .map(|route| route.id.clone())
            .unwrap_or_default();
        match doctor.admit(plan) {
            Ok(submission) => {
                snapshot(state, plan_id).await;
                routes_view.push(json!({
                    "routeId": route_id,
                    "planId": plan_id,
                    "assignedTo": submission.igor_id,
                }));
                if let Err(e) = state.service.bus.send(submission.envelope).await {
                    warn!("route submission lost: {e}");
                }
            }
            Err(fault) => return fault_response(fault),
        }
    }

    info!(%branch_id, routes = routes_view.len(), "branching plan submitted");
    Json(json!({
        "type": "branching",
        "parentPlanId": branch_id,
        "branchDescription": branch_point.description,
        "routes": routes_view,
    }))
    .into_response()
}

/// Start a route-specialized worker process. Spawn failure is logged only
/// — the undeliverable path will queue the plan on the default Igor. A
/// waiter task reports the eventual exit to the scheduler, which is what
/// turns a crashed worker into a `worker_crashed` plan failure.
fn spawn_igor_process(state: &Arc<HttpState>, route_id: &str) {
    let command = &state.service.state.config.igor_command;
    if command.is_empty() {
        return;
    }
    let spawned = tokio::process::Command::new(&command[0])
        .args(&command[1..])
        .arg("--route")
        .arg(route_id)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    match spawned {
        Ok(mut child) => {
            info!(pid = child.id(), %route_id, "spawned route igor");
            let doctor = state.service.state.clone();
            let igor_id = format!("igor-{route_id}");
            tokio::spawn(async move {
                let exit_code = child
                    .wait()
                    .await
                    .ok()
                    .and_then(|status| status.code())
                    .unwrap_or(-1) as i64;
                doctor.on_igor_exited(&igor_id, exit_code);
            });
        }
        Err(e) => warn!(%route_id, "igor spawn failed: {e}"),
    }
}

async fn snapshot(state: &Arc<HttpState>, plan_id: Uuid) {
    let plan_state: Option<PlanState> = {
        let plans = state.service.state.plans.lock().expect("plan table poisoned");
        plans.get(&plan_id).cloned()
    };
    if let Some(plan_state) = plan_state {
        state.store.save(&plan_state).await;
    }
}

fn fault_response(fault: Fault) -> Response {
    let status = match fault.kind {
        FaultKind::ValidationFailed => StatusCode::BAD_REQUEST,
        FaultKind::Overload => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": fault}))).into_response()
}

// ── Unit tests ────────────────────────────────────────────────────────────────
