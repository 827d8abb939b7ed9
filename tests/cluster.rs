// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Whole-cluster scenarios: Bridge, Doctor, Igor and Frank in one process,
//! talking over a real WebSocket bus, driven through the Doctor's HTTP API.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;

use galvan_bridge::BridgeState;
use galvan_bus::{BusClient, BusConfig, BusHandle};
use galvan_config::{BridgeConfig, DoctorConfig, Env, FrankConfig};
use galvan_doctor::http::HttpState;
use galvan_doctor::persist::PlanStore;
use galvan_doctor::scheduler::DoctorState;
use galvan_doctor::service::DoctorService;
use galvan_frank::driver::{Script, ScriptedFactory};
use galvan_frank::service::FrankService;
use galvan_igor::service::IgorService;
use galvan_proto::{msg, Envelope};

const TOKEN: &str = "cluster-test-token";

struct Cluster {
    doctor_url: String,
    bridge_ws: String,
    http: reqwest::Client,
    _experience_dir: tempfile::TempDir,
}

impl Cluster {
    async fn get(&self, path: &str) -> Value {
        self.http
            .get(format!("{}{path}", self.doctor_url))
            .send()
            .await
            .expect("doctor http get")
            .json()
            .await
            .expect("doctor http json")
    }

    async fn post_plan(&self, body: Value) -> (u16, Value) {
        let response = self
            .http
            .post(format!("{}/plan", self.doctor_url))
            .json(&body)
            .send()
            .await
            .expect("doctor http post");
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(json!(null));
        (status, body)
    }

    fn bus_client(&self, id: &str) -> (BusHandle, tokio::sync::mpsc::Receiver<Envelope>) {
        BusClient::spawn(BusConfig::new(id, "test", self.bridge_ws.clone(), TOKEN))
    }
}

/// Boot a bridge + frank (scripted driver) + default igor + doctor.
async fn start_cluster(script: Script, doctor_env: Vec<(String, String)>) -> Cluster {
    // ── Bridge ────────────────────────────────────────────────────────────────
    let env = Env::from_pairs([("BRIDGE_AUTH_TOKEN", TOKEN), ("BRIDGE_EVENT_LOG_PATH", "")]);
    let bridge_state = Arc::new(BridgeState::new(BridgeConfig::from_vars(&env)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bridge_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        galvan_bridge::serve(listener, bridge_state).await.unwrap();
    });
    let bridge_ws = format!("ws://{bridge_addr}/ws");

    // ── Frank (no HTTP needed here; the bus surface is what Igor uses) ────────
    let frank_config = FrankConfig::from_vars(&Env::from_pairs::<[(&str, &str); 0], _, _>([]));
    let (frank_bus, mut frank_ingress) =
        BusClient::spawn(BusConfig::new("frank", "test", bridge_ws.clone(), TOKEN));
    let frank = Arc::new(FrankService::new(
        frank_config,
        frank_bus.clone(),
        Arc::new(ScriptedFactory::with_script(script)),
    ));
    frank.disable_process_exit();
    tokio::spawn(async move {
        while let Some(env) = frank_ingress.recv().await {
            let frank = frank.clone();
            tokio::spawn(async move { frank.handle(env).await });
        }
    });

    // ── Default igor ──────────────────────────────────────────────────────────
    spawn_igor(&bridge_ws, "igor", None).await;

    // ── Doctor ────────────────────────────────────────────────────────────────
    let experience_dir = tempfile::tempdir().unwrap();
    let mut pairs: Vec<(String, String)> = vec![
        ("BRIDGE_URL".into(), bridge_ws.clone()),
        ("BRIDGE_AUTH_TOKEN".into(), TOKEN.into()),
        (
            "EXPERIENCE_DIR".into(),
            experience_dir.path().display().to_string(),
        ),
        // Never fork real processes out of a test.
        ("IGOR_SPAWN_COMMAND".into(), String::new()),
        ("FRANK_SPAWN_COMMAND".into(), String::new()),
        // No frank http in this harness; restart polling fails fast.
        ("FRANK_URL".into(), "http://127.0.0.1:1".into()),
        // The tests poll aggressively; keep the limiter out of the way.
        ("RATE_LIMIT_MAX_REQUESTS".into(), "100000".into()),
    ];
    pairs.extend(doctor_env);
    let doctor_config = DoctorConfig::from_vars(&Env::from_pairs(pairs));

    let (doctor_bus, mut doctor_ingress) =
        BusClient::spawn(BusConfig::new("doctor", "test", bridge_ws.clone(), TOKEN));
    let store = Arc::new(PlanStore::new(&doctor_config.experience_dir));
    let doctor_state = Arc::new(DoctorState::new(doctor_config));
    let service = Arc::new(DoctorService::new(doctor_state, doctor_bus.clone()));
    {
        let service = service.clone();
        tokio::spawn(async move {
            while let Some(env) = doctor_ingress.recv().await {
                let service = service.clone();
                tokio::spawn(async move { service.handle(env).await });
            }
        });
    }

    let http_state = Arc::new(HttpState::new(service, store));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let doctor_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            galvan_doctor::http::build_app(http_state)
                .into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .unwrap();
    });

    // Everyone on the bus before the first plan.
    frank_bus.wait_connected().await;
    doctor_bus.wait_connected().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    Cluster {
        doctor_url: format!("http://{doctor_addr}"),
        bridge_ws,
        http: reqwest::Client::new(),
        _experience_dir: experience_dir,
    }
}

async fn spawn_igor(bridge_ws: &str, id: &str, route: Option<String>) {
    let (bus, mut ingress) = BusClient::spawn(BusConfig::new(id, "test", bridge_ws, TOKEN));
    let igor = Arc::new(IgorService::new(id.to_string(), route, bus.clone()));
    tokio::spawn(async move {
        while let Some(env) = ingress.recv().await {
            let igor = igor.clone();
            tokio::spawn(async move { igor.handle(env).await });
        }
    });
    bus.wait_connected().await;
}

async fn plan_status(cluster: &Cluster, plan_id: &str) -> (String, Value) {
    let body = cluster.get(&format!("/plan/{plan_id}")).await;
    (
        body["plan"]["status"].as_str().unwrap_or("missing").to_string(),
        body["plan"].clone(),
    )
}

async fn await_terminal(cluster: &Cluster, plan_id: &str, deadline: Duration) -> (String, Value) {
    let end = tokio::time::Instant::now() + deadline;
    loop {
        let (status, plan) = plan_status(cluster, plan_id).await;
        if status == "completed" || status == "failed" {
            return (status, plan);
        }
        assert!(
            tokio::time::Instant::now() < end,
            "plan {plan_id} still {status} after {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_navigate_completes_in_order() {
    let cluster = start_cluster(Script::default(), vec![]).await;

    let (status, body) = cluster
        .post_plan(json!({"intent": "navigate to http://localhost:8080"}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["type"], "standard");
    let steps = body["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 4);
    assert_eq!(steps[1]["params"]["url"], "http://localhost:8080");

    let plan_id = body["planId"].as_str().unwrap();
    let (final_status, plan) = await_terminal(&cluster, plan_id, Duration::from_secs(10)).await;
    assert_eq!(final_status, "completed");

    // Four step.completed events, in order, all slots filled.
    let results = plan["stepResults"].as_array().unwrap();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|slot| !slot.is_null()));
    assert_eq!(plan["currentStep"], 4);
    assert_eq!(plan["errors"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn overload_rejects_the_third_plan() {
    // One worker, plans slowed down by a flaky element that burns the
    // whole retry budget.
    let script = Script::default();
    script
        .flaky_elements
        .lock()
        .unwrap()
        .insert("#slow".into(), 1_000);
    let cluster = start_cluster(script, vec![("MAX_ACTIVE_PLANS".into(), "2".into())]).await;

    let body = json!({"intent": "click '#slow'"});
    let (s1, _) = cluster.post_plan(body.clone()).await;
    let (s2, _) = cluster.post_plan(body.clone()).await;
    let (s3, rejected) = cluster.post_plan(body).await;

    assert_eq!(s1, 200);
    assert_eq!(s2, 200);
    assert_eq!(s3, 503);
    assert_eq!(rejected["error"]["kind"], "overload");
}

#[tokio::test]
async fn cancel_aborts_and_is_idempotent() {
    let script = Script::default();
    script
        .flaky_elements
        .lock()
        .unwrap()
        .insert("#stuck".into(), 1_000);
    let cluster = start_cluster(script, vec![]).await;

    let (status, body) = cluster.post_plan(json!({"intent": "click '#stuck'"})).await;
    assert_eq!(status, 200);
    let plan_id = body["planId"].as_str().unwrap().to_string();

    // An operator-side client cancels over the bus.
    let (tester, _rx) = cluster.bus_client("tester");
    tester.wait_connected().await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let cancel = Envelope::new("tester", "igor", msg::PLAN_CANCEL, json!({"planId": plan_id}));
    let reply = tester
        .request(cancel, Duration::from_secs(5))
        .await
        .expect("cancel reply");
    assert_eq!(reply.kind, msg::PLAN_CANCELLED);
    assert_eq!(reply.payload["ok"], true);

    let (final_status, _) = await_terminal(&cluster, &plan_id, Duration::from_secs(10)).await;
    assert_eq!(final_status, "failed");

    // Re-sending the cancel for the now-terminal plan is a no-op success.
    let again = Envelope::new("tester", "igor", msg::PLAN_CANCEL, json!({"planId": plan_id}));
    let reply = tester
        .request(again, Duration::from_secs(5))
        .await
        .expect("idempotent cancel reply");
    assert_eq!(reply.payload["ok"], true);
    assert_eq!(reply.payload["wasRunning"], false);
}

#[tokio::test]
async fn branching_runs_both_routes_to_completion() {
    let cluster = start_cluster(Script::default(), vec![]).await;

    // Route workers exist up front (the production path would fork them;
    // the harness hosts them in-process).
    spawn_igor(&cluster.bridge_ws, "igor-boy", Some("boy".into())).await;
    spawn_igor(&cluster.bridge_ws, "igor-girl", Some("girl".into())).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (status, body) = cluster
        .post_plan(json!({
            "intent": "go to http://localhost:8080/signup and run the full signup flow for both boy and girl users"
        }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["type"], "branching");
    assert_eq!(body["branchDescription"], "gender selection");

    let routes = body["routes"].as_array().unwrap();
    assert_eq!(routes.len(), 2);
    for route in routes {
        let assigned = route["assignedTo"].as_str().unwrap();
        let route_id = route["routeId"].as_str().unwrap();
        assert_eq!(assigned, format!("igor-{route_id}"));
    }

    let branch_id = body["parentPlanId"].as_str().unwrap().to_string();
    let end = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let branch = cluster.get(&format!("/branches/{branch_id}")).await;
        let status = branch["branch"]["status"].as_str().unwrap_or("");
        if status == "completed" {
            let branch_routes = branch["branch"]["routes"].as_object().unwrap();
            assert!(branch_routes["boy"]["success"].as_bool().unwrap());
            assert!(branch_routes["girl"]["success"].as_bool().unwrap());
            break;
        }
        assert!(status != "failed" && status != "partial", "branch ended {status}");
        assert!(tokio::time::Instant::now() < end, "branch never completed");
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
}

#[tokio::test]
async fn repeated_element_failures_create_a_repair_tool() {
    let mut script = Script::default();
    script.missing_elements.insert("#gone".into());
    let cluster = start_cluster(script, vec![("FAILURE_THRESHOLD_FOR_TOOL".into(), "2".into())]).await;

    let (status, body) = cluster.post_plan(json!({"intent": "click '#gone'"})).await;
    assert_eq!(status, 200);
    let plan_id = body["planId"].as_str().unwrap();

    // The retries alone cross the threshold; the plan itself ends failed.
    let (final_status, plan) = await_terminal(&cluster, plan_id, Duration::from_secs(20)).await;
    assert_eq!(final_status, "failed");
    assert!(plan["errors"]
        .as_array()
        .unwrap()
        .iter()
        .any(|fault| fault["kind"] == "element_not_found"));

    // Exactly one tool.create round-trips into tool.created.
    let end = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let frank = cluster.get("/frank").await;
        let created = frank["metrics"]["toolsCreated"].as_u64().unwrap_or(0);
        if created == 1 {
            let patterns = frank["failurePatterns"].as_array().unwrap();
            assert!(!patterns.is_empty());
            let pattern = &patterns[0];
            assert!(pattern["count"].as_u64().unwrap() >= 2);
            assert!(pattern["toolRequested"].as_bool().unwrap());
            let tool = pattern["toolCreated"].as_str().unwrap();
            assert!(tool.starts_with("auto_smart_selector_"), "{tool}");
            assert_eq!(frank["metrics"]["toolsRequested"], 1);
            break;
        }
        assert!(
            tokio::time::Instant::now() < end,
            "tool.created never observed"
        );
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
}

#[tokio::test]
async fn worker_crash_fails_the_plan_with_worker_crashed() {
    let script = Script::default();
    script
        .flaky_elements
        .lock()
        .unwrap()
        .insert("#forever".into(), 1_000);
    let cluster = start_cluster(script, vec![]).await;

    let (status, body) = cluster.post_plan(json!({"intent": "click '#forever'"})).await;
    assert_eq!(status, 200);
    let plan_id = body["planId"].as_str().unwrap().to_string();

    // Give the worker a moment to accept, then report its death the way a
    // supervisor would.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let (tester, _rx) = cluster.bus_client("supervisor");
    tester.wait_connected().await;
    tester
        .send(Envelope::new(
            "supervisor",
            "doctor",
            msg::IGOR_EXITED,
            json!({"id": "igor", "exitCode": 137}),
        ))
        .await
        .unwrap();

    let (final_status, plan) = await_terminal(&cluster, &plan_id, Duration::from_secs(10)).await;
    assert_eq!(final_status, "failed");
    assert!(plan["errors"]
        .as_array()
        .unwrap()
        .iter()
        .any(|fault| fault["kind"] == "worker_crashed"));
}
