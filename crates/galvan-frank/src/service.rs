// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Frank's bus-facing service: browser commands, tool CRUD, shutdown.
//!
//! Every request gets exactly one reply with `correlation_id = request.id`:
//!
//! | request          | reply                                |
//! |------------------|--------------------------------------|
//! | `browser.*`      | `browser.result` `{ok, result\|error}` |
//! | `tool.create`    | `tool.created` or `tool.error`       |
//! | `tool.update`    | `tool.updated` or `tool.error`       |
//! | `tool.invoke`    | `tool.result` `{ok, result\|error}`  |
//! | `tool.delete`    | `tool.result`                        |
//! | `tool.export`    | `tool.result`                        |
//! | `shutdown`       | `tool.result` `{ok}` then process exit |
//! | anything else    | `unknown_action` (once, logged once) |
//!
//! Page console/error traffic is forwarded to `broadcast` as
//! `event.console` / `event.error`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use galvan_bus::BusHandle;
use galvan_config::FrankConfig;
use galvan_proto::{msg, Envelope, Fault, FaultKind, BROADCAST};

use crate::browser::BrowserPool;
use crate::driver::{ClickTarget, DriverFactory, PageEvent};
use crate::tools::{DynamicToolRegistry, ToolCtx};

/// Uncaught-fault ceiling; crossing it ends the process.
const MAX_UNEXPECTED_FAULTS: u64 = 10;

pub struct FrankService {
    pub config: FrankConfig,
    pub bus: BusHandle,
    pub pool: Arc<BrowserPool>,
    pub registry: Arc<DynamicToolRegistry>,
    pub started_at: Instant,
    unexpected_faults: AtomicU64,
    /// Cleared by in-process tests that host several components.
    exit_on_shutdown: std::sync::atomic::AtomicBool,
}

impl FrankService {
    pub fn new(config: FrankConfig, bus: BusHandle, factory: Arc<dyn DriverFactory>) -> Self {
        let pool = BrowserPool::new(
            factory,
            config.max_browsers,
            config.browser_idle_timeout,
            config.allow_localhost,
        );
        let registry = Arc::new(DynamicToolRegistry::new());

        // Page events → bus broadcasts.
        let events = pool.subscribe_events();
        tokio::spawn(pump_page_events(events, bus.clone()));

        Self {
            config,
            bus,
            pool,
            registry,
            started_at: Instant::now(),
            unexpected_faults: AtomicU64::new(0),
            exit_on_shutdown: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Keep the process alive on `shutdown` (for tests hosting the whole
    /// cluster in one process).
    pub fn disable_process_exit(&self) {
        self.exit_on_shutdown.store(false, Ordering::Relaxed);
    }

    /// Dispatch one inbound envelope. Always replies exactly once.
    pub async fn handle(&self, env: Envelope) {
        // The arms move `env` into their handlers, so the discriminant
        // cannot borrow from it.
        let kind = env.kind.clone();
        match kind.as_str() {
            msg::BROWSER_LAUNCH
            | msg::BROWSER_NAVIGATE
            | msg::BROWSER_CLICK
            | msg::BROWSER_TYPE
            | msg::BROWSER_SELECT
            | msg::BROWSER_SCREENSHOT
            | msg::BROWSER_CLOSE => self.handle_browser(env).await,
            msg::TOOL_CREATE => self.handle_tool_create(env).await,
            msg::TOOL_UPDATE => self.handle_tool_update(env).await,
            msg::TOOL_INVOKE => self.handle_tool_invoke(env).await,
            msg::TOOL_DELETE => self.handle_tool_delete(env).await,
            msg::TOOL_EXPORT => self.handle_tool_export(env).await,
            msg::SHUTDOWN => self.handle_shutdown(env).await,
            // Transport noise, broadcasts, and late replies need no answer.
            // unknown_action in particular must never be answered with
            // unknown_action, or two confused components ping-pong forever.
            msg::COMPONENT_REGISTERED | msg::VERSION_ANNOUNCE | msg::UNDELIVERABLE
            | msg::SLOW_CONSUMER | msg::EVENT_CONSOLE | msg::EVENT_ERROR
            | msg::UNKNOWN_ACTION | msg::IGOR_SPAWN => {}
            other => {
                warn!(kind = %other, from = %env.source, "unknown action");
                let fault = Fault::new(
                    FaultKind::UnknownAction,
                    format!("no handler for {other}"),
                );
                let _ = self
                    .bus
                    .reply(&env, msg::UNKNOWN_ACTION, json!({"error": fault}))
                    .await;
            }
        }
    }

    // ── Browser surface ───────────────────────────────────────────────────────

    async fn handle_browser(&self, env: Envelope) {
        let owner = env.source.clone();
        let command = env.kind.clone();
        let timeout = env.payload["timeoutMs"]
            .as_u64()
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(30));

        let operation = self.run_browser_command(&owner, &env);
        let outcome = match tokio::time::timeout(timeout, operation).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Fault::new(
                FaultKind::BrowserTimeout,
                format!("{command} timed out after {timeout:?}"),
            )
            .with("command", command.clone())),
        };

        let payload = match outcome {
            Ok(result) => json!({"ok": true, "command": command, "result": result}),
            Err(fault) => {
                self.note_fault(&fault);
                json!({
                    "ok": false,
                    "command": command,
                    "error": attach_command(fault, &env.kind),
                })
            }
        };
        let _ = self.bus.reply(&env, msg::BROWSER_RESULT, payload).await;
    }

    async fn run_browser_command(&self, owner: &str, env: &Envelope) -> Result<Value, Fault> {
        let p = &env.payload;
        match env.kind.as_str() {
            msg::BROWSER_LAUNCH => self.pool.launch(owner).await,
            msg::BROWSER_NAVIGATE => {
                let url = require_str(p, "url")?;
                self.pool.navigate(owner, url).await
            }
            msg::BROWSER_CLICK => {
                let target = if let Some(selector) = p["selector"].as_str() {
                    ClickTarget::Selector(selector.to_string())
                } else if let Some(text) = p["text"].as_str() {
                    ClickTarget::Text(text.to_string())
                } else {
                    return Err(Fault::validation("click needs selector or text"));
                };
                let wait = p["waitForNavigation"].as_bool().unwrap_or(false);
                self.pool.click(owner, target, wait).await
            }
            msg::BROWSER_TYPE => {
                let selector = require_str(p, "selector")?;
                let text = require_str(p, "text")?;
                self.pool.type_text(owner, selector, text).await
            }
            msg::BROWSER_SELECT => {
                let selector = require_str(p, "selector")?;
                let value = require_str(p, "value")?;
                self.pool.select(owner, selector, value).await
            }
            msg::BROWSER_SCREENSHOT => {
                let image = self.pool.screenshot(owner).await?;
                Ok(json!({"image": image}))
            }
            msg::BROWSER_CLOSE => self.pool.close(owner).await,
            _ => unreachable!("dispatched as browser command"),
        }
    }

    // ── Tool surface ──────────────────────────────────────────────────────────

    async fn handle_tool_create(&self, env: Envelope) {
        let p = &env.payload;
        let outcome = (|| -> Result<_, Fault> {
            let name = require_str(p, "name")?;
            let description = p["description"].as_str().unwrap_or_default();
            let author = p["author"].as_str().unwrap_or(&env.source);
            self.registry.create(
                name,
                description,
                p["code"].clone(),
                p.get("inputSchema").cloned().unwrap_or(json!({"type": "object"})),
                author,
            )
        })();

        match outcome {
            Ok(record) => {
                info!(tool = %record.name, from = %env.source, "tool.create accepted");
                let _ = self
                    .bus
                    .reply(
                        &env,
                        msg::TOOL_CREATED,
                        json!({"toolId": record.id, "name": record.name}),
                    )
                    .await;
            }
            Err(fault) => {
                warn!(from = %env.source, "tool.create rejected: {fault}");
                let _ = self
                    .bus
                    .reply(&env, msg::TOOL_ERROR, json!({"error": fault}))
                    .await;
            }
        }
    }

    async fn handle_tool_update(&self, env: Envelope) {
        let p = &env.payload;
        let outcome = (|| -> Result<_, Fault> {
            let id = require_str(p, "toolId")?;
            let status = match p["status"].as_str() {
                Some(raw) => Some(
                    serde_json::from_value(Value::String(raw.to_string()))
                        .map_err(|_| Fault::validation(format!("unknown status: {raw}")))?,
                ),
                None => None,
            };
            self.registry.update(
                id,
                p["description"].as_str(),
                p.get("code").filter(|c| !c.is_null()).cloned(),
                p.get("inputSchema").filter(|s| !s.is_null()).cloned(),
                status,
            )
        })();

        match outcome {
            Ok(record) => {
                let _ = self
                    .bus
                    .reply(
                        &env,
                        msg::TOOL_UPDATED,
                        json!({"toolId": record.id, "name": record.name}),
                    )
                    .await;
            }
            Err(fault) => {
                let _ = self
                    .bus
                    .reply(&env, msg::TOOL_ERROR, json!({"error": fault}))
                    .await;
            }
        }
    }

    async fn handle_tool_invoke(&self, env: Envelope) {
        let id_or_name = env.payload["toolId"]
            .as_str()
            .or_else(|| env.payload["name"].as_str())
            .unwrap_or_default()
            .to_string();
        let params: Map<String, Value> = env.payload["params"]
            .as_object()
            .cloned()
            .unwrap_or_default();
        let timeout = env.payload["timeoutMs"]
            .as_u64()
            .map(Duration::from_millis)
            .unwrap_or(self.config.tool_timeout);

        let ctx = ToolCtx::new(id_or_name.clone(), Some(env.id), timeout, self.pool.clone());
        let payload = match self.registry.invoke(&id_or_name, params, ctx).await {
            Ok(result) => json!({"ok": true, "result": result}),
            Err(fault) => {
                self.note_fault(&fault);
                json!({"ok": false, "error": fault})
            }
        };
        let _ = self.bus.reply(&env, msg::TOOL_RESULT, payload).await;
    }

    async fn handle_tool_delete(&self, env: Envelope) {
        let payload = match env.payload["toolId"].as_str() {
            Some(id) => match self.registry.delete(id) {
                Ok(record) => json!({"ok": true, "name": record.name}),
                Err(fault) => json!({"ok": false, "error": fault}),
            },
            None => json!({"ok": false, "error": Fault::validation("toolId required")}),
        };
        let _ = self.bus.reply(&env, msg::TOOL_RESULT, payload).await;
    }

    async fn handle_tool_export(&self, env: Envelope) {
        let payload = match env.payload["toolId"].as_str() {
            Some(id) => match self.registry.export(id) {
                Ok(artifact) => json!({"ok": true, "artifact": artifact}),
                Err(fault) => json!({"ok": false, "error": fault}),
            },
            None => json!({"ok": false, "error": Fault::validation("toolId required")}),
        };
        let _ = self.bus.reply(&env, msg::TOOL_RESULT, payload).await;
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    async fn handle_shutdown(&self, env: Envelope) {
        let reason = env.payload["reason"].as_str().unwrap_or("unspecified");
        warn!(from = %env.source, %reason, "shutdown requested");
        let _ = self.bus.reply(&env, msg::TOOL_RESULT, json!({"ok": true})).await;
        if !self.exit_on_shutdown.load(Ordering::Relaxed) {
            return;
        }
        // Give the reply a moment to flush before the process goes away.
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            std::process::exit(0);
        });
    }

    /// Count faults that indicate a bug rather than a bad request; a
    /// process that keeps producing them is restarted by its supervisor.
    fn note_fault(&self, fault: &Fault) {
        if fault.kind != FaultKind::Unexpected {
            return;
        }
        let total = self.unexpected_faults.fetch_add(1, Ordering::Relaxed) + 1;
        error!(%total, "unexpected fault: {fault}");
        if total > MAX_UNEXPECTED_FAULTS {
            error!("unexpected-fault ceiling crossed, exiting");
            std::process::exit(1);
        }
    }
}

fn require_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str, Fault> {
    payload[key]
        .as_str()
        .ok_or_else(|| Fault::validation(format!("{key} required")).with("field", key))
}

fn attach_command(fault: Fault, command: &str) -> Fault {
    if fault.context.contains_key("command") {
        fault
    } else {
        fault.with("command", command)
    }
}

/// Forward page console/error traffic to the bus as broadcast events.
async fn pump_page_events(
    mut events: tokio::sync::broadcast::Receiver<(String, PageEvent)>,
    bus: BusHandle,
) {
    loop {
        match events.recv().await {
            Ok((owner, PageEvent::Console { line })) => {
                let env = Envelope::new(
                    bus.component_id().to_string(),
                    BROADCAST,
                    msg::EVENT_CONSOLE,
                    json!({"owner": owner, "line": line}),
                );
                let _ = bus.send(env).await;
            }
            Ok((owner, PageEvent::Error { message })) => {
                let env = Envelope::new(
                    bus.component_id().to_string(),
                    BROADCAST,
                    msg::EVENT_ERROR,
                    json!({"owner": owner, "message": message}),
                );
                let _ = bus.send(env).await;
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(lost = n, "page event pump lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}
