// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The Frankenstein restart coordinator.
//!
//! A freshly created dynamic tool only becomes live in a *running* Frank,
//! so after every `tool.created` the Doctor bounces the process:
//!
//! 1. `shutdown` message over the bus (with a reason).
//! 2. Poll Frank's `/health` until it stops answering or reports the bus
//!    link down (≤ 5 s).
//! 3. Spawn the replacement process, fully detached.
//! 4. Poll `/health` until `busConnected` (≤ 15 s).
//! 5. Re-sync the dynamic tool inventory from `/tools`.
//!
//! At most one restart is in flight (a single atomic flag); a second
//! request while one runs is refused, not queued. Failure at any step
//! clears the flag and leaves pending tool requests untouched so they can
//! be retried after the next successful restart.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use galvan_bus::BusHandle;
use galvan_config::DoctorConfig;
use galvan_proto::{msg, Envelope, ToolRecord};

const FRANK: &str = "frank";
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const DOWN_WINDOW: Duration = Duration::from_secs(5);
const UP_WINDOW: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum RestartError {
    #[error("a restart is already in flight")]
    AlreadyRunning,
    #[error("frank never went down within {0:?}")]
    NeverWentDown(Duration),
    #[error("frank never came back within {0:?}")]
    NeverCameBack(Duration),
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("tool resync failed: {0}")]
    Resync(String),
}

pub struct RestartCoordinator {
    in_flight: AtomicBool,
    http: reqwest::Client,
}

impl Default for RestartCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RestartCoordinator {
    pub fn new() -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            http: reqwest::Client::new(),
        }
    }

    pub fn is_restarting(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run the full restart sequence. Returns Frank's post-restart tool
    /// inventory on success.
    pub async fn restart(
        &self,
        config: &DoctorConfig,
        bus: &BusHandle,
        reason: &str,
    ) -> Result<Vec<ToolRecord>, RestartError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RestartError::AlreadyRunning);
        }

        let result = self.restart_inner(config, bus, reason).await;
        self.in_flight.store(false, Ordering::Release);
        result
    }

    async fn restart_inner(
        &self,
        config: &DoctorConfig,
        bus: &BusHandle,
        reason: &str,
    ) -> Result<Vec<ToolRecord>, RestartError> {
        info!(%reason, "restarting frank");

        // 1. Ask nicely over the bus.
        let shutdown = Envelope::new(
            bus.component_id().to_string(),
            FRANK,
            msg::SHUTDOWN,
            json!({"reason": reason}),
        );
        let _ = bus.send(shutdown).await;

        // 2. Wait for it to actually go away.
        self.poll_until(DOWN_WINDOW, false, &config.frank_url)
            .await
            .map_err(|_| RestartError::NeverWentDown(DOWN_WINDOW))?;

        // 3. Spawn the replacement, detached from our stdio and lifetime.
        self.spawn_frank(config)?;

        // 4. Wait for the bus link to come back.
        self.poll_until(UP_WINDOW, true, &config.frank_url)
            .await
            .map_err(|_| RestartError::NeverCameBack(UP_WINDOW))?;

        // 5. Resync the tool inventory.
        let tools = self.fetch_tools(&config.frank_url).await?;
        info!(tools = tools.len(), "frank restarted and resynced");
        Ok(tools)
    }

    /// Poll `/health` until `busConnected == want` (unreachable counts as
    /// disconnected) or the window elapses.
    async fn poll_until(&self, window: Duration, want: bool, frank_url: &str) -> Result<(), ()> {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let connected = match self
                .http
                .get(format!("{frank_url}/health"))
                .timeout(POLL_INTERVAL)
                .send()
                .await
            {
                Ok(response) => match response.json::<serde_json::Value>().await {
                    Ok(body) => body["busConnected"].as_bool().unwrap_or(false),
                    Err(_) => false,
                },
                Err(_) => false,
            };
            if connected == want {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn spawn_frank(&self, config: &DoctorConfig) -> Result<(), RestartError> {
        let command = &config.frank_command;
        if command.is_empty() {
            return Err(RestartError::Spawn("empty frank command".into()));
        }
        let child = std::process::Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RestartError::Spawn(e.to_string()))?;
        // Deliberately not reaped: the replacement outlives this Doctor's
        // interest in it.
        info!(pid = child.id(), "spawned replacement frank");
        std::mem::forget(child);
        Ok(())
    }

    async fn fetch_tools(&self, frank_url: &str) -> Result<Vec<ToolRecord>, RestartError> {
        let body: serde_json::Value = self
            .http
            .get(format!("{frank_url}/tools"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| RestartError::Resync(e.to_string()))?
            .json()
            .await
            .map_err(|e| RestartError::Resync(e.to_string()))?;
        serde_json::from_value(body["tools"].clone())
            .map_err(|e| RestartError::Resync(e.to_string()))
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use galvan_config::Env;
    use galvan_bus::{BusClient, BusConfig};

    fn config(frank_url: &str) -> DoctorConfig {
        let env = Env::from_pairs([("FRANK_URL", frank_url)]);
        DoctorConfig::from_vars(&env)
    }

    fn dead_bus() -> BusHandle {
        let (bus, _rx) = BusClient::spawn(BusConfig::new("doctor", "0", "ws://127.0.0.1:1/ws", "t"));
        bus
    }

    /// A stand-in frank whose /health always reports the bus link up, so
    /// the down-window poll spins for its full 5 s.
    async fn stubborn_frank() -> String {
        use axum::{routing::get, Router};
        let app = Router::new().route(
            "/health",
            get(|| async { axum::Json(serde_json::json!({"busConnected": true})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn only_one_restart_in_flight() {
        let coordinator = std::sync::Arc::new(RestartCoordinator::new());
        let bus = dead_bus();
        // The stand-in never goes down, so the first restart holds the
        // flag for the whole down-window and then fails; a second request
        // meanwhile must be refused, not queued.
        let cfg = config(&stubborn_frank().await);

        let first = {
            let coordinator = coordinator.clone();
            let bus = bus.clone();
            let cfg = cfg.clone();
            tokio::spawn(async move { coordinator.restart(&cfg, &bus, "test").await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(coordinator.is_restarting());
        let second = coordinator.restart(&cfg, &bus, "test").await;
        assert!(matches!(second, Err(RestartError::AlreadyRunning)));

        let first = first.await.unwrap();
        assert!(matches!(first, Err(RestartError::NeverWentDown(_))));
        // Flag is clear again after failure.
        assert!(!coordinator.is_restarting());
    }

    #[tokio::test]
    async fn empty_spawn_command_is_an_error_not_a_panic() {
        let coordinator = RestartCoordinator::new();
        let mut cfg = config("http://127.0.0.1:1");
        cfg.frank_command = vec![];
        let err = coordinator.spawn_frank(&cfg).unwrap_err();
        assert!(matches!(err, RestartError::Spawn(_)));
    }
}
