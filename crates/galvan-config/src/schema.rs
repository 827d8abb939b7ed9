// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-component configuration structs and their environment bindings.
//!
//! Defaults are chosen so a bare `galvan bridge && galvan doctor && ...` on
//! one machine forms a working cluster with no variables set at all (the
//! shared token defaults to a well-known dev value; production deployments
//! must override `BRIDGE_AUTH_TOKEN`).

use std::path::PathBuf;
use std::time::Duration;

use crate::env::Env;
use crate::logging::LogFormat;

/// Development fallback for the shared bus token.
pub const DEV_AUTH_TOKEN: &str = "galvan-dev-token";

/// Configuration every component shares: where the Bridge is, how to
/// authenticate, how to log.
#[derive(Debug, Clone)]
pub struct CommonConfig {
    /// WebSocket endpoint of the Bridge, e.g. `ws://127.0.0.1:4670/ws`.
    pub bridge_url: String,
    pub auth_token: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl CommonConfig {
    pub fn from_env() -> Self {
        Self::from_vars(&Env::from_process())
    }

    pub fn from_vars(env: &Env) -> Self {
        Self {
            bridge_url: env.string("BRIDGE_URL", "ws://127.0.0.1:4670/ws"),
            auth_token: env.string("BRIDGE_AUTH_TOKEN", DEV_AUTH_TOKEN),
            log_level: env.string("LOG_LEVEL", "info"),
            log_format: match env.string("LOG_FORMAT", "pretty").as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        }
    }

    /// The HTTP origin of the Bridge, derived from the ws url.
    /// `ws://host:port/ws` → `http://host:port`.
    pub fn bridge_http_url(&self) -> String {
        let stripped = self
            .bridge_url
            .trim_end_matches("/ws")
            .replacen("wss://", "https://", 1)
            .replacen("ws://", "http://", 1);
        stripped
    }

    /// Bind port for the Bridge itself, parsed out of `bridge_url`.
    pub fn bridge_port(&self) -> u16 {
        self.bridge_url
            .rsplit_once(':')
            .and_then(|(_, rest)| rest.split('/').next())
            .and_then(|port| port.parse().ok())
            .unwrap_or(4670)
    }
}

/// Reconnect policy for bus clients.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// 0 = retry forever.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectConfig {
    pub fn from_vars(env: &Env) -> Self {
        Self {
            max_attempts: env.u64("BRIDGE_RECONNECT_MAX_ATTEMPTS", 0) as u32,
            initial_delay: Duration::from_millis(env.u64("BRIDGE_RECONNECT_INITIAL_DELAY_MS", 500)),
            max_delay: Duration::from_millis(env.u64("BRIDGE_RECONNECT_MAX_DELAY_MS", 30_000)),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from_vars(&Env::from_pairs::<[(&str, &str); 0], _, _>([]))
    }
}

/// Bridge-specific knobs.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub common: CommonConfig,
    /// In-memory event-log cap; spillover discards oldest-first.
    pub event_log_cap: usize,
    /// Outbound queue depth per connection before the consumer counts as slow.
    pub outbound_queue_depth: usize,
    pub screenshots_dir: PathBuf,
    /// On-disk JSONL mirror of the event log; explicitly-empty disables it.
    pub event_log_path: Option<PathBuf>,
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_vars(&Env::from_process())
    }

    pub fn from_vars(env: &Env) -> Self {
        Self {
            common: CommonConfig::from_vars(env),
            event_log_cap: env.usize("BRIDGE_EVENT_LOG_CAP", 10_000),
            outbound_queue_depth: env.usize("BRIDGE_OUTBOUND_QUEUE_DEPTH", 256),
            screenshots_dir: PathBuf::from(env.string("SCREENSHOTS_DIR", "./screenshots")),
            event_log_path: match env.raw("BRIDGE_EVENT_LOG_PATH") {
                Some("") => None,
                Some(path) => Some(PathBuf::from(path)),
                None => Some(PathBuf::from("./galvan-events.jsonl")),
            },
        }
    }
}

/// Doctor-specific knobs.
#[derive(Debug, Clone)]
pub struct DoctorConfig {
    pub common: CommonConfig,
    pub reconnect: ReconnectConfig,
    pub port: u16,
    pub max_active_plans: usize,
    pub plan_ttl: Duration,
    pub plan_cleanup_interval: Duration,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window: Duration,
    /// Comma-separated origin allowlist for mutating HTTP routes.
    pub allowed_origins: Vec<String>,
    pub experience_dir: PathBuf,
    pub tool_creation_enabled: bool,
    pub failure_threshold_for_tool: u64,
    /// HTTP origin of Frankenstein, for restart health polling and tool sync.
    pub frank_url: String,
    /// Command used to spawn a replacement Frankenstein process.
    pub frank_command: Vec<String>,
    /// Command used to spawn route-specialized workers (`--route <id>` is
    /// appended per spawn).
    pub igor_command: Vec<String>,
    /// Url policy for compiled plans.
    pub allow_localhost: bool,
}

impl DoctorConfig {
    pub fn from_env() -> Self {
        Self::from_vars(&Env::from_process())
    }

    pub fn from_vars(env: &Env) -> Self {
        let frank_port = env.u16("FRANKENSTEIN_PORT", 4671);
        Self {
            common: CommonConfig::from_vars(env),
            reconnect: ReconnectConfig::from_vars(env),
            port: env.u16("DOCTOR_PORT", 4672),
            max_active_plans: env.usize("MAX_ACTIVE_PLANS", 10),
            plan_ttl: Duration::from_millis(env.u64("PLAN_TTL_MS", 30 * 60 * 1_000)),
            plan_cleanup_interval: Duration::from_millis(
                env.u64("PLAN_CLEANUP_INTERVAL_MS", 60_000),
            ),
            rate_limit_max_requests: env.u64("RATE_LIMIT_MAX_REQUESTS", 60) as u32,
            rate_limit_window: Duration::from_millis(env.u64("RATE_LIMIT_WINDOW_MS", 60_000)),
            allowed_origins: env
                .string("ALLOWED_ORIGINS", "")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            experience_dir: PathBuf::from(env.string("EXPERIENCE_DIR", "./experience")),
            tool_creation_enabled: env.bool("FRANK_TOOL_CREATION_ENABLED", true),
            failure_threshold_for_tool: env.u64("FAILURE_THRESHOLD_FOR_TOOL", 2),
            frank_url: env.string("FRANK_URL", &format!("http://127.0.0.1:{frank_port}")),
            frank_command: spawn_command(env, "FRANK_SPAWN_COMMAND", "galvan frank"),
            igor_command: spawn_command(env, "IGOR_SPAWN_COMMAND", "galvan igor"),
            allow_localhost: env.bool("ALLOW_LOCALHOST", true),
        }
    }
}

/// Frankenstein-specific knobs.
#[derive(Debug, Clone)]
pub struct FrankConfig {
    pub common: CommonConfig,
    pub reconnect: ReconnectConfig,
    pub port: u16,
    pub max_browsers: usize,
    pub max_pages: usize,
    pub browser_idle_timeout: Duration,
    pub screenshots_dir: PathBuf,
    pub allow_localhost: bool,
    /// Hard wall-clock cap for one dynamic tool invocation.
    pub tool_timeout: Duration,
}

impl FrankConfig {
    pub fn from_env() -> Self {
        Self::from_vars(&Env::from_process())
    }

    pub fn from_vars(env: &Env) -> Self {
        Self {
            common: CommonConfig::from_vars(env),
            reconnect: ReconnectConfig::from_vars(env),
            port: env.u16("FRANKENSTEIN_PORT", 4671),
            max_browsers: env.usize("MAX_BROWSERS", 4),
            max_pages: env.usize("MAX_PAGES", 8),
            browser_idle_timeout: Duration::from_millis(env.u64("BROWSER_IDLE_TIMEOUT", 300_000)),
            screenshots_dir: PathBuf::from(env.string("SCREENSHOTS_DIR", "./screenshots")),
            allow_localhost: env.bool("ALLOW_LOCALHOST", true),
            tool_timeout: Duration::from_millis(env.u64("TOOL_TIMEOUT_MS", 30_000)),
        }
    }
}

/// Process-spawn command from the environment. An explicitly-empty value
/// disables spawning (used by in-process test harnesses); unset falls back
/// to the default.
fn spawn_command(env: &Env, key: &str, default: &str) -> Vec<String> {
    env.raw(key)
        .unwrap_or(default)
        .split_whitespace()
        .map(String::from)
        .collect()
}

/// Igor-specific knobs.
#[derive(Debug, Clone)]
pub struct IgorConfig {
    pub common: CommonConfig,
    pub reconnect: ReconnectConfig,
    /// Route binding; `None` is the default worker.
    pub route: Option<String>,
}

impl IgorConfig {
    pub fn from_env(route: Option<String>) -> Self {
        Self::from_vars(&Env::from_process(), route)
    }

    pub fn from_vars(env: &Env, route: Option<String>) -> Self {
        Self {
            common: CommonConfig::from_vars(env),
            reconnect: ReconnectConfig::from_vars(env),
            route,
        }
    }

    /// `igor` for the default worker, `igor-<route>` otherwise.
    pub fn component_id(&self) -> String {
        match &self.route {
            Some(route) => format!("igor-{route}"),
            None => "igor".to_string(),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
