// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The browser driver seam.
//!
//! Galvan deliberately does not reimplement browser automation; everything
//! above this trait only knows `launch / navigate / click / type / select /
//! screenshot / close`. Production deployments plug a real driver into
//! [`DriverFactory`]; the [`ScriptedDriver`] here is an in-memory stand-in
//! with programmable failures, used by tests and local dry runs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use galvan_proto::{Fault, FaultKind};

/// A click is addressed either by CSS selector or by visible text.
#[derive(Debug, Clone)]
pub enum ClickTarget {
    Selector(String),
    Text(String),
}

impl ClickTarget {
    pub fn as_str(&self) -> &str {
        match self {
            ClickTarget::Selector(s) | ClickTarget::Text(s) => s,
        }
    }
}

/// Console/error traffic surfaced by a page.
#[derive(Debug, Clone)]
pub enum PageEvent {
    Console { line: String },
    Error { message: String },
}

/// One live browser, as the rest of Frank sees it.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self) -> Result<(), Fault>;
    async fn navigate(&self, url: &str) -> Result<Value, Fault>;
    async fn click(&self, target: &ClickTarget, wait_for_navigation: bool) -> Result<Value, Fault>;
    async fn type_text(&self, selector: &str, text: &str) -> Result<Value, Fault>;
    async fn select(&self, selector: &str, value: &str) -> Result<Value, Fault>;
    /// Base64 PNG of the current page.
    async fn screenshot(&self) -> Result<String, Fault>;
    async fn close(&self) -> Result<(), Fault>;
    /// Live console/error feed for this browser.
    fn events(&self) -> broadcast::Receiver<PageEvent>;
}

/// Creates one driver per browser session.
pub trait DriverFactory: Send + Sync {
    fn create(&self) -> Arc<dyn BrowserDriver>;
}

// ── Scripted driver ───────────────────────────────────────────────────────────

/// Failure script shared by every [`ScriptedDriver`] a factory creates.
#[derive(Default)]
pub struct Script {
    /// Selectors/texts that fail with `element_not_found`.
    pub missing_elements: HashSet<String>,
    /// Url substrings that fail navigation.
    pub failing_urls: HashSet<String>,
    /// Selectors that fail exactly N times, then succeed (decremented
    /// per attempt; models flaky elements a repair tool can fix).
    pub flaky_elements: Mutex<std::collections::HashMap<String, u32>>,
}

impl Script {
    fn element_missing(&self, target: &str) -> bool {
        if self.missing_elements.contains(target) {
            return true;
        }
        let mut flaky = self.flaky_elements.lock().expect("script poisoned");
        if let Some(left) = flaky.get_mut(target) {
            if *left > 0 {
                *left -= 1;
                return true;
            }
        }
        false
    }
}

/// 1×1 transparent PNG, the screenshot every scripted page produces.
const BLANK_PNG_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8z8BQDwAEhQGAhKmMIQAAAABJRU5ErkJggg==";

/// In-memory driver: every operation succeeds unless the script says
/// otherwise, and each page action is recorded for assertions.
pub struct ScriptedDriver {
    script: Arc<Script>,
    launched: Mutex<bool>,
    current_url: Mutex<Option<String>>,
    pub actions: Mutex<Vec<String>>,
    events_tx: broadcast::Sender<PageEvent>,
}

impl ScriptedDriver {
    pub fn new(script: Arc<Script>) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            script,
            launched: Mutex::new(false),
            current_url: Mutex::new(None),
            actions: Mutex::new(Vec::new()),
            events_tx,
        }
    }

    fn record(&self, action: impl Into<String>) {
        self.actions.lock().expect("actions poisoned").push(action.into());
    }

    fn ensure_launched(&self) -> Result<(), Fault> {
        if *self.launched.lock().expect("launched poisoned") {
            Ok(())
        } else {
            Err(Fault::new(
                FaultKind::BrowserNotLaunched,
                "browser has not been launched",
            ))
        }
    }
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    async fn launch(&self) -> Result<(), Fault> {
        *self.launched.lock().expect("launched poisoned") = true;
        self.record("launch");
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<Value, Fault> {
        self.ensure_launched()?;
        if self
            .script
            .failing_urls
            .iter()
            .any(|fragment| url.contains(fragment))
        {
            return Err(Fault::new(
                FaultKind::NavigationFailed,
                format!("navigation failed: {url}"),
            )
            .with("url", url));
        }
        *self.current_url.lock().expect("url poisoned") = Some(url.to_string());
        self.record(format!("navigate {url}"));
        let _ = self.events_tx.send(PageEvent::Console {
            line: format!("loaded {url}"),
        });
        Ok(json!({"url": url}))
    }

    async fn click(&self, target: &ClickTarget, wait_for_navigation: bool) -> Result<Value, Fault> {
        self.ensure_launched()?;
        let key = target.as_str();
        if self.script.element_missing(key) {
            return Err(Fault::new(
                FaultKind::ElementNotFound,
                format!("element not found: '{key}'"),
            )
            .with("selector", key)
            .with("command", "click"));
        }
        self.record(format!("click {key}"));
        Ok(json!({"clicked": key, "navigated": wait_for_navigation}))
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<Value, Fault> {
        self.ensure_launched()?;
        if self.script.element_missing(selector) {
            return Err(Fault::new(
                FaultKind::ElementNotFound,
                format!("element not found: '{selector}'"),
            )
            .with("selector", selector)
            .with("command", "type"));
        }
        self.record(format!("type {selector}={text}"));
        Ok(json!({"typed": text.len()}))
    }

    async fn select(&self, selector: &str, value: &str) -> Result<Value, Fault> {
        self.ensure_launched()?;
        if self.script.element_missing(selector) {
            return Err(Fault::new(
                FaultKind::ElementNotFound,
                format!("element not found: '{selector}'"),
            )
            .with("selector", selector)
            .with("command", "select"));
        }
        self.record(format!("select {selector}={value}"));
        Ok(json!({"selected": value}))
    }

    async fn screenshot(&self) -> Result<String, Fault> {
        self.ensure_launched()?;
        self.record("screenshot");
        Ok(BLANK_PNG_BASE64.to_string())
    }

    async fn close(&self) -> Result<(), Fault> {
        *self.launched.lock().expect("launched poisoned") = false;
        self.record("close");
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<PageEvent> {
        self.events_tx.subscribe()
    }
}

/// Factory handing out [`ScriptedDriver`]s that share one [`Script`].
#[derive(Default)]
pub struct ScriptedFactory {
    pub script: Arc<Script>,
}

impl ScriptedFactory {
    pub fn with_script(script: Script) -> Self {
        Self {
            script: Arc::new(script),
        }
    }
}

impl DriverFactory for ScriptedFactory {
    fn create(&self) -> Arc<dyn BrowserDriver> {
        Arc::new(ScriptedDriver::new(self.script.clone()))
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
