// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The browser pool: one session per owning component, capped and swept.
//!
//! Sessions are keyed by the bus id of the component that launched them, so
//! two Igors can never trample each other's page. `MAX_BROWSERS` bounds the
//! pool; a session idle past `BROWSER_IDLE_TIMEOUT` is evicted exactly once
//! by the periodic sweeper. The last-used timestamp is refreshed by every
//! command, which is what keeps an in-flight session out of the sweeper's
//! reach.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use galvan_proto::{validate, Fault, FaultKind};

use crate::driver::{BrowserDriver, ClickTarget, DriverFactory, PageEvent};

pub struct BrowserSession {
    pub driver: Arc<dyn BrowserDriver>,
    pub launched_at: Instant,
    pub last_used: Instant,
}

pub struct BrowserPool {
    sessions: Mutex<HashMap<String, BrowserSession>>,
    factory: Arc<dyn DriverFactory>,
    max_browsers: usize,
    idle_timeout: Duration,
    allow_localhost: bool,
    /// Fan-in of page events from every session, consumed by the service.
    events_tx: tokio::sync::broadcast::Sender<(String, PageEvent)>,
}

impl BrowserPool {
    pub fn new(
        factory: Arc<dyn DriverFactory>,
        max_browsers: usize,
        idle_timeout: Duration,
        allow_localhost: bool,
    ) -> Arc<Self> {
        let (events_tx, _) = tokio::sync::broadcast::channel(256);
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            factory,
            max_browsers,
            idle_timeout,
            allow_localhost,
            events_tx,
        })
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<(String, PageEvent)> {
        self.events_tx.subscribe()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// `browser.launch` — create and launch a session for `owner`.
    /// Relaunching an existing session is a no-op success.
    pub async fn launch(&self, owner: &str) -> Result<Value, Fault> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(owner) {
            return Ok(serde_json::json!({"alreadyLaunched": true}));
        }
        if sessions.len() >= self.max_browsers {
            return Err(Fault::new(
                FaultKind::BrowserLimitReached,
                format!("browser cap {} reached", self.max_browsers),
            ));
        }

        let driver = self.factory.create();
        driver.launch().await?;

        // Pump this session's page events into the pool-wide feed.
        let mut events = driver.events();
        let events_tx = self.events_tx.clone();
        let owner_id = owner.to_string();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let _ = events_tx.send((owner_id.clone(), event));
            }
        });

        let now = Instant::now();
        sessions.insert(
            owner.to_string(),
            BrowserSession {
                driver,
                launched_at: now,
                last_used: now,
            },
        );
        info!(%owner, total = sessions.len(), "browser launched");
        Ok(serde_json::json!({"launched": true}))
    }

    /// Fetch the owner's driver, refreshing the idle clock.
    async fn driver_for(&self, owner: &str) -> Result<Arc<dyn BrowserDriver>, Fault> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(owner) {
            Some(session) => {
                session.last_used = Instant::now();
                Ok(session.driver.clone())
            }
            None => Err(Fault::new(
                FaultKind::BrowserNotLaunched,
                format!("no browser session for {owner}"),
            )),
        }
    }

    pub async fn navigate(&self, owner: &str, url: &str) -> Result<Value, Fault> {
        validate::validate_url(url, self.allow_localhost)?;
        let driver = self.driver_for(owner).await?;
        driver.navigate(url).await
    }

    pub async fn click(
        &self,
        owner: &str,
        target: ClickTarget,
        wait_for_navigation: bool,
    ) -> Result<Value, Fault> {
        if let ClickTarget::Selector(selector) = &target {
            validate::validate_selector(selector)?;
        }
        let driver = self.driver_for(owner).await?;
        driver.click(&target, wait_for_navigation).await
    }

    pub async fn type_text(&self, owner: &str, selector: &str, text: &str) -> Result<Value, Fault> {
        validate::validate_selector(selector)?;
        validate::validate_text(text)?;
        let driver = self.driver_for(owner).await?;
        driver.type_text(selector, text).await
    }

    pub async fn select(&self, owner: &str, selector: &str, value: &str) -> Result<Value, Fault> {
        validate::validate_selector(selector)?;
        let driver = self.driver_for(owner).await?;
        driver.select(selector, value).await
    }

    pub async fn screenshot(&self, owner: &str) -> Result<String, Fault> {
        let driver = self.driver_for(owner).await?;
        driver.screenshot().await
    }

    /// Screenshot of any live session — the capability handed to dynamic
    /// tools, which have no owner of their own.
    pub async fn screenshot_any(&self) -> Result<String, Fault> {
        let driver = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .next()
                .map(|s| s.driver.clone())
                .ok_or_else(|| {
                    Fault::new(FaultKind::BrowserNotLaunched, "no live browser session")
                })?
        };
        driver.screenshot().await
    }

    pub async fn close(&self, owner: &str) -> Result<Value, Fault> {
        let session = self.sessions.lock().await.remove(owner);
        match session {
            Some(session) => {
                session.driver.close().await?;
                info!(%owner, "browser closed");
                Ok(serde_json::json!({"closed": true}))
            }
            None => Err(Fault::new(
                FaultKind::BrowserNotLaunched,
                format!("no browser session for {owner}"),
            )),
        }
    }

    /// Evict sessions idle past the timeout. Each eviction happens exactly
    /// once: the entry is removed before its driver is closed.
    pub async fn evict_idle(&self) -> Vec<String> {
        let mut evicted = Vec::new();
        let victims: Vec<(String, Arc<dyn BrowserDriver>)> = {
            let mut sessions = self.sessions.lock().await;
            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.last_used.elapsed() > self.idle_timeout)
                .map(|(owner, _)| owner.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|owner| sessions.remove(&owner).map(|s| (owner, s.driver)))
                .collect()
        };
        for (owner, driver) in victims {
            warn!(%owner, "evicting idle browser");
            let _ = driver.close().await;
            evicted.push(owner);
        }
        evicted
    }
}

/// Periodic idle eviction, at a fraction of the timeout so an expiry is
/// noticed promptly.
pub async fn idle_sweeper(pool: Arc<BrowserPool>) {
    let period = (pool.idle_timeout / 4).max(Duration::from_millis(250));
    let mut tick = tokio::time::interval(period);
    loop {
        tick.tick().await;
        pool.evict_idle().await;
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ScriptedFactory;

    fn pool(max: usize, idle: Duration) -> Arc<BrowserPool> {
        BrowserPool::new(Arc::new(ScriptedFactory::default()), max, idle, true)
    }

    #[tokio::test]
    async fn cap_is_enforced() {
        let pool = pool(2, Duration::from_secs(60));
        pool.launch("igor").await.unwrap();
        pool.launch("igor-boy").await.unwrap();
        let err = pool.launch("igor-girl").await.unwrap_err();
        assert_eq!(err.kind, FaultKind::BrowserLimitReached);
    }

    #[tokio::test]
    async fn relaunch_is_idempotent() {
        let pool = pool(1, Duration::from_secs(60));
        pool.launch("igor").await.unwrap();
        let again = pool.launch("igor").await.unwrap();
        assert_eq!(again["alreadyLaunched"], true);
    }

    #[tokio::test]
    async fn commands_need_a_session() {
        let pool = pool(2, Duration::from_secs(60));
        let err = pool.navigate("igor", "http://x.test").await.unwrap_err();
        assert_eq!(err.kind, FaultKind::BrowserNotLaunched);
    }

    #[tokio::test]
    async fn url_policy_applies_before_the_driver() {
        let pool = BrowserPool::new(
            Arc::new(ScriptedFactory::default()),
            2,
            Duration::from_secs(60),
            false,
        );
        pool.launch("igor").await.unwrap();
        let err = pool
            .navigate("igor", "http://localhost:3000")
            .await
            .unwrap_err();
        assert_eq!(err.kind, FaultKind::ValidationFailed);
    }

    #[tokio::test]
    async fn idle_session_is_evicted_exactly_once() {
        let pool = pool(2, Duration::from_millis(20));
        pool.launch("igor").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(pool.evict_idle().await, vec!["igor".to_string()]);
        assert!(pool.evict_idle().await.is_empty());
        assert_eq!(pool.session_count().await, 0);
    }

    #[tokio::test]
    async fn active_session_survives_the_sweeper() {
        let pool = pool(2, Duration::from_millis(80));
        pool.launch("igor").await.unwrap();
        // Keep the session warm past one timeout's worth of wall clock.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            pool.navigate("igor", "http://keepalive.test").await.unwrap();
        }
        assert!(pool.evict_idle().await.is_empty());
    }

    #[tokio::test]
    async fn close_removes_the_session() {
        let pool = pool(2, Duration::from_secs(60));
        pool.launch("igor").await.unwrap();
        pool.close("igor").await.unwrap();
        assert_eq!(pool.session_count().await, 0);
        assert!(pool.close("igor").await.is_err());
    }
}
