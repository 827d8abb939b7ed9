// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Routing core: the connection table and the delivery rules.
//!
//! One [`Router`] per Bridge process. Each accepted connection gets a
//! bounded outbound queue drained by a single writer task, which preserves
//! per-sender order towards any given target. Delivery is at-most-once:
//!
//! 1. Specific target connected → queue once. Queue full → the consumer is
//!    slow: drop it and tell the sender with `slow_consumer`.
//! 2. Specific target absent → `undeliverable` back at the sender with
//!    `unknown_target` (never seen) or `target_offline` (seen, gone).
//! 3. `broadcast` → every connected component except the sender.
//!
//! Every routed message appends its header to the bounded event log.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use galvan_proto::{msg, Envelope, LIVENESS_WINDOW_SECS};

use crate::event_log::{EventLog, EventRecord};

/// Why a registration attempt was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterReject {
    BadToken,
    /// The id is connected and its heartbeat is recent; the incumbent wins.
    DuplicateLive,
}

/// One registered component.
pub struct Connection {
    pub id: String,
    pub version: String,
    pub out_tx: mpsc::Sender<Envelope>,
    pub last_heartbeat: Instant,
    pub registered_at: DateTime<Utc>,
}

/// Liveness view of one component for `/health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub id: String,
    pub version: String,
    pub live: bool,
    pub last_heartbeat_ms: u64,
    pub registered_at: DateTime<Utc>,
}

pub struct Router {
    connections: DashMap<String, Connection>,
    /// Ids that registered at least once this process lifetime; used to
    /// tell `unknown_target` apart from `target_offline`.
    seen: Mutex<HashSet<String>>,
    log: Mutex<EventLog>,
    /// Mirror of every appended record towards the on-disk spill writer.
    spill: Option<mpsc::UnboundedSender<EventRecord>>,
}

impl Router {
    pub fn new(event_log_cap: usize) -> Self {
        Self {
            connections: DashMap::new(),
            seen: Mutex::new(HashSet::new()),
            log: Mutex::new(EventLog::new(event_log_cap)),
            spill: None,
        }
    }

    pub fn with_spill(mut self, spill: mpsc::UnboundedSender<EventRecord>) -> Self {
        self.spill = Some(spill);
        self
    }

    /// Admit a connection. The duplicate check treats a stale incumbent
    /// (no heartbeat inside the liveness window) as already gone.
    pub fn register(
        &self,
        id: &str,
        version: &str,
        out_tx: mpsc::Sender<Envelope>,
    ) -> Result<(), RegisterReject> {
        if let Some(existing) = self.connections.get(id) {
            if existing.last_heartbeat.elapsed().as_secs() < LIVENESS_WINDOW_SECS {
                return Err(RegisterReject::DuplicateLive);
            }
            drop(existing);
            info!(%id, "evicting stale incumbent connection");
            self.connections.remove(id);
        }

        self.connections.insert(
            id.to_string(),
            Connection {
                id: id.to_string(),
                version: version.to_string(),
                out_tx,
                last_heartbeat: Instant::now(),
                registered_at: Utc::now(),
            },
        );
        self.seen
            .lock()
            .expect("seen set poisoned")
            .insert(id.to_string());
        Ok(())
    }

    pub fn disconnect(&self, id: &str) {
        if self.connections.remove(id).is_some() {
            info!(%id, "component disconnected");
        }
    }

    /// Disconnect only if `out_tx` is the registered connection's channel.
    /// A stale socket task exiting after its id was re-registered must not
    /// tear down the incumbent's replacement.
    pub fn disconnect_if_current(&self, id: &str, out_tx: &mpsc::Sender<Envelope>) {
        let is_current = self
            .connections
            .get(id)
            .map(|conn| conn.out_tx.same_channel(out_tx))
            .unwrap_or(false);
        if is_current {
            self.disconnect(id);
        }
    }

    pub fn heartbeat(&self, id: &str) {
        if let Some(mut conn) = self.connections.get_mut(id) {
            conn.last_heartbeat = Instant::now();
        }
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    /// Drop every connection whose heartbeat has fallen outside the window.
    /// Returns the ids that were reaped.
    pub fn sweep_stale(&self) -> Vec<String> {
        let stale: Vec<String> = self
            .connections
            .iter()
            .filter(|c| c.last_heartbeat.elapsed().as_secs() > LIVENESS_WINDOW_SECS)
            .map(|c| c.id.clone())
            .collect();
        for id in &stale {
            warn!(%id, "heartbeat expired, dropping connection");
            self.connections.remove(id);
        }
        stale
    }

    /// Route one message from `sender`. Delivery failures come back at the
    /// sender as bus events; the Bridge itself never retries.
    pub fn route(&self, env: Envelope) {
        self.append_log(&env);

        if env.is_broadcast() {
            self.broadcast(env);
            return;
        }

        let delivery = match self.connections.get(&env.target) {
            Some(conn) => match conn.out_tx.try_send(env.clone()) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let slow = env.target.clone();
                    drop(conn);
                    warn!(target = %slow, "outbound queue full, dropping slow consumer");
                    self.connections.remove(&slow);
                    Some((msg::SLOW_CONSUMER, "slow_consumer"))
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    let gone = env.target.clone();
                    drop(conn);
                    self.connections.remove(&gone);
                    Some((msg::UNDELIVERABLE, "target_offline"))
                }
            },
            None => {
                let known = self
                    .seen
                    .lock()
                    .expect("seen set poisoned")
                    .contains(&env.target);
                if known {
                    Some((msg::UNDELIVERABLE, "target_offline"))
                } else {
                    Some((msg::UNDELIVERABLE, "unknown_target"))
                }
            }
        };

        if let Some((kind, reason)) = delivery {
            self.notify_sender(&env, kind, reason);
        }
    }

    fn broadcast(&self, env: Envelope) {
        let mut slow = Vec::new();
        for conn in self.connections.iter() {
            if conn.id == env.source {
                continue;
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = conn.out_tx.try_send(env.clone()) {
                slow.push(conn.id.clone());
            }
        }
        for id in slow {
            warn!(target = %id, "broadcast queue full, dropping slow consumer");
            self.connections.remove(&id);
            self.notify_sender(&env, msg::SLOW_CONSUMER, "slow_consumer");
        }
    }

    /// Deliver a transport event about `original` back to its sender.
    fn notify_sender(&self, original: &Envelope, kind: &str, reason: &str) {
        debug!(
            target = %original.target,
            %reason,
            "delivery failed for {} from {}", original.kind, original.source
        );
        let Some(sender) = self.connections.get(&original.source) else {
            return;
        };
        let notice = Envelope::new(
            "bridge",
            original.source.clone(),
            kind,
            json!({
                "originalId": original.id,
                "originalType": original.kind,
                "target": original.target,
                "reason": reason,
            }),
        )
        .with_correlation(original.id);
        // If the sender itself is backed up there is nobody left to tell.
        let _ = sender.out_tx.try_send(notice);
    }

    fn append_log(&self, env: &Envelope) {
        let record = EventRecord::from(env);
        if let Some(spill) = &self.spill {
            let _ = spill.send(record.clone());
        }
        self.log.lock().expect("event log poisoned").push(record);
    }

    pub fn recent_events(&self, limit: usize) -> Vec<EventRecord> {
        self.log.lock().expect("event log poisoned").snapshot(limit)
    }

    pub fn event_count(&self) -> usize {
        self.log.lock().expect("event log poisoned").len()
    }

    pub fn health(&self) -> Vec<ComponentHealth> {
        let mut out: Vec<ComponentHealth> = self
            .connections
            .iter()
            .map(|c| ComponentHealth {
                id: c.id.clone(),
                version: c.version.clone(),
                live: c.last_heartbeat.elapsed().as_secs() <= LIVENESS_WINDOW_SECS,
                last_heartbeat_ms: c.last_heartbeat.elapsed().as_millis() as u64,
                registered_at: c.registered_at,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Deliver a Bridge-originated envelope to one component.
    pub fn deliver_from_bridge(&self, env: Envelope) {
        if let Some(conn) = self.connections.get(&env.target) {
            let _ = conn.out_tx.try_send(env);
        }
    }

    /// Broadcast a Bridge-originated envelope to everyone except `except`.
    pub fn announce(&self, env: Envelope, except: &str) {
        for conn in self.connections.iter() {
            if conn.id != except {
                let _ = conn.out_tx.try_send(env.clone());
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel(depth: usize) -> (mpsc::Sender<Envelope>, mpsc::Receiver<Envelope>) {
        mpsc::channel(depth)
    }

    fn router() -> Router {
        Router::new(100)
    }

    #[test]
    fn point_to_point_delivers_once() {
        let r = router();
        let (a_tx, _a_rx) = channel(8);
        let (b_tx, mut b_rx) = channel(8);
        r.register("a", "1", a_tx).unwrap();
        r.register("b", "1", b_tx).unwrap();

        r.route(Envelope::new("a", "b", "x", json!({})));
        assert_eq!(b_rx.try_recv().unwrap().kind, "x");
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn unknown_target_notifies_sender() {
        let r = router();
        let (a_tx, mut a_rx) = channel(8);
        r.register("a", "1", a_tx).unwrap();

        let env = Envelope::new("a", "ghost", "x", json!({}));
        let original_id = env.id;
        r.route(env);

        let notice = a_rx.try_recv().unwrap();
        assert_eq!(notice.kind, msg::UNDELIVERABLE);
        assert_eq!(notice.payload["reason"], "unknown_target");
        assert_eq!(notice.correlation_id, Some(original_id));
    }

    #[test]
    fn offline_target_is_distinguished_from_unknown() {
        let r = router();
        let (a_tx, mut a_rx) = channel(8);
        let (b_tx, _b_rx) = channel(8);
        r.register("a", "1", a_tx).unwrap();
        r.register("b", "1", b_tx).unwrap();
        r.disconnect("b");

        r.route(Envelope::new("a", "b", "x", json!({})));
        let notice = a_rx.try_recv().unwrap();
        assert_eq!(notice.payload["reason"], "target_offline");
    }

    #[test]
    fn broadcast_skips_the_sender() {
        let r = router();
        let (a_tx, mut a_rx) = channel(8);
        let (b_tx, mut b_rx) = channel(8);
        let (c_tx, mut c_rx) = channel(8);
        r.register("a", "1", a_tx).unwrap();
        r.register("b", "1", b_tx).unwrap();
        r.register("c", "1", c_tx).unwrap();

        r.route(Envelope::new("a", galvan_proto::BROADCAST, "ev", json!({})));
        assert!(a_rx.try_recv().is_err());
        assert_eq!(b_rx.try_recv().unwrap().kind, "ev");
        assert_eq!(c_rx.try_recv().unwrap().kind, "ev");
    }

    #[test]
    fn slow_consumer_is_dropped_and_sender_told() {
        let r = router();
        let (a_tx, mut a_rx) = channel(8);
        let (b_tx, _b_rx_keepalive) = channel(1);
        r.register("a", "1", a_tx).unwrap();
        r.register("b", "1", b_tx).unwrap();

        // First fill b's queue, then overflow it.
        r.route(Envelope::new("a", "b", "one", json!({})));
        r.route(Envelope::new("a", "b", "two", json!({})));

        assert!(!r.is_connected("b"));
        let notice = a_rx.try_recv().unwrap();
        assert_eq!(notice.kind, msg::SLOW_CONSUMER);
    }

    #[test]
    fn duplicate_live_registration_is_rejected() {
        let r = router();
        let (a_tx, _a_rx) = channel(8);
        let (dup_tx, _dup_rx) = channel(8);
        r.register("a", "1", a_tx).unwrap();
        assert_eq!(
            r.register("a", "2", dup_tx).unwrap_err(),
            RegisterReject::DuplicateLive
        );
    }

    #[test]
    fn stale_task_cannot_disconnect_the_replacement() {
        let r = router();
        let (old_tx, _old_rx) = channel(8);
        r.register("a", "1", old_tx.clone()).unwrap();

        // The id gets re-registered (e.g. stale incumbent evicted).
        r.disconnect("a");
        let (new_tx, mut new_rx) = channel(8);
        r.register("a", "2", new_tx).unwrap();

        // The old task's teardown must be a no-op now.
        r.disconnect_if_current("a", &old_tx);
        assert!(r.is_connected("a"));

        let (b_tx, _b_rx) = channel(8);
        r.register("b", "1", b_tx).unwrap();
        r.route(Envelope::new("b", "a", "still.routed", json!({})));
        assert_eq!(new_rx.try_recv().unwrap().kind, "still.routed");
    }

    #[test]
    fn every_routed_message_lands_in_the_log() {
        let r = router();
        let (a_tx, _a_rx) = channel(8);
        r.register("a", "1", a_tx).unwrap();

        r.route(Envelope::new("a", "ghost", "x", json!({})));
        r.route(Envelope::new("a", galvan_proto::BROADCAST, "y", json!({})));
        assert_eq!(r.event_count(), 2);
    }

    #[test]
    fn health_reports_live_components() {
        let r = router();
        let (a_tx, _a_rx) = channel(8);
        r.register("a", "1.2.3", a_tx).unwrap();
        let health = r.health();
        assert_eq!(health.len(), 1);
        assert!(health[0].live);
        assert_eq!(health[0].version, "1.2.3");
    }
}
