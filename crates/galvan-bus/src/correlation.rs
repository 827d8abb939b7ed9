// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Request/reply correlation: a keyed map of single-fire reply slots.
//!
//! Each outgoing request registers its envelope id here with a deadline.
//! The first reply carrying that id as its `correlation_id` fires the slot;
//! anything after that — or anything arriving for an id the sweeper already
//! purged — is discarded and counted, never delivered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::oneshot;
use uuid::Uuid;

use galvan_proto::Envelope;

struct Slot {
    tx: oneshot::Sender<Envelope>,
    deadline: Instant,
}

/// Keyed map from request id to its single-fire reply slot.
#[derive(Default)]
pub struct CorrelationMap {
    slots: Mutex<HashMap<Uuid, Slot>>,
    discarded: AtomicU64,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot for `request_id`; the returned receiver fires at most
    /// once.
    pub fn register(&self, request_id: Uuid, deadline: Instant) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.slots
            .lock()
            .expect("correlation map poisoned")
            .insert(request_id, Slot { tx, deadline });
        rx
    }

    /// Route a reply into its slot. Returns `false` (and counts a discard)
    /// when no live slot exists — a late or duplicate reply.
    pub fn complete(&self, correlation_id: Uuid, reply: Envelope) -> bool {
        let slot = self
            .slots
            .lock()
            .expect("correlation map poisoned")
            .remove(&correlation_id);
        match slot {
            Some(slot) => {
                // A dropped receiver (request future cancelled) also counts
                // as a discard.
                if slot.tx.send(reply).is_err() {
                    self.discarded.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                true
            }
            None => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Drop the slot for a request whose caller gave up.
    pub fn purge(&self, request_id: Uuid) {
        self.slots
            .lock()
            .expect("correlation map poisoned")
            .remove(&request_id);
    }

    /// Remove every slot past its deadline; returns how many were swept.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut slots = self.slots.lock().expect("correlation map poisoned");
        let before = slots.len();
        slots.retain(|_, slot| slot.deadline > now);
        before - slots.len()
    }

    pub fn pending(&self) -> usize {
        self.slots.lock().expect("correlation map poisoned").len()
    }

    /// Total late/duplicate replies seen so far.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn reply_to(id: Uuid) -> Envelope {
        Envelope::new("frank", "doctor", "tool.result", json!({})).with_correlation(id)
    }

    #[tokio::test]
    async fn reply_fires_the_slot_exactly_once() {
        let map = CorrelationMap::new();
        let id = Uuid::new_v4();
        let rx = map.register(id, Instant::now() + Duration::from_secs(5));

        assert!(map.complete(id, reply_to(id)));
        assert!(rx.await.is_ok());

        // Second reply with the same correlation id is discarded.
        assert!(!map.complete(id, reply_to(id)));
        assert_eq!(map.discarded(), 1);
    }

    #[tokio::test]
    async fn late_reply_to_purged_id_is_discarded() {
        let map = CorrelationMap::new();
        let id = Uuid::new_v4();
        let _rx = map.register(id, Instant::now() + Duration::from_secs(5));
        map.purge(id);

        assert!(!map.complete(id, reply_to(id)));
        assert_eq!(map.discarded(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_slots() {
        let map = CorrelationMap::new();
        let now = Instant::now();
        let fresh = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let _a = map.register(fresh, now + Duration::from_secs(60));
        let _b = map.register(stale, now - Duration::from_secs(1));

        assert_eq!(map.sweep(now), 1);
        assert_eq!(map.pending(), 1);
        assert!(map.complete(fresh, reply_to(fresh)));
    }
}
