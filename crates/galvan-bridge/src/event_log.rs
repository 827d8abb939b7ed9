// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Bounded in-memory projection of every routed message.
//!
//! Only the envelope header is kept — never the payload — so the log stays
//! cheap regardless of screenshot blobs and tool sources flowing through
//! the bus. Spillover discards oldest-first.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use galvan_proto::Envelope;

/// Header projection of one routed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl From<&Envelope> for EventRecord {
    fn from(env: &Envelope) -> Self {
        Self {
            id: env.id,
            timestamp: env.timestamp,
            source: env.source.clone(),
            target: env.target.clone(),
            kind: env.kind.clone(),
        }
    }
}

/// Ring of the most recent N routed-message headers.
pub struct EventLog {
    cap: usize,
    records: VecDeque<EventRecord>,
}

impl EventLog {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            records: VecDeque::with_capacity(cap.min(1024)),
        }
    }

    pub fn push(&mut self, record: EventRecord) {
        if self.records.len() == self.cap {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Most recent first.
    pub fn snapshot(&self, limit: usize) -> Vec<EventRecord> {
        self.records.iter().rev().take(limit).cloned().collect()
    }
}

/// Byte ceiling for the on-disk mirror; crossing it truncates and starts
/// over (crash-recovery data, not an archive).
const SPILL_MAX_BYTES: u64 = 8 * 1024 * 1024;

/// Drain `rx` into an append-only JSONL file, one record per line.
///
/// Durability is best-effort: any I/O error disables the writer for the
/// rest of the process (the in-memory log keeps working).
pub async fn spill_writer(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<EventRecord>,
    path: std::path::PathBuf,
) {
    use tokio::io::AsyncWriteExt;

    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await;
    let mut file = match file {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(path = %path.display(), "event spill disabled: {e}");
            return;
        }
    };

    let mut written: u64 = file.metadata().await.map(|m| m.len()).unwrap_or(0);
    while let Some(record) = rx.recv().await {
        let Ok(mut line) = serde_json::to_vec(&record) else { continue };
        line.push(b'\n');

        if written + line.len() as u64 > SPILL_MAX_BYTES {
            if file.set_len(0).await.is_err() {
                tracing::warn!("event spill rotation failed, writer stopped");
                return;
            }
            written = 0;
        }
        match file.write_all(&line).await {
            Ok(()) => written += line.len() as u64,
            Err(e) => {
                tracing::warn!("event spill write failed, writer stopped: {e}");
                return;
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(kind: &str) -> EventRecord {
        EventRecord::from(&Envelope::new("a", "b", kind, json!({})))
    }

    #[test]
    fn log_never_exceeds_its_cap() {
        let mut log = EventLog::new(3);
        for i in 0..10 {
            log.push(record(&format!("t{i}")));
            assert!(log.len() <= 3);
        }
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn spillover_discards_oldest_first() {
        let mut log = EventLog::new(2);
        log.push(record("first"));
        log.push(record("second"));
        log.push(record("third"));
        let kinds: Vec<_> = log.snapshot(10).into_iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec!["third", "second"]);
    }

    #[test]
    fn snapshot_respects_its_limit() {
        let mut log = EventLog::new(100);
        for i in 0..50 {
            log.push(record(&format!("t{i}")));
        }
        assert_eq!(log.snapshot(5).len(), 5);
        assert_eq!(log.snapshot(5)[0].kind, "t49");
    }

    #[test]
    fn zero_cap_is_clamped_to_one() {
        let mut log = EventLog::new(0);
        log.push(record("only"));
        log.push(record("newer"));
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn spill_writer_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        let writer = tokio::spawn(spill_writer(rx, path.clone()));
        tx.send(record("first")).unwrap();
        tx.send(record("second")).unwrap();
        drop(tx);
        writer.await.unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: EventRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.kind, "first");
    }
}
