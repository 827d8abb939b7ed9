// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The dynamic tool registry.
//!
//! Writer-exclusive for create/update/delete, concurrent for invocation:
//! the compiled program is cloned out of the lock and interpreted outside
//! it, then the lock is retaken to update counters (if the tool still
//! exists). The id index and name index live under the *same* lock so they
//! can never disagree.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{info, warn};

use galvan_proto::tool::{ToolRecord, ToolStatus};
use galvan_proto::{Fault, FaultKind};

use super::ctx::ToolCtx;
use super::spec::ToolProgram;

/// Rolling duration window per tool.
const DURATION_WINDOW: usize = 100;

struct Entry {
    record: ToolRecord,
    program: ToolProgram,
    durations: VecDeque<u64>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Entry>,
    /// name → id. Maintained atomically with `by_id`.
    by_name: HashMap<String, String>,
}

impl Inner {
    fn resolve<'a>(&'a self, id_or_name: &str) -> Option<&'a str> {
        if let Some((key, _)) = self.by_id.get_key_value(id_or_name) {
            return Some(key.as_str());
        }
        self.by_name.get(id_or_name).map(String::as_str)
    }
}

#[derive(Default)]
pub struct DynamicToolRegistry {
    inner: Mutex<Inner>,
}

impl DynamicToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new tool: compile first, then store under a generated id
    /// *and* the declared name. Duplicate live names are rejected.
    pub fn create(
        &self,
        name: &str,
        description: &str,
        code: Value,
        input_schema: Value,
        author: &str,
    ) -> Result<ToolRecord, Fault> {
        let program = ToolProgram::compile(&code)?;

        let mut inner = self.inner.lock().expect("tool registry poisoned");
        if inner.by_name.contains_key(name) {
            return Err(
                Fault::new(FaultKind::ValidationFailed, format!("tool name in use: {name}"))
                    .with("name", name),
            );
        }

        let record = ToolRecord::new(name, description, code, input_schema, author);
        let id = record.id.clone();
        inner.by_name.insert(name.to_string(), id.clone());
        inner.by_id.insert(
            id,
            Entry {
                record: record.clone(),
                program,
                durations: VecDeque::with_capacity(DURATION_WINDOW),
            },
        );
        info!(tool = %name, "dynamic tool created");
        Ok(record)
    }

    /// Update a tool's program and metadata. The new code is compiled
    /// *before* anything is touched — a failed compile leaves the previous
    /// version active.
    pub fn update(
        &self,
        id_or_name: &str,
        description: Option<&str>,
        code: Option<Value>,
        input_schema: Option<Value>,
        status: Option<ToolStatus>,
    ) -> Result<ToolRecord, Fault> {
        let compiled = match &code {
            Some(code) => Some(ToolProgram::compile(code)?),
            None => None,
        };

        let mut inner = self.inner.lock().expect("tool registry poisoned");
        let id = inner
            .resolve(id_or_name)
            .map(String::from)
            .ok_or_else(|| not_found(id_or_name))?;
        let entry = inner.by_id.get_mut(&id).ok_or_else(|| not_found(id_or_name))?;

        if let Some(program) = compiled {
            entry.program = program;
            entry.record.code = code.unwrap_or(Value::Null);
        }
        if let Some(description) = description {
            entry.record.description = description.to_string();
        }
        if let Some(schema) = input_schema {
            entry.record.input_schema = schema;
        }
        if let Some(status) = status {
            entry.record.status = status;
        }
        entry.record.updated_at = chrono::Utc::now();
        Ok(entry.record.clone())
    }

    /// Delete by id or name. Returns the removed record.
    pub fn delete(&self, id_or_name: &str) -> Result<ToolRecord, Fault> {
        let mut inner = self.inner.lock().expect("tool registry poisoned");
        let id = inner
            .resolve(id_or_name)
            .map(String::from)
            .ok_or_else(|| not_found(id_or_name))?;
        let entry = inner.by_id.remove(&id).ok_or_else(|| not_found(id_or_name))?;
        inner.by_name.remove(&entry.record.name);
        info!(tool = %entry.record.name, "dynamic tool deleted");
        Ok(entry.record)
    }

    pub fn get(&self, id_or_name: &str) -> Option<ToolRecord> {
        let inner = self.inner.lock().expect("tool registry poisoned");
        let id = inner.resolve(id_or_name)?;
        inner.by_id.get(id).map(|entry| entry.record.clone())
    }

    pub fn list(&self) -> Vec<ToolRecord> {
        let inner = self.inner.lock().expect("tool registry poisoned");
        let mut records: Vec<ToolRecord> =
            inner.by_id.values().map(|entry| entry.record.clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("tool registry poisoned").by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Experimental tools that have earned promotion.
    pub fn igorify_candidates(&self) -> Vec<ToolRecord> {
        self.list()
            .into_iter()
            .filter(ToolRecord::igorify_candidate)
            .collect()
    }

    /// Export a tool and mark it `igorified`.
    pub fn export(&self, id_or_name: &str) -> Result<Value, Fault> {
        let mut inner = self.inner.lock().expect("tool registry poisoned");
        let id = inner
            .resolve(id_or_name)
            .map(String::from)
            .ok_or_else(|| not_found(id_or_name))?;
        let entry = inner.by_id.get_mut(&id).ok_or_else(|| not_found(id_or_name))?;

        let artifact = entry.record.export_artifact();
        entry.record.status = ToolStatus::Igorified;
        entry.record.igorified_at = Some(chrono::Utc::now());
        info!(tool = %entry.record.name, "tool igorified");
        Ok(artifact)
    }

    /// Run a tool under the hard wall-clock timeout, recording the outcome
    /// in its counters and rolling duration window.
    pub async fn invoke(
        &self,
        id_or_name: &str,
        params: Map<String, Value>,
        ctx: ToolCtx,
    ) -> Result<Value, Fault> {
        let (id, program) = {
            let inner = self.inner.lock().expect("tool registry poisoned");
            let id = inner
                .resolve(id_or_name)
                .map(String::from)
                .ok_or_else(|| not_found(id_or_name))?;
            let entry = inner.by_id.get(&id).ok_or_else(|| not_found(id_or_name))?;
            (id, entry.program.clone())
        };

        let timeout = ctx.timeout;
        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, program.run(&params, &ctx)).await {
            Ok(result) => result,
            Err(_) => Err(Fault::new(
                FaultKind::ToolTimeout,
                format!("tool timed out after {timeout:?}"),
            )),
        };
        let elapsed = started.elapsed();

        self.record_outcome(&id, elapsed, &outcome);
        outcome
    }

    fn record_outcome(&self, id: &str, elapsed: Duration, outcome: &Result<Value, Fault>) {
        let mut inner = self.inner.lock().expect("tool registry poisoned");
        // The tool may have been deleted while its program was running.
        let Some(entry) = inner.by_id.get_mut(id) else {
            warn!(%id, "tool vanished mid-invocation, outcome dropped");
            return;
        };
        entry.record.invocations += 1;
        entry.record.last_used = Some(chrono::Utc::now());
        match outcome {
            Ok(_) => entry.record.successes += 1,
            Err(fault) => {
                entry.record.failures += 1;
                entry.record.last_error = Some(fault.stable_string());
            }
        }
        if entry.durations.len() == DURATION_WINDOW {
            entry.durations.pop_front();
        }
        entry.durations.push_back(elapsed.as_millis() as u64);
    }

    /// Mean of the rolling duration window, for `/health` metrics.
    pub fn mean_duration_ms(&self, id_or_name: &str) -> Option<f64> {
        let inner = self.inner.lock().expect("tool registry poisoned");
        let id = inner.resolve(id_or_name)?;
        let entry = inner.by_id.get(id)?;
        if entry.durations.is_empty() {
            return None;
        }
        let sum: u64 = entry.durations.iter().sum();
        Some(sum as f64 / entry.durations.len() as f64)
    }
}

fn not_found(id_or_name: &str) -> Fault {
    Fault::new(FaultKind::ToolNotFound, format!("no such tool: {id_or_name}"))
        .with("tool", id_or_name)
}

// ── Unit tests ────────────────────────────────────────────────────────────────
