// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Tracing bootstrap shared by all component binaries.

use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Line-per-event JSON, for log shippers.
    Json,
    /// Human-readable output (the default).
    Pretty,
}

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
///
/// Calling this twice is a no-op failure swallowed on purpose — tests that
/// boot several components in one process would otherwise panic.
pub fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("logging already initialized");
    }
}
