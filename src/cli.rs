// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};

/// Agentic end-to-end test orchestrator.
///
/// One binary, four components. A minimal local cluster is:
///
/// ```text
/// galvan bridge &
/// galvan frank  &
/// galvan igor   &
/// galvan doctor &
/// curl -XPOST localhost:4672/plan -d '{"intent":"navigate to http://localhost:8080"}'
/// ```
///
/// Configuration is environment-driven (BRIDGE_URL, BRIDGE_AUTH_TOKEN,
/// DOCTOR_PORT, ...); see the deployment docs for the full variable list.
#[derive(Debug, Parser)]
#[command(name = "galvan", version, about = "Agentic end-to-end test orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the Bridge: message router, event log, screenshot intake.
    Bridge,
    /// Run the Doctor: plan compiler, scheduler and failure analyzer.
    Doctor,
    /// Run an Igor worker.
    Igor {
        /// Bind this worker to one route of a branching plan
        /// (registers as `igor-<route>`).
        #[arg(long)]
        route: Option<String>,
    },
    /// Run Frankenstein: browser surface and dynamic tool host.
    Frank,
}
