// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Dynamic tools: declarative programs registered at runtime.
//!
//! A tool arrives as `(name, description, code, inputSchema)` where `code`
//! is a JSON document in the small action DSL of [`spec`]. Registration
//! compiles the document; invocation interprets it against a [`ToolCtx`]
//! under a hard wall-clock timeout. The registry keeps the external
//! contract (counters, success rate, promotion) identical regardless of
//! what the program does.

pub mod ctx;
pub mod registry;
pub mod spec;

pub use ctx::{ExecResult, ToolCtx};
pub use registry::DynamicToolRegistry;
pub use spec::{ToolOp, ToolProgram};
