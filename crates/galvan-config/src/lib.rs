// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Environment-driven configuration for every galvan component.
//!
//! Deployment configures the cluster exclusively through environment
//! variables (`BRIDGE_URL`, `MAX_ACTIVE_PLANS`, ...). Each component owns a
//! config struct with a `from_env()` constructor; the real parsing happens
//! in `from_vars`, which reads from an explicit lookup closure so tests can
//! drive it without touching the process environment.
//!
//! Malformed numeric values never abort startup — they fall back to the
//! default with a warning, the same posture as an unset variable.

mod env;
mod logging;
mod schema;

pub use env::Env;
pub use logging::{init_logging, LogFormat};
pub use schema::{
    BridgeConfig, CommonConfig, DoctorConfig, FrankConfig, IgorConfig, ReconnectConfig,
};
