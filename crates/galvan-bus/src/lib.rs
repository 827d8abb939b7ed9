// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Client side of the galvan bus.
//!
//! Every component except the Bridge itself talks to the cluster through a
//! [`BusClient`]: one persistent WebSocket carrying JSON [`Envelope`]
//! frames. The client owns registration, the 5-second heartbeat, reconnect
//! with capped exponential backoff, and request/reply correlation.
//!
//! ```rust,no_run
//! # use galvan_bus::{BusClient, BusConfig, BusError};
//! # use galvan_proto::{Envelope, msg};
//! # use serde_json::json;
//! # use std::time::Duration;
//! # async fn example() -> Result<(), BusError> {
//! let config = BusConfig::new("doctor", "0.4.2", "ws://127.0.0.1:4670/ws", "token");
//! let (handle, mut ingress) = BusClient::spawn(config);
//!
//! // Fire-and-forget:
//! handle.send(Envelope::new("doctor", "igor", msg::PLAN_CANCEL, json!({}))).await?;
//!
//! // Request/reply with a deadline:
//! let req = Envelope::new("doctor", "frank", msg::TOOL_INVOKE, json!({"toolId": "t"}));
//! let reply = handle.request(req, Duration::from_secs(30)).await?;
//!
//! // Everything that is not a tracked reply arrives on the ingress channel:
//! while let Some(env) = ingress.recv().await { /* dispatch */ }
//! # Ok(())
//! # }
//! ```

mod client;
mod correlation;

pub use client::{BusClient, BusConfig, BusError, BusHandle};
pub use correlation::CorrelationMap;
