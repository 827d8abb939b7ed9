// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! A thin, testable view over the process environment.

use std::collections::HashMap;

use tracing::warn;

/// Lookup source for config parsing. Backed by the process environment in
/// production and by a plain map in tests.
pub struct Env {
    vars: HashMap<String, String>,
}

impl Env {
    /// Snapshot the process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build from explicit key/value pairs (tests).
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Like [`Env::get`] but an empty value counts as set — for variables
    /// where explicitly-empty means "disabled" rather than "default".
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// Parse an integer variable; malformed values warn and fall back.
    pub fn u64(&self, key: &str, default: u64) -> u64 {
        match self.get(key) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(%key, %raw, %default, "not a number, using default");
                default
            }),
        }
    }

    pub fn usize(&self, key: &str, default: usize) -> usize {
        self.u64(key, default as u64) as usize
    }

    pub fn u16(&self, key: &str, default: u16) -> u16 {
        let value = self.u64(key, default as u64);
        u16::try_from(value).unwrap_or_else(|_| {
            warn!(%key, %value, %default, "out of port range, using default");
            default
        })
    }

    /// Accepts `1/0`, `true/false`, `yes/no` (case-insensitive).
    pub fn bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    warn!(%key, %raw, %default, "not a boolean, using default");
                    default
                }
            },
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_and_empty_values_fall_back() {
        let env = Env::from_pairs([("EMPTY", "")]);
        assert_eq!(env.string("MISSING", "d"), "d");
        assert_eq!(env.string("EMPTY", "d"), "d");
    }

    #[test]
    fn malformed_number_falls_back_to_default() {
        let env = Env::from_pairs([("MAX_ACTIVE_PLANS", "lots")]);
        assert_eq!(env.u64("MAX_ACTIVE_PLANS", 10), 10);
    }

    #[test]
    fn bool_accepts_common_spellings() {
        let env = Env::from_pairs([("A", "yes"), ("B", "0"), ("C", "TRUE")]);
        assert!(env.bool("A", false));
        assert!(!env.bool("B", true));
        assert!(env.bool("C", false));
    }

    #[test]
    fn oversized_port_falls_back() {
        let env = Env::from_pairs([("DOCTOR_PORT", "99999999")]);
        assert_eq!(env.u16("DOCTOR_PORT", 4672), 4672);
    }
}
