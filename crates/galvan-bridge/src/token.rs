// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Shared-token verification for bus registration.
//!
//! The Bridge never keeps the raw token around after startup — only its
//! SHA-256 digest. Comparison is constant-time so a misbehaving client on
//! the same network cannot use response timing as an oracle.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// The stored form of the shared auth token.
#[derive(Clone)]
pub struct AuthToken([u8; 32]);

impl AuthToken {
    /// Hash the configured raw token for storage.
    pub fn new(raw: &str) -> Self {
        Self(sha256(raw.as_bytes()))
    }

    /// Constant-time check of a token presented at registration.
    pub fn verify(&self, provided: &str) -> bool {
        let digest = sha256(provided.as_bytes());
        bool::from(digest.ct_eq(&self.0))
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the digest either; it is still secret-adjacent.
        f.write_str("AuthToken(..)")
    }
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_token_verifies() {
        let token = AuthToken::new("sesame");
        assert!(token.verify("sesame"));
    }

    #[test]
    fn wrong_and_empty_tokens_fail() {
        let token = AuthToken::new("sesame");
        assert!(!token.verify("Sesame"));
        assert!(!token.verify(""));
    }

    #[test]
    fn debug_never_leaks_the_digest() {
        let token = AuthToken::new("sesame");
        assert_eq!(format!("{token:?}"), "AuthToken(..)");
    }
}
