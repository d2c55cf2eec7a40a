//! Bearer token issuance and validation.
//!
//! Tokens are 256 bits from the OS RNG, hex encoded. Revoking a token
//! forgets it, so revoked and unknown tokens are indistinguishable.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;

const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Valid,
    Invalid,
}

#[derive(Debug, Clone)]
pub struct AuthToken {
    pub created_at: DateTime<Utc>,
}

pub struct TokenStore {
    tokens: DashMap<String, AuthToken>,
    required: bool,
}

impl TokenStore {
    pub fn new(required: bool) -> Self {
        Self {
            tokens: DashMap::new(),
            required,
        }
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Mint a new token.
    pub fn issue(&self) -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let value = hex::encode(bytes);
        self.tokens.insert(
            value.clone(),
            AuthToken { created_at: Utc::now() },
        );
        tracing::info!(active = self.active_count(), "Token issued");
        value
    }

    /// Register an operator-provided token (configuration bootstrap).
    pub fn seed(&self, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        self.tokens.insert(
            value.to_string(),
            AuthToken { created_at: Utc::now() },
        );
    }

    /// Check a presented token. Always valid when auth is not required.
    pub fn validate(&self, token: Option<&str>) -> TokenStatus {
        if !self.is_required() {
            return TokenStatus::Valid;
        }
        match token.filter(|t| self.tokens.contains_key(*t)) {
            Some(_) => TokenStatus::Valid,
            None => TokenStatus::Invalid,
        }
    }

    /// Revoke a token. Returns whether a live token was revoked.
    pub fn revoke(&self, token: &str) -> bool {
        let revoked = self.tokens.remove(token).is_some();
        if revoked {
            tracing::info!(active = self.active_count(), "Token revoked");
        }
        revoked
    }

    pub fn active_count(&self) -> usize {
        self.tokens.len()
    }
}

/// Pull a bearer token out of the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get("authorization")?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}
