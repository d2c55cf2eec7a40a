//! Source identity resolution and static identity lists.
//!
//! # Responsibilities
//! - Derive the caller identity from the peer address
//! - Honour `X-Forwarded-For` only when the peer is a trusted proxy
//! - Match identities against static lists of IPs, CIDRs and opaque ids
//!
//! # Design Decisions
//! - Never trust existing X-Forwarded-* from untrusted sources
//! - IP identities are canonicalised (IPv4-mapped IPv6 → IPv4) so that
//!   one caller maps to one key

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::ProtectorError;

const MAX_IDENTITY_LEN: usize = 128;

/// The key used to bucket rate limits and access decisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceIdentity(String);

impl SourceIdentity {
    /// Build an identity from untrusted input (admin paths, config).
    pub fn parse(raw: &str) -> Result<Self, ProtectorError> {
        normalize_identity(raw).map(Self)
    }

    pub fn from_ip(ip: IpAddr) -> Self {
        Self(ip.to_canonical().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.0.parse().ok()
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonicalise an identity string.
///
/// IPs are rendered in canonical form; anything else must be a short token of
/// `[A-Za-z0-9._:@-]`.
pub fn normalize_identity(raw: &str) -> Result<String, ProtectorError> {
    let trimmed = raw.trim();
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Ok(ip.to_canonical().to_string());
    }
    let valid = !trimmed.is_empty()
        && trimmed.len() <= MAX_IDENTITY_LEN
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '@' | '-'));
    if valid {
        Ok(trimmed.to_string())
    } else {
        Err(ProtectorError::InvalidIdentity(raw.to_string()))
    }
}

/// Resolve the caller identity for a request.
pub fn resolve_identity(peer: SocketAddr, headers: &HeaderMap, trusted_proxies: &[IpAddr]) -> SourceIdentity {
    let peer_ip = peer.ip().to_canonical();
    if !trusted_proxies.contains(&peer_ip) {
        return SourceIdentity::from_ip(peer_ip);
    }

    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
        .map(SourceIdentity::from_ip)
        .unwrap_or_else(|| SourceIdentity::from_ip(peer_ip))
}

/// A static list of identities: networks plus opaque exact matches.
#[derive(Debug, Clone, Default)]
pub struct IdentitySet {
    nets: Vec<IpNet>,
    exact: HashSet<String>,
}

impl IdentitySet {
    pub fn from_entries(entries: &[String]) -> Result<Self, ProtectorError> {
        let mut set = Self::default();
        for entry in entries {
            let trimmed = entry.trim();
            if let Ok(net) = trimmed.parse::<IpNet>() {
                set.nets.push(net.trunc());
            } else if let Ok(ip) = trimmed.parse::<IpAddr>() {
                set.nets.push(IpNet::from(ip.to_canonical()));
            } else {
                set.exact.insert(normalize_identity(trimmed)?);
            }
        }
        Ok(set)
    }

    pub fn contains(&self, identity: &SourceIdentity) -> bool {
        match identity.ip() {
            Some(ip) => self.nets.iter().any(|net| net.contains(&ip)),
            None => self.exact.contains(identity.as_str()),
        }
    }

    pub fn len(&self) -> usize {
        self.nets.len() + self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
