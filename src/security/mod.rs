//! Security subsystem: the inbound decision engine.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → identity.rs (peer address, trusted X-Forwarded-For)
//!     → gate.rs (ordered pipeline)
//!         → access_registry.rs (static lists, block/allow entries)
//!         → rate_limit.rs (fixed window per identity)
//!         → threat.rs + patterns.rs (decoded request vs. catalog, auto-block)
//!         → tokens.rs (bearer token, when required)
//!     → Admit or Deny(reason)
//! ```
//!
//! # Design Decisions
//! - Every component is an owned value injected into the gate; no globals
//! - Per-identity state lives in concurrent maps, so identities never contend
//! - Fail closed: unknown tokens are invalid, bad patterns are fatal at startup

pub mod access_registry;
pub mod gate;
pub mod identity;
pub mod patterns;
pub mod rate_limit;
pub mod threat;
pub mod tokens;

pub use access_registry::{AccessEntry, AccessRegistry, AccessSource, AccessStatus, Classification};
pub use gate::{Decision, DenyReason, ProtectionStats, RequestGate};
pub use identity::SourceIdentity;
