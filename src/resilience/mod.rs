//! Resilience helpers.
//!
//! # Design Decisions
//! - Retries happen on background workers only, never on the request path
//! - Jittered backoff prevents synchronized retry storms against the store

pub mod backoff;
