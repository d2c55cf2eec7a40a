//! Fixed-window rate tracking per source identity.
//!
//! # Algorithm
//! ```text
//! no window, or now >= window_start + window  → new window, count = 1, Admit
//! otherwise                                   → count += 1
//!                                                count > max → Throttle
//! ```
//!
//! Count keeps growing past the limit so a sustained flood stays throttled
//! until the window rolls over. Across a window seam up to `2 × max` requests
//! can be admitted; that burst is accepted.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::security::identity::SourceIdentity;

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Admit,
    Throttle,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    window_start: Instant,
    count: u64,
}

/// Per-identity fixed-window counters.
///
/// Each identity's window is mutated under its `DashMap` shard lock, so the
/// read-modify-write is atomic per identity and other identities on other
/// shards proceed in parallel.
#[derive(Debug)]
pub struct RateWindowTracker {
    windows: DashMap<SourceIdentity, RateWindow>,
    window: Duration,
    max_requests: u64,
}

impl RateWindowTracker {
    pub fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            max_requests,
        }
    }

    pub fn admit(&self, identity: &SourceIdentity) -> RateDecision {
        self.admit_at(identity, Instant::now())
    }

    /// Same as [`Self::admit`] with an explicit clock reading.
    pub fn admit_at(&self, identity: &SourceIdentity, now: Instant) -> RateDecision {
        let mut entry = self
            .windows
            .entry(identity.clone())
            .or_insert(RateWindow { window_start: now, count: 0 });
        let state = entry.value_mut();

        if state.count == 0 || now.saturating_duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.count = 1;
            return RateDecision::Admit;
        }

        state.count = state.count.saturating_add(1);
        if state.count > self.max_requests {
            RateDecision::Throttle
        } else {
            RateDecision::Admit
        }
    }

    /// Drop windows that have been idle for at least one full window.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, state| now.saturating_duration_since(state.window_start) < self.window);
        let removed = before.saturating_sub(self.windows.len());
        tracing::debug!(removed, remaining = self.windows.len(), "Rate window cleanup complete");
        removed
    }

    /// Number of identities with a live window.
    pub fn active_identities(&self) -> usize {
        self.windows.len()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }
}
