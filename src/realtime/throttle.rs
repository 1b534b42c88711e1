//! Per-table cool-down for invalidations.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Admits at most one invalidation per table per cool-down window.
///
/// Events inside the window are dropped, not deferred: a burst collapses into
/// the invalidation triggered by its first event.
#[derive(Debug, Clone)]
pub struct ThrottleGuard {
    cooldown: Duration,
    last_invalidation: HashMap<String, Instant>,
}

impl ThrottleGuard {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_invalidation: HashMap::new(),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Returns true and records `now` when `table` is outside its window.
    pub fn try_acquire(&mut self, table: &str) -> bool {
        self.try_acquire_at(table, Instant::now())
    }

    pub fn try_acquire_at(&mut self, table: &str, now: Instant) -> bool {
        if let Some(last) = self.last_invalidation.get(table)
            && now.saturating_duration_since(*last) < self.cooldown
        {
            return false;
        }
        self.last_invalidation.insert(table.to_string(), now);
        true
    }

    pub fn last_invalidation(&self, table: &str) -> Option<Instant> {
        self.last_invalidation.get(table).copied()
    }

    /// Forget every recorded invalidation.
    pub fn reset(&mut self) {
        self.last_invalidation.clear();
    }
}
