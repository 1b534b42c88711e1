//! Query cache configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

const DEFAULT_GC_TIME_MS: u64 = 5 * 60 * 1000;
const DEFAULT_MAX_CONCURRENT_REFETCHES: usize = 8;

/// Query cache tuning, derived from the `[cache]` settings section.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long an unobserved query survives before garbage collection (ms).
    pub gc_time_ms: u64,
    /// Upper bound on refetches running at once during a single invalidation.
    pub max_concurrent_refetches: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            gc_time_ms: DEFAULT_GC_TIME_MS,
            max_concurrent_refetches: DEFAULT_MAX_CONCURRENT_REFETCHES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            gc_time_ms: u64::try_from(settings.gc_time.as_millis()).unwrap_or(u64::MAX),
            max_concurrent_refetches: settings.max_concurrent_refetches.get(),
        }
    }
}

impl CacheConfig {
    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_time_ms)
    }

    /// Returns the refetch concurrency as NonZeroUsize, clamping to 1 if zero.
    pub fn max_concurrent_refetches_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_concurrent_refetches).unwrap_or(NonZeroUsize::MIN)
    }
}
