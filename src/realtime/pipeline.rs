//! Change event → throttle → map → cache.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{InvalidationOutcome, MutexExt, QueryCache, QueryKey};

use super::config::RealtimeConfig;
use super::events::ChangeEvent;
use super::map::InvalidationMap;
use super::throttle::ThrottleGuard;

const METRIC_EVENTS_TOTAL: &str = "courtwatch_realtime_events_total";
const METRIC_THROTTLED_TOTAL: &str = "courtwatch_realtime_throttled_total";
const METRIC_UNMAPPED_TOTAL: &str = "courtwatch_realtime_unmapped_total";

/// Receives resolved query keys. Implementations mark them stale and refetch
/// whatever is currently mounted, resolving once those refetches settled.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, keys: &[QueryKey]) -> InvalidationOutcome;
}

#[async_trait]
impl CacheInvalidator for QueryCache {
    async fn invalidate(&self, keys: &[QueryKey]) -> InvalidationOutcome {
        self.invalidate_queries(keys).await
    }
}

pub struct InvalidationPipeline {
    map: InvalidationMap,
    throttle: Mutex<ThrottleGuard>,
    invalidator: Arc<dyn CacheInvalidator>,
}

impl InvalidationPipeline {
    pub fn new(
        config: &RealtimeConfig,
        map: InvalidationMap,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            map,
            throttle: Mutex::new(ThrottleGuard::new(config.cooldown())),
            invalidator,
        }
    }

    pub fn map(&self) -> &InvalidationMap {
        &self.map
    }

    /// Keys to invalidate for a change on `table`, or `None` when the change is
    /// throttled or the table has no mapped keys.
    ///
    /// Admission consumes the table's cool-down window even when nothing is mapped.
    pub fn admit(&self, table: &str) -> Option<Vec<QueryKey>> {
        let admitted = self.throttle.lock_recovering("admit").try_acquire(table);
        if !admitted {
            counter!(METRIC_THROTTLED_TOTAL, "table" => table.to_string()).increment(1);
            debug!(table, "Change inside cool-down window; dropped");
            return None;
        }

        let keys = self.map.resolve(table);
        if keys.is_empty() {
            counter!(METRIC_UNMAPPED_TOTAL, "table" => table.to_string()).increment(1);
            if cfg!(debug_assertions) {
                warn!(table, "Change on table without mapped query keys");
            } else {
                debug!(table, "Change on table without mapped query keys");
            }
            return None;
        }

        Some(keys.to_vec())
    }

    /// Admit a change and wait until the cache settled.
    pub async fn try_invalidate(&self, table: &str) -> Option<InvalidationOutcome> {
        let keys = self.admit(table)?;
        info!(table, keys = keys.len(), "Invalidating dependent queries");
        Some(self.invalidator.invalidate(&keys).await)
    }

    /// Admit a delivered event and run its invalidation on a separate task.
    ///
    /// Admission happens here, in delivery order; only the cache work is
    /// detached, so it is not cancelled when the subscription stops. Must be
    /// called from within a Tokio runtime.
    pub fn dispatch(
        self: &Arc<Self>,
        event: &ChangeEvent,
    ) -> Option<JoinHandle<InvalidationOutcome>> {
        counter!(
            METRIC_EVENTS_TOTAL,
            "table" => event.table.clone(),
            "kind" => event.kind.as_str()
        )
        .increment(1);

        let keys = self.admit(&event.table)?;
        info!(
            event_id = %event.id,
            table = %event.table,
            kind = %event.kind,
            keys = keys.len(),
            "Invalidating dependent queries"
        );

        let pipeline = Arc::clone(self);
        Some(tokio::spawn(async move {
            pipeline.invalidator.invalidate(&keys).await
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::realtime::events::ChangeKind;

    #[derive(Default)]
    struct RecordingInvalidator {
        calls: Mutex<Vec<Vec<QueryKey>>>,
    }

    impl RecordingInvalidator {
        fn calls(&self) -> Vec<Vec<QueryKey>> {
            self.calls.lock_recovering("calls").clone()
        }
    }

    #[async_trait]
    impl CacheInvalidator for RecordingInvalidator {
        async fn invalidate(&self, keys: &[QueryKey]) -> InvalidationOutcome {
            self.calls.lock_recovering("invalidate").push(keys.to_vec());
            InvalidationOutcome {
                matched: keys.len(),
                ..Default::default()
            }
        }
    }

    fn pipeline(invalidator: Arc<RecordingInvalidator>) -> Arc<InvalidationPipeline> {
        Arc::new(InvalidationPipeline::new(
            &RealtimeConfig::default(),
            InvalidationMap::default(),
            invalidator,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_into_one_invalidation() {
        let invalidator = Arc::new(RecordingInvalidator::default());
        let pipeline = pipeline(Arc::clone(&invalidator));

        assert!(pipeline.try_invalidate("inventory_items").await.is_some());
        tokio::time::advance(Duration::from_millis(2_000)).await;
        assert!(pipeline.try_invalidate("inventory_items").await.is_none());
        tokio::time::advance(Duration::from_millis(4_000)).await;
        assert!(pipeline.try_invalidate("inventory_items").await.is_some());

        let expected = vec![
            QueryKey::from(["inventory", "all"]),
            QueryKey::from("inventory-stats"),
        ];
        assert_eq!(invalidator.calls(), vec![expected.clone(), expected]);
    }

    #[tokio::test]
    async fn unknown_table_is_ignored() {
        let invalidator = Arc::new(RecordingInvalidator::default());
        let pipeline = pipeline(Arc::clone(&invalidator));

        assert!(pipeline.admit("holding_cells").is_none());
        assert!(pipeline.try_invalidate("holding_cells").await.is_none());
        assert!(invalidator.calls().is_empty());
    }

    #[tokio::test]
    async fn dispatch_runs_invalidation_on_its_own_task() {
        let invalidator = Arc::new(RecordingInvalidator::default());
        let pipeline = pipeline(Arc::clone(&invalidator));

        let handle = pipeline
            .dispatch(&ChangeEvent::new(ChangeKind::Delete, "issues"))
            .expect("first change passes");
        let outcome = handle.await.expect("invalidation task");

        assert_eq!(outcome.matched, 2);
        assert!(
            pipeline
                .dispatch(&ChangeEvent::new(ChangeKind::Insert, "issues"))
                .is_none()
        );
        assert_eq!(invalidator.calls().len(), 1);
    }

    struct StaticFetcher;

    #[async_trait]
    impl crate::cache::QueryFetcher for StaticFetcher {
        async fn fetch(
            &self,
            key: &QueryKey,
        ) -> Result<crate::cache::QueryData, crate::cache::FetchError> {
            Ok(serde_json::json!({ "key": key.to_string() }))
        }
    }

    #[tokio::test]
    async fn query_cache_refetches_mounted_keys_behind_the_trait() {
        let cache = Arc::new(QueryCache::new(crate::cache::CacheConfig::default()));
        let _all = cache
            .mount(QueryKey::from(["inventory", "all"]), Arc::new(StaticFetcher))
            .await;
        let _stats = cache
            .mount(QueryKey::from("inventory-stats"), Arc::new(StaticFetcher))
            .await;
        let pipeline = Arc::new(InvalidationPipeline::new(
            &RealtimeConfig::default(),
            InvalidationMap::default(),
            cache.clone(),
        ));

        let outcome = pipeline
            .dispatch(&ChangeEvent::new(ChangeKind::Update, "inventory_items"))
            .expect("first change passes")
            .await
            .expect("invalidation task");

        assert_eq!(outcome.matched, 2);
        assert_eq!(outcome.refetched, 2);
        let snapshot = cache
            .snapshot(&QueryKey::from("inventory-stats"))
            .expect("entry");
        assert_eq!(snapshot.fetch_count, 2);
        assert!(!snapshot.is_stale);
    }
}
