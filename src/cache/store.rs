//! In-memory query cache.
//!
//! Entries are keyed by [`QueryKey`] and publish their state through a watch
//! channel so mounted consumers re-render when data is invalidated or refetched.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use super::config::CacheConfig;
use super::keys::QueryKey;
use super::lock::RwLockExt;

const METRIC_CACHE_INVALIDATE_MS: &str = "courtwatch_cache_invalidate_ms";
const METRIC_CACHE_REFETCH_TOTAL: &str = "courtwatch_cache_refetch_total";
const METRIC_CACHE_GC_EVICTED_TOTAL: &str = "courtwatch_cache_gc_evicted_total";

/// Payload stored for a query.
pub type QueryData = Value;

/// Failure reported by a [`QueryFetcher`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("query fetch failed: {message}")]
pub struct FetchError {
    pub message: String,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Loads the data behind a query key from the backend.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> Result<QueryData, FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    /// Never fetched successfully and never failed.
    Pending,
    Success,
    /// The most recent fetch failed; previous data, if any, is kept.
    Error(String),
}

/// Point-in-time view of a cached query, as seen by its observers.
#[derive(Debug, Clone)]
pub struct QuerySnapshot {
    pub data: Option<QueryData>,
    pub status: QueryStatus,
    pub is_stale: bool,
    pub fetch_count: u64,
    pub updated_at: Option<Instant>,
}

impl QuerySnapshot {
    fn pending() -> Self {
        Self {
            data: None,
            status: QueryStatus::Pending,
            is_stale: true,
            fetch_count: 0,
            updated_at: None,
        }
    }
}

/// Result of a single [`QueryCache::invalidate_queries`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationOutcome {
    /// Entries whose key matched one of the invalidated keys; all are now stale.
    pub matched: usize,
    /// Observed entries refetched successfully.
    pub refetched: usize,
    /// Observed entries whose refetch failed.
    pub failed: usize,
}

struct QueryEntry {
    snapshot: watch::Sender<QuerySnapshot>,
    fetcher: Option<Arc<dyn QueryFetcher>>,
    observers: usize,
    /// Bumped on every invalidation so an in-flight fetch cannot clear a newer staleness mark.
    generation: u64,
    idle_since: Instant,
}

impl QueryEntry {
    fn new() -> Self {
        let (snapshot, _) = watch::channel(QuerySnapshot::pending());
        Self {
            snapshot,
            fetcher: None,
            observers: 0,
            generation: 0,
            idle_since: Instant::now(),
        }
    }

    fn needs_fetch(&self) -> bool {
        let snapshot = self.snapshot.borrow();
        snapshot.data.is_none() || snapshot.is_stale
    }
}

/// Query cache with observer tracking and prefix invalidation.
pub struct QueryCache {
    config: CacheConfig,
    entries: RwLock<HashMap<QueryKey, QueryEntry>>,
}

impl QueryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Store data for a key as fresh, creating the entry when needed.
    pub fn set_query_data(&self, key: QueryKey, data: QueryData) {
        let mut entries = self.entries.write_recovering("set_query_data");
        let entry = entries.entry(key).or_insert_with(QueryEntry::new);
        entry.idle_since = Instant::now();
        entry.snapshot.send_modify(|snapshot| {
            snapshot.data = Some(data);
            snapshot.status = QueryStatus::Success;
            snapshot.is_stale = false;
            snapshot.updated_at = Some(Instant::now());
        });
    }

    pub fn get_query_data(&self, key: &QueryKey) -> Option<QueryData> {
        self.entries.read_recovering("get_query_data")
            .get(key)
            .and_then(|entry| entry.snapshot.borrow().data.clone())
    }

    pub fn snapshot(&self, key: &QueryKey) -> Option<QuerySnapshot> {
        self.entries.read_recovering("snapshot")
            .get(key)
            .map(|entry| entry.snapshot.borrow().clone())
    }

    pub fn observer_count(&self, key: &QueryKey) -> usize {
        self.entries.read_recovering("observer_count")
            .get(key)
            .map_or(0, |entry| entry.observers)
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries.read_recovering("contains").contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read_recovering("len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return fresh cached data, or fetch it when missing or stale.
    pub async fn fetch_query(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn QueryFetcher>,
    ) -> Result<QueryData, FetchError> {
        let cached = {
            let mut entries = self.entries.write_recovering("fetch_query");
            let entry = entries.entry(key.clone()).or_insert_with(QueryEntry::new);
            entry.fetcher = Some(Arc::clone(&fetcher));
            if entry.needs_fetch() {
                None
            } else {
                entry.snapshot.borrow().data.clone()
            }
        };

        match cached {
            Some(data) => Ok(data),
            None => self.run_fetch(key, fetcher).await,
        }
    }

    /// Register a consumer for `key` without fetching.
    pub fn observe(
        self: &Arc<Self>,
        key: QueryKey,
        fetcher: Arc<dyn QueryFetcher>,
    ) -> QueryObserver {
        let receiver = {
            let mut entries = self.entries.write_recovering("observe");
            let entry = entries.entry(key.clone()).or_insert_with(QueryEntry::new);
            entry.fetcher = Some(fetcher);
            entry.observers += 1;
            entry.snapshot.subscribe()
        };

        QueryObserver {
            cache: Arc::clone(self),
            key,
            receiver,
        }
    }

    /// Register a consumer and fetch when the entry is missing or stale.
    ///
    /// A failed fetch is reported through the observer's snapshot.
    pub async fn mount(
        self: &Arc<Self>,
        key: QueryKey,
        fetcher: Arc<dyn QueryFetcher>,
    ) -> QueryObserver {
        let observer = self.observe(key.clone(), Arc::clone(&fetcher));
        let needs_fetch = self
            .entries
            .read_recovering("mount")
            .get(&key)
            .is_some_and(QueryEntry::needs_fetch);
        if needs_fetch {
            let _ = self.run_fetch(&key, fetcher).await;
        }
        observer
    }

    /// Mark every entry under `keys` stale and refetch the observed ones.
    ///
    /// Unobserved entries stay stale until their next mount or fetch. Fetch
    /// failures are recorded on the entry, never returned.
    pub async fn invalidate_queries(&self, keys: &[QueryKey]) -> InvalidationOutcome {
        let started_at = std::time::Instant::now();
        let mut outcome = InvalidationOutcome::default();

        let refetches = {
            let mut entries = self.entries.write_recovering("invalidate_queries");
            let mut refetches = Vec::new();
            for (key, entry) in entries.iter_mut() {
                if !keys.iter().any(|group| group.is_prefix_of(key)) {
                    continue;
                }
                outcome.matched += 1;
                entry.generation += 1;
                entry.snapshot.send_modify(|snapshot| snapshot.is_stale = true);
                if entry.observers > 0
                    && let Some(fetcher) = &entry.fetcher
                {
                    refetches.push((key.clone(), Arc::clone(fetcher)));
                }
            }
            refetches
        };

        let limit = self.config.max_concurrent_refetches_non_zero().get();
        let refetches: Vec<BoxFuture<'_, bool>> = refetches
            .into_iter()
            .map(|(key, fetcher)| self.refetch(key, fetcher))
            .collect();
        let results: Vec<bool> = stream::iter(refetches)
            .buffer_unordered(limit)
            .collect()
            .await;

        for ok in results {
            if ok {
                outcome.refetched += 1;
                counter!(METRIC_CACHE_REFETCH_TOTAL, "result" => "ok").increment(1);
            } else {
                outcome.failed += 1;
                counter!(METRIC_CACHE_REFETCH_TOTAL, "result" => "error").increment(1);
            }
        }

        histogram!(METRIC_CACHE_INVALIDATE_MS)
            .record(started_at.elapsed().as_secs_f64() * 1000.0);

        info!(
            keys = keys.len(),
            matched = outcome.matched,
            refetched = outcome.refetched,
            failed = outcome.failed,
            "Query invalidation complete"
        );

        outcome
    }

    /// Drop unobserved entries that have been idle for longer than the gc time.
    ///
    /// Returns the number of entries removed.
    pub fn collect_garbage(&self) -> usize {
        let gc_time = self.config.gc_time();
        let now = Instant::now();

        let mut entries = self.entries.write_recovering("collect_garbage");
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.observers > 0 || now.saturating_duration_since(entry.idle_since) < gc_time
        });
        let evicted = before - entries.len();

        if evicted > 0 {
            counter!(METRIC_CACHE_GC_EVICTED_TOTAL).increment(evicted as u64);
            debug!(evicted, remaining = entries.len(), "Collected idle queries");
        }
        evicted
    }

    fn release(&self, key: &QueryKey) {
        let mut entries = self.entries.write_recovering("release");
        if let Some(entry) = entries.get_mut(key) {
            entry.observers = entry.observers.saturating_sub(1);
            if entry.observers == 0 {
                entry.idle_since = Instant::now();
            }
        }
    }

    fn refetch(&self, key: QueryKey, fetcher: Arc<dyn QueryFetcher>) -> BoxFuture<'_, bool> {
        async move { self.run_fetch(&key, fetcher).await.is_ok() }.boxed()
    }

    async fn run_fetch(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn QueryFetcher>,
    ) -> Result<QueryData, FetchError> {
        let generation = self
            .entries
            .read_recovering("run_fetch.start")
            .get(key)
            .map(|entry| entry.generation);

        let result = fetcher.fetch(key).await;

        let mut entries = self.entries.write_recovering("run_fetch.finish");
        if let Some(entry) = entries.get_mut(key) {
            if result.is_ok() {
                entry.idle_since = Instant::now();
            }
            let superseded = Some(entry.generation) != generation;
            entry.snapshot.send_modify(|snapshot| {
                snapshot.fetch_count += 1;
                match &result {
                    Ok(data) => {
                        snapshot.data = Some(data.clone());
                        snapshot.status = QueryStatus::Success;
                        snapshot.is_stale = superseded;
                        snapshot.updated_at = Some(Instant::now());
                    }
                    Err(err) => {
                        snapshot.status = QueryStatus::Error(err.message.clone());
                    }
                }
            });
        }
        drop(entries);

        if let Err(err) = &result {
            debug!(key = %key, error = %err, "Query fetch failed");
        }
        result
    }
}

/// A mounted consumer of one query. Dropping it unmounts the consumer.
pub struct QueryObserver {
    cache: Arc<QueryCache>,
    key: QueryKey,
    receiver: watch::Receiver<QuerySnapshot>,
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn current(&self) -> QuerySnapshot {
        self.receiver.borrow().clone()
    }

    /// Wait for the next state change. Returns `None` once the entry is gone.
    pub async fn changed(&mut self) -> Option<QuerySnapshot> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}
