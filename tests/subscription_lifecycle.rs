//! Subscription manager timing: backoff growth, reset, teardown, throttled
//! invalidation through a real query cache. Time is paused and advanced by hand.

mod support;

use std::sync::Arc;
use std::time::Duration;

use courtwatch::cache::{CacheConfig, QueryCache, QueryKey};
use courtwatch::realtime::{
    ChangeEvent, ChangeKind, ConnectionState, InvalidationMap, InvalidationPipeline,
    RealtimeConfig, SubscriptionManager,
};
use tokio::sync::mpsc;

use support::{CountingFetcher, ScriptedFeed, Step};

fn manager_with(
    feed: Arc<ScriptedFeed>,
    cache: Arc<QueryCache>,
    config: RealtimeConfig,
) -> SubscriptionManager {
    let pipeline = Arc::new(InvalidationPipeline::new(
        &config,
        InvalidationMap::default(),
        cache,
    ));
    SubscriptionManager::new(config, feed, pipeline)
}

fn cache() -> Arc<QueryCache> {
    Arc::new(QueryCache::new(CacheConfig::default()))
}

fn gaps(feed: &ScriptedFeed) -> Vec<Duration> {
    feed.attempts()
        .windows(2)
        .map(|pair| pair[1].duration_since(pair[0]))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn consecutive_failures_back_off_exponentially() {
    let feed = ScriptedFeed::failing();
    let manager = manager_with(feed.clone(), cache(), RealtimeConfig::default());

    manager.start();
    tokio::time::sleep(Duration::from_millis(15_000)).await;

    assert_eq!(
        gaps(&feed),
        vec![
            Duration::from_millis(2_000),
            Duration::from_millis(4_000),
            Duration::from_millis(8_000),
        ]
    );
    manager.stop();
}

#[tokio::test(start_paused = true)]
async fn reconnect_delay_is_capped() {
    let feed = ScriptedFeed::failing();
    let config = RealtimeConfig {
        base_delay_ms: 1_000,
        max_delay_ms: 5_000,
        ..Default::default()
    };
    let manager = manager_with(feed.clone(), cache(), config);

    manager.start();
    tokio::time::sleep(Duration::from_secs(40)).await;
    manager.stop();

    let gaps = gaps(&feed);
    assert!(gaps.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(gaps.iter().all(|gap| *gap <= Duration::from_secs(5)));
    assert_eq!(gaps.last(), Some(&Duration::from_secs(5)));
}

#[tokio::test(start_paused = true)]
async fn successful_subscription_resets_backoff() {
    let feed = ScriptedFeed::new([Step::Fail, Step::Fail, Step::Events(Vec::new())]);
    let manager = manager_with(feed.clone(), cache(), RealtimeConfig::default());

    manager.start();
    tokio::time::sleep(Duration::from_millis(9_000)).await;
    manager.stop();

    // fail, +2s fail, +4s subscribed then dropped, +2s again from base
    assert_eq!(
        gaps(&feed),
        vec![
            Duration::from_millis(2_000),
            Duration::from_millis(4_000),
            Duration::from_millis(2_000),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_pending_reconnect_and_is_idempotent() {
    let feed = ScriptedFeed::failing();
    let manager = manager_with(feed.clone(), cache(), RealtimeConfig::default());

    manager.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(feed.attempt_count(), 1);

    manager.stop();
    manager.stop();
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(feed.attempt_count(), 1);
    assert!(!manager.is_running());
    assert_eq!(manager.state(), ConnectionState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn subscribes_to_every_watched_table() {
    let (_events, receiver) = mpsc::unbounded_channel();
    let feed = ScriptedFeed::new([Step::Live(receiver)]);
    let config = RealtimeConfig::default().with_tables(["rooms", "issues"]);
    let manager = manager_with(feed.clone(), cache(), config);
    let mut state = manager.watch_state();

    manager.start();
    state
        .wait_for(|state| *state == ConnectionState::Subscribed)
        .await
        .expect("manager alive");

    let spec = feed.last_spec().expect("subscribed once");
    assert_eq!(spec.tables, vec!["rooms", "issues"]);
    assert_eq!(spec.schema, "public");
    manager.stop();
}

#[tokio::test(start_paused = true)]
async fn burst_of_changes_refetches_mounted_queries_once_per_window() {
    let cache = cache();
    let list = CountingFetcher::new();
    let stats = CountingFetcher::new();
    let _list_observer = cache
        .mount(QueryKey::from(["inventory", "all"]), list.clone())
        .await;
    let _stats_observer = cache
        .mount(QueryKey::from("inventory-stats"), stats.clone())
        .await;

    let (events, receiver) = mpsc::unbounded_channel();
    let feed = ScriptedFeed::new([Step::Live(receiver)]);
    let manager = manager_with(feed, cache.clone(), RealtimeConfig::default());
    let mut state = manager.watch_state();
    manager.start();
    state
        .wait_for(|state| *state == ConnectionState::Subscribed)
        .await
        .expect("manager alive");

    let update = || Ok(ChangeEvent::new(ChangeKind::Update, "inventory_items"));

    events.send(update()).expect("manager listening");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!((list.calls(), stats.calls()), (2, 2));

    tokio::time::advance(Duration::from_millis(2_000)).await;
    events.send(update()).expect("manager listening");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!((list.calls(), stats.calls()), (2, 2));

    tokio::time::advance(Duration::from_millis(4_000)).await;
    events.send(update()).expect("manager listening");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!((list.calls(), stats.calls()), (3, 3));

    manager.stop();
}

#[tokio::test(start_paused = true)]
async fn unmounted_queries_are_marked_stale_without_refetch() {
    let cache = cache();
    let fetcher = CountingFetcher::new();
    let key = QueryKey::from(["inventory", "transactions"]);
    cache
        .fetch_query(&key, fetcher.clone())
        .await
        .expect("initial fetch");

    let (events, receiver) = mpsc::unbounded_channel();
    let feed = ScriptedFeed::new([Step::Live(receiver)]);
    let manager = manager_with(feed, cache.clone(), RealtimeConfig::default());
    let mut state = manager.watch_state();
    manager.start();
    state
        .wait_for(|state| *state == ConnectionState::Subscribed)
        .await
        .expect("manager alive");

    events
        .send(Ok(ChangeEvent::new(
            ChangeKind::Insert,
            "inventory_item_transactions",
        )))
        .expect("manager listening");
    tokio::time::sleep(Duration::from_millis(10)).await;
    manager.stop();

    assert_eq!(fetcher.calls(), 1);
    assert!(cache.snapshot(&key).expect("entry").is_stale);

    let observer = cache.mount(key, fetcher.clone()).await;
    assert_eq!(fetcher.calls(), 2);
    assert!(!observer.current().is_stale);
}

#[tokio::test(start_paused = true)]
async fn stream_error_triggers_reconnect() {
    let (events, receiver) = mpsc::unbounded_channel();
    let feed = ScriptedFeed::new([Step::Live(receiver)]);
    let manager = manager_with(feed.clone(), cache(), RealtimeConfig::default());
    let mut state = manager.watch_state();

    manager.start();
    state
        .wait_for(|state| *state == ConnectionState::Subscribed)
        .await
        .expect("manager alive");

    events
        .send(Err(courtwatch::realtime::RealtimeError::HeartbeatTimeout))
        .expect("manager listening");
    let reconnecting = state
        .wait_for(|state| matches!(state, ConnectionState::Reconnecting { .. }))
        .await
        .expect("manager alive")
        .clone();

    assert_eq!(
        reconnecting,
        ConnectionState::Reconnecting {
            attempt: 1,
            delay: Duration::from_secs(2),
        }
    );
    manager.stop();
}
