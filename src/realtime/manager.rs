//! Channel lifecycle: subscribe, route events, reconnect with backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use metrics::{counter, gauge};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::MutexExt;

use super::backoff::ReconnectBackoff;
use super::config::RealtimeConfig;
use super::error::RealtimeError;
use super::feed::{ChangeFeed, SubscriptionSpec};
use super::pipeline::InvalidationPipeline;

const METRIC_RECONNECTS_TOTAL: &str = "courtwatch_realtime_reconnects_total";
const METRIC_CONNECTED: &str = "courtwatch_realtime_connected";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never started.
    Idle,
    Connecting,
    Subscribed,
    /// Waiting `delay` before retrying after `attempt` consecutive failures.
    Reconnecting { attempt: u32, delay: Duration },
    Stopped,
}

/// Owns the single realtime channel.
///
/// At most one subscription loop runs per manager. Failures never leave the
/// loop; they only schedule the next attempt.
pub struct SubscriptionManager {
    config: RealtimeConfig,
    feed: Arc<dyn ChangeFeed>,
    pipeline: Arc<InvalidationPipeline>,
    state: watch::Sender<ConnectionState>,
    /// Bumped on every `start`; a loop only publishes while it holds the latest epoch.
    epoch: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionManager {
    pub fn new(
        config: RealtimeConfig,
        feed: Arc<dyn ChangeFeed>,
        pipeline: Arc<InvalidationPipeline>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            config,
            feed,
            pipeline,
            state,
            epoch: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<InvalidationPipeline> {
        &self.pipeline
    }

    /// Spawn the subscription loop on the current Tokio runtime.
    ///
    /// A loop that is already running is torn down first; the new loop waits
    /// for it to finish before opening its own channel.
    pub fn start(&self) {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(error = %err, "Cannot start realtime subscription outside a Tokio runtime");
                return;
            }
        };

        let mut task = self.task.lock_recovering("start");
        let previous = task.take();
        if let Some(previous) = previous.as_ref() {
            debug!("Tearing down previous realtime channel");
            previous.abort();
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(ConnectionState::Connecting);
        let channel = ChannelLoop {
            spec: self.config.subscription_spec(),
            feed: Arc::clone(&self.feed),
            pipeline: Arc::clone(&self.pipeline),
            state: self.state.clone(),
            epoch,
            current_epoch: Arc::clone(&self.epoch),
            backoff: ReconnectBackoff::new(self.config.base_delay(), self.config.max_delay()),
        };
        *task = Some(runtime.spawn(channel.run(previous)));
        info!(
            channel = %self.config.channel,
            tables = self.config.watched_tables.len(),
            "Realtime subscription started"
        );
    }

    /// Tear down the channel and cancel any pending reconnect. Idempotent.
    ///
    /// The aborted loop stays registered so a later [`start`](Self::start)
    /// waits for it to unwind. Invalidations already dispatched to the cache
    /// keep running.
    pub fn stop(&self) {
        let stopped = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Stopped {
                return false;
            }
            *state = ConnectionState::Stopped;
            gauge!(METRIC_CONNECTED).set(0.0);
            true
        });

        let task = self.task.lock_recovering("stop");
        if let Some(task) = task.as_ref() {
            task.abort();
            if stopped {
                info!("Realtime subscription stopped");
            }
        }
    }

    /// True while a subscription loop is alive and not stopped.
    pub fn is_running(&self) -> bool {
        if *self.state.borrow() == ConnectionState::Stopped {
            return false;
        }
        self.task
            .lock_recovering("is_running")
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ChannelLoop {
    spec: SubscriptionSpec,
    feed: Arc<dyn ChangeFeed>,
    pipeline: Arc<InvalidationPipeline>,
    state: watch::Sender<ConnectionState>,
    epoch: u64,
    current_epoch: Arc<AtomicU64>,
    backoff: ReconnectBackoff,
}

impl ChannelLoop {
    async fn run(mut self, previous: Option<JoinHandle<()>>) {
        if let Some(previous) = previous {
            let _ = previous.await;
        }

        loop {
            self.publish(ConnectionState::Connecting);
            match self.feed.subscribe(&self.spec).await {
                Ok(mut events) => {
                    self.backoff.reset();
                    self.publish(ConnectionState::Subscribed);

                    let reason = loop {
                        match events.next().await {
                            Some(Ok(event)) => {
                                let _ = self.pipeline.dispatch(&event);
                            }
                            Some(Err(err)) => break err,
                            None => break RealtimeError::closed("change stream ended"),
                        }
                    };
                    drop(events);

                    warn!(error = %reason, "Realtime channel disconnected");
                }
                Err(err) => {
                    warn!(error = %err, "Realtime subscription failed");
                }
            }

            let delay = self.backoff.next_delay();
            let attempt = self.backoff.attempt();
            counter!(METRIC_RECONNECTS_TOTAL).increment(1);
            self.publish(ConnectionState::Reconnecting { attempt, delay });
            info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Scheduling realtime reconnect"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Publish a loop state unless the manager was stopped or restarted meanwhile.
    ///
    /// The connected gauge moves under the same watch lock `stop` takes, so a
    /// loop still being polled after `stop` cannot raise it again.
    fn publish(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            let superseded = self.current_epoch.load(Ordering::SeqCst) != self.epoch;
            if superseded || *state == ConnectionState::Stopped || *state == next {
                return false;
            }
            let connected = if next == ConnectionState::Subscribed { 1.0 } else { 0.0 };
            gauge!(METRIC_CONNECTED).set(connected);
            *state = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::cache::{InvalidationOutcome, QueryKey};
    use crate::realtime::feed::ChangeStream;
    use crate::realtime::map::InvalidationMap;
    use crate::realtime::pipeline::CacheInvalidator;

    struct NoopInvalidator;

    #[async_trait]
    impl CacheInvalidator for NoopInvalidator {
        async fn invalidate(&self, _keys: &[QueryKey]) -> InvalidationOutcome {
            InvalidationOutcome::default()
        }
    }

    #[derive(Default)]
    struct RefusingFeed {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ChangeFeed for RefusingFeed {
        async fn subscribe(&self, _spec: &SubscriptionSpec) -> Result<ChangeStream, RealtimeError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(RealtimeError::rejected("not today"))
        }
    }

    fn manager(feed: Arc<RefusingFeed>) -> SubscriptionManager {
        let config = RealtimeConfig::default();
        let pipeline = Arc::new(InvalidationPipeline::new(
            &config,
            InvalidationMap::default(),
            Arc::new(NoopInvalidator),
        ));
        SubscriptionManager::new(config, feed, pipeline)
    }

    #[test]
    fn start_outside_runtime_is_a_logged_no_op() {
        let manager = manager(Arc::new(RefusingFeed::default()));

        manager.start();

        assert!(!manager.is_running());
        assert_eq!(manager.state(), ConnectionState::Idle);
    }

    #[test]
    fn stop_is_idempotent() {
        let manager = manager(Arc::new(RefusingFeed::default()));

        manager.stop();
        manager.stop();

        assert_eq!(manager.state(), ConnectionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_subscription_schedules_backoff() {
        let feed = Arc::new(RefusingFeed::default());
        let manager = manager(Arc::clone(&feed));
        let mut state = manager.watch_state();

        manager.start();
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
        assert_eq!(feed.attempts.load(Ordering::SeqCst), 1);

        manager.stop();
        assert!(!manager.is_running());
        assert_eq!(manager.state(), ConnectionState::Stopped);
    }

    struct GatedFeed {
        attempts: AtomicUsize,
        live: AtomicUsize,
        release: tokio::sync::Notify,
    }

    struct LiveGuard<'a>(&'a AtomicUsize);

    impl Drop for LiveGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ChangeFeed for GatedFeed {
        async fn subscribe(&self, _spec: &SubscriptionSpec) -> Result<ChangeStream, RealtimeError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let overlapping = self.live.fetch_add(1, Ordering::SeqCst);
            let _guard = LiveGuard(&self.live);
            assert_eq!(overlapping, 0, "two subscription attempts in flight");
            self.release.notified().await;
            Err(RealtimeError::rejected("released"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_stop_waits_for_the_aborted_loop() {
        let feed = Arc::new(GatedFeed {
            attempts: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            release: tokio::sync::Notify::new(),
        });
        let config = RealtimeConfig::default();
        let pipeline = Arc::new(InvalidationPipeline::new(
            &config,
            InvalidationMap::default(),
            Arc::new(NoopInvalidator),
        ));
        let manager = SubscriptionManager::new(config, feed.clone(), pipeline);

        manager.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(feed.attempts.load(Ordering::SeqCst), 1);

        manager.stop();
        assert!(!manager.is_running());
        manager.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(feed.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(feed.live.load(Ordering::SeqCst), 1);
        assert!(manager.is_running());
        manager.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_state_is_never_overwritten_by_the_loop() {
        let feed = Arc::new(RefusingFeed::default());
        let manager = manager(Arc::clone(&feed));
        let mut state = manager.watch_state();

        manager.start();
        state
            .wait_for(|state| matches!(state, ConnectionState::Reconnecting { .. }))
            .await
            .expect("manager alive");
        manager.stop();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(manager.state(), ConnectionState::Stopped);
        assert_eq!(feed.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_the_running_loop() {
        let feed = Arc::new(RefusingFeed::default());
        let manager = manager(Arc::clone(&feed));

        manager.start();
        manager.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(feed.attempts.load(Ordering::SeqCst), 1);
        assert!(manager.is_running());
        manager.stop();
    }
}
