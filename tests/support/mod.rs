#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use courtwatch::cache::{FetchError, QueryData, QueryFetcher, QueryKey};
use courtwatch::realtime::{
    ChangeEvent, ChangeFeed, ChangeStream, RealtimeError, SubscriptionSpec,
};
use futures::StreamExt;
use futures::stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One scripted answer to `subscribe`.
pub enum Step {
    Fail,
    /// Subscribe succeeds, delivers the events, then the stream ends.
    Events(Vec<ChangeEvent>),
    /// Subscribe succeeds and the stream follows the sender held by the test.
    Live(mpsc::UnboundedReceiver<Result<ChangeEvent, RealtimeError>>),
}

/// Change feed that plays back a script, then fails every later attempt.
#[derive(Default)]
pub struct ScriptedFeed {
    script: Mutex<VecDeque<Step>>,
    attempts: Mutex<Vec<Instant>>,
    specs: Mutex<Vec<SubscriptionSpec>>,
}

impl ScriptedFeed {
    pub fn new(script: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Default::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Self::new([])
    }

    /// Instants at which `subscribe` was called.
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().expect("attempts lock").clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().expect("attempts lock").len()
    }

    pub fn last_spec(&self) -> Option<SubscriptionSpec> {
        self.specs.lock().expect("specs lock").last().cloned()
    }
}

#[async_trait]
impl ChangeFeed for ScriptedFeed {
    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<ChangeStream, RealtimeError> {
        self.attempts.lock().expect("attempts lock").push(Instant::now());
        self.specs.lock().expect("specs lock").push(spec.clone());

        let step = self.script.lock().expect("script lock").pop_front();
        match step {
            None | Some(Step::Fail) => Err(RealtimeError::rejected("scripted failure")),
            Some(Step::Events(events)) => Ok(stream::iter(events.into_iter().map(Ok)).boxed()),
            Some(Step::Live(receiver)) => Ok(stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|item| (item, receiver))
            })
            .boxed()),
        }
    }
}

/// Fetcher that counts calls per instance and returns the call number.
#[derive(Default)]
pub struct CountingFetcher {
    calls: AtomicUsize,
}

impl CountingFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryFetcher for CountingFetcher {
    async fn fetch(&self, key: &QueryKey) -> Result<QueryData, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({ "key": key.to_string(), "call": call }))
    }
}
