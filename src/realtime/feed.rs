//! Change feed abstraction.
//!
//! A [`ChangeFeed`] opens one subscription channel at a time. The manager owns
//! the returned stream; dropping it tears the channel down.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::error::RealtimeError;
use super::events::ChangeEvent;

/// Events of one subscribed channel. An `Err` item or the end of the stream
/// means the channel is gone.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, RealtimeError>>;

/// Which changes to listen for: every event kind on each table of `schema`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub channel: String,
    pub schema: String,
    pub tables: Vec<String>,
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a channel and resolve once the backend acknowledged the subscription.
    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<ChangeStream, RealtimeError>;
}
