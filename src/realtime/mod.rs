//! Realtime invalidation layer.
//!
//! A [`SubscriptionManager`] keeps one channel open to the database change
//! feed. Every delivered [`ChangeEvent`] goes through the
//! [`InvalidationPipeline`]: the [`ThrottleGuard`] admits at most one change per
//! table per cool-down window, the [`InvalidationMap`] resolves the table to the
//! query keys that read from it, and the [`CacheInvalidator`] marks those keys
//! stale and refetches what is mounted.
//!
//! ## Configuration
//!
//! ```toml
//! [realtime]
//! url = "wss://project.example.co/realtime/v1"
//! channel = "db-changes"
//! tables = ["rooms", "inventory_items"]
//!
//! [invalidation]
//! cooldown_ms = 5000
//!
//! [reconnect]
//! base_delay_ms = 2000
//! max_delay_ms = 60000
//! ```

mod backoff;
mod config;
mod error;
mod events;
mod feed;
mod manager;
mod map;
mod phoenix;
mod pipeline;
mod throttle;

pub use backoff::ReconnectBackoff;
pub use config::RealtimeConfig;
pub use error::RealtimeError;
pub use events::{ChangeEvent, ChangeKind};
pub use feed::{ChangeFeed, ChangeStream, SubscriptionSpec};
pub use manager::{ConnectionState, SubscriptionManager};
pub use map::{DEFAULT_WATCHED_TABLES, InvalidationMap, MapError};
pub use phoenix::{PhoenixConfig, PhoenixFeed};
pub use pipeline::{CacheInvalidator, InvalidationPipeline};
pub use throttle::ThrottleGuard;
