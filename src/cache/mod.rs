//! Courtwatch query cache.
//!
//! Holds fetched query results keyed by [`QueryKey`], tracks which keys have
//! mounted consumers, and exposes prefix invalidation for the realtime layer.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! gc_time_seconds = 300
//! max_concurrent_refetches = 8
//! ```

mod config;
mod keys;
mod lock;
mod store;

pub use config::CacheConfig;
pub use keys::QueryKey;
pub use store::{
    FetchError, InvalidationOutcome, QueryCache, QueryData, QueryFetcher, QueryObserver,
    QuerySnapshot, QueryStatus,
};

pub(crate) use lock::MutexExt;
