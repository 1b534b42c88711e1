//! Realtime cache invalidation for the courthouse facilities dashboard.
//!
//! Database change events arrive over a single realtime channel, pass a per-table
//! throttle, are resolved to the query keys that depend on the changed table, and
//! finally mark those keys stale in the in-process [`cache::QueryCache`].

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
pub mod realtime;
