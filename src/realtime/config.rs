//! Realtime subscription configuration.

use std::time::Duration;

use crate::config::Settings;

use super::feed::SubscriptionSpec;
use super::map::DEFAULT_WATCHED_TABLES;

const DEFAULT_COOLDOWN_MS: u64 = 5_000;
const DEFAULT_BASE_DELAY_MS: u64 = 2_000;
const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
const DEFAULT_CHANNEL: &str = "db-changes";
const DEFAULT_SCHEMA: &str = "public";

/// Parameters fixed at construction of a [`SubscriptionManager`](super::SubscriptionManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeConfig {
    pub watched_tables: Vec<String>,
    /// Per-table cool-down window (ms).
    pub cooldown_ms: u64,
    /// First reconnect delay (ms).
    pub base_delay_ms: u64,
    /// Reconnect delay ceiling (ms).
    pub max_delay_ms: u64,
    pub channel: String,
    pub schema: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            watched_tables: DEFAULT_WATCHED_TABLES
                .iter()
                .map(|table| table.to_string())
                .collect(),
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            channel: DEFAULT_CHANNEL.to_string(),
            schema: DEFAULT_SCHEMA.to_string(),
        }
    }
}

impl From<&Settings> for RealtimeConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            watched_tables: settings.realtime.tables.clone(),
            cooldown_ms: settings.invalidation.cooldown_ms,
            base_delay_ms: settings.reconnect.base_delay_ms,
            max_delay_ms: settings.reconnect.max_delay_ms,
            channel: settings.realtime.channel.clone(),
            schema: settings.realtime.schema.clone(),
        }
    }
}

impl RealtimeConfig {
    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.watched_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// What the change feed is asked to subscribe to.
    pub fn subscription_spec(&self) -> SubscriptionSpec {
        SubscriptionSpec {
            channel: self.channel.clone(),
            schema: self.schema.clone(),
            tables: self.watched_tables.clone(),
        }
    }
}
