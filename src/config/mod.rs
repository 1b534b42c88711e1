//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{collections::BTreeMap, num::NonZeroUsize, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::QueryKey;
use crate::realtime::{DEFAULT_WATCHED_TABLES, InvalidationMap};

mod cli;

pub use cli::{CheckMapArgs, CliArgs, Command, ListenArgs, ListenOverrides, TableOverride};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "courtwatch";
const DEFAULT_CHANNEL: &str = "db-changes";
const DEFAULT_SCHEMA: &str = "public";
const DEFAULT_HEARTBEAT_SECS: u64 = 25;
const DEFAULT_JOIN_TIMEOUT_SECS: u64 = 10;
const DEFAULT_COOLDOWN_MS: u64 = 5_000;
const DEFAULT_RECONNECT_BASE_MS: u64 = 2_000;
const DEFAULT_RECONNECT_MAX_MS: u64 = 60_000;
const DEFAULT_GC_TIME_SECS: u64 = 300;
const DEFAULT_MAX_CONCURRENT_REFETCHES: usize = 8;

/// Fully validated runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub realtime: RealtimeSettings,
    pub invalidation: InvalidationSettings,
    pub reconnect: ReconnectSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Connection details for the hosted realtime endpoint.
#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    /// Base websocket URL; required by `listen` only.
    pub endpoint: Option<Url>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub channel: String,
    pub schema: String,
    pub tables: Vec<String>,
    pub heartbeat: Duration,
    pub join_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct InvalidationSettings {
    pub cooldown_ms: u64,
    /// Per-table replacements for the built-in map.
    pub tables: BTreeMap<String, Vec<QueryKey>>,
}

#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub gc_time: Duration,
    pub max_concurrent_refetches: NonZeroUsize,
}

/// Errors surfaced while building settings.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

impl Settings {
    /// Built-in courthouse map with the configured per-table replacements applied.
    pub fn invalidation_map(&self) -> InvalidationMap {
        let mut map = InvalidationMap::default();
        for (table, keys) in &self.invalidation.tables {
            map.insert(table.clone(), keys.clone());
        }
        map
    }
}

/// Load settings from config files, environment and the parsed CLI arguments.
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("COURTWATCH")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("realtime.tables")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Listen(args)) => raw.apply_listen_overrides(&args.overrides),
        Some(Command::CheckMap(args)) => raw.apply_table_override(&args.tables),
        None => raw.apply_listen_overrides(&ListenOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    realtime: RawRealtimeSettings,
    invalidation: RawInvalidationSettings,
    reconnect: RawReconnectSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_listen_overrides(&mut self, overrides: &ListenOverrides) {
        if let Some(url) = overrides.realtime_url.as_ref() {
            self.realtime.url = Some(url.clone());
        }
        if let Some(key) = overrides.api_key.as_ref() {
            self.realtime.api_key = Some(key.clone());
        }
        if let Some(cooldown) = overrides.cooldown_ms {
            self.invalidation.cooldown_ms = Some(cooldown);
        }
        if let Some(base) = overrides.reconnect_base_ms {
            self.reconnect.base_delay_ms = Some(base);
        }
        if let Some(max) = overrides.reconnect_max_ms {
            self.reconnect.max_delay_ms = Some(max);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }

        self.apply_table_override(&overrides.tables);
    }

    fn apply_table_override(&mut self, overrides: &TableOverride) {
        if !overrides.tables.is_empty() {
            self.realtime.tables = Some(overrides.tables.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            realtime,
            invalidation,
            reconnect,
            cache,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            realtime: build_realtime_settings(realtime)?,
            invalidation: build_invalidation_settings(invalidation)?,
            reconnect: build_reconnect_settings(reconnect)?,
            cache: build_cache_settings(cache)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_realtime_settings(realtime: RawRealtimeSettings) -> Result<RealtimeSettings, LoadError> {
    let endpoint = match non_blank(realtime.url) {
        Some(value) => Some(parse_endpoint(&value)?),
        None => None,
    };

    let channel = non_blank(realtime.channel).unwrap_or_else(|| DEFAULT_CHANNEL.to_string());
    let schema = non_blank(realtime.schema).unwrap_or_else(|| DEFAULT_SCHEMA.to_string());

    let tables = match realtime.tables {
        Some(tables) => {
            let mut cleaned: Vec<String> = Vec::with_capacity(tables.len());
            for table in tables {
                let table = table.trim();
                if table.is_empty() {
                    return Err(LoadError::invalid(
                        "realtime.tables",
                        "table names must not be empty",
                    ));
                }
                if !cleaned.iter().any(|existing| existing == table) {
                    cleaned.push(table.to_string());
                }
            }
            if cleaned.is_empty() {
                return Err(LoadError::invalid(
                    "realtime.tables",
                    "at least one table must be watched",
                ));
            }
            cleaned
        }
        None => DEFAULT_WATCHED_TABLES
            .iter()
            .map(|table| table.to_string())
            .collect(),
    };

    let heartbeat_secs = realtime.heartbeat_seconds.unwrap_or(DEFAULT_HEARTBEAT_SECS);
    if heartbeat_secs == 0 {
        return Err(LoadError::invalid(
            "realtime.heartbeat_seconds",
            "must be greater than zero",
        ));
    }

    let join_timeout_secs = realtime
        .join_timeout_seconds
        .unwrap_or(DEFAULT_JOIN_TIMEOUT_SECS);
    if join_timeout_secs == 0 {
        return Err(LoadError::invalid(
            "realtime.join_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(RealtimeSettings {
        endpoint,
        api_key: non_blank(realtime.api_key),
        access_token: non_blank(realtime.access_token),
        channel,
        schema,
        tables,
        heartbeat: Duration::from_secs(heartbeat_secs),
        join_timeout: Duration::from_secs(join_timeout_secs),
    })
}

fn build_invalidation_settings(
    invalidation: RawInvalidationSettings,
) -> Result<InvalidationSettings, LoadError> {
    let tables = invalidation.tables.unwrap_or_default();
    for (table, keys) in &tables {
        if table.trim().is_empty() {
            return Err(LoadError::invalid(
                "invalidation.tables",
                "table names must not be empty",
            ));
        }
        if keys.iter().any(QueryKey::is_empty) {
            return Err(LoadError::invalid(
                "invalidation.tables",
                format!("`{table}` lists an empty query key"),
            ));
        }
    }

    Ok(InvalidationSettings {
        cooldown_ms: invalidation.cooldown_ms.unwrap_or(DEFAULT_COOLDOWN_MS),
        tables,
    })
}

fn build_reconnect_settings(
    reconnect: RawReconnectSettings,
) -> Result<ReconnectSettings, LoadError> {
    let base_delay_ms = reconnect
        .base_delay_ms
        .unwrap_or(DEFAULT_RECONNECT_BASE_MS);
    if base_delay_ms == 0 {
        return Err(LoadError::invalid(
            "reconnect.base_delay_ms",
            "must be greater than zero",
        ));
    }

    let max_delay_ms = reconnect.max_delay_ms.unwrap_or(DEFAULT_RECONNECT_MAX_MS);
    if max_delay_ms < base_delay_ms {
        return Err(LoadError::invalid(
            "reconnect.max_delay_ms",
            format!("must be at least reconnect.base_delay_ms ({base_delay_ms})"),
        ));
    }

    Ok(ReconnectSettings {
        base_delay_ms,
        max_delay_ms,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let gc_time_secs = cache.gc_time_seconds.unwrap_or(DEFAULT_GC_TIME_SECS);
    if gc_time_secs == 0 {
        return Err(LoadError::invalid(
            "cache.gc_time_seconds",
            "must be greater than zero",
        ));
    }
    let gc_time = Duration::from_secs(gc_time_secs);

    let concurrency = cache
        .max_concurrent_refetches
        .unwrap_or(DEFAULT_MAX_CONCURRENT_REFETCHES);
    let max_concurrent_refetches = NonZeroUsize::new(concurrency).ok_or_else(|| {
        LoadError::invalid("cache.max_concurrent_refetches", "must be greater than zero")
    })?;

    Ok(CacheSettings {
        gc_time,
        max_concurrent_refetches,
    })
}

fn parse_endpoint(value: &str) -> Result<Url, LoadError> {
    let url = Url::parse(value)
        .map_err(|err| LoadError::invalid("realtime.url", format!("invalid url: {err}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(LoadError::invalid(
            "realtime.url",
            format!("unsupported scheme `{other}`, expected ws or wss"),
        )),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRealtimeSettings {
    url: Option<String>,
    api_key: Option<String>,
    access_token: Option<String>,
    channel: Option<String>,
    schema: Option<String>,
    tables: Option<Vec<String>>,
    heartbeat_seconds: Option<u64>,
    join_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawInvalidationSettings {
    cooldown_ms: Option<u64>,
    tables: Option<BTreeMap<String, Vec<QueryKey>>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawReconnectSettings {
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    gc_time_seconds: Option<u64>,
    max_concurrent_refetches: Option<usize>,
}
