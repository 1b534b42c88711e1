use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the courtwatch binary.
#[derive(Debug, Parser)]
#[command(
    name = "courtwatch",
    version,
    about = "Realtime cache invalidation for the facilities dashboard"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "COURTWATCH_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Subscribe to database changes and invalidate dependent queries until interrupted.
    Listen(Box<ListenArgs>),
    /// Print the invalidation map for the watched tables and fail on unmapped tables.
    #[command(name = "check-map")]
    CheckMap(CheckMapArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ListenArgs {
    #[command(flatten)]
    pub overrides: ListenOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ListenOverrides {
    #[command(flatten)]
    pub tables: TableOverride,

    /// Override the realtime endpoint (ws:// or wss://).
    #[arg(long = "realtime-url", value_name = "URL")]
    pub realtime_url: Option<String>,

    /// Override the API key sent with the websocket handshake.
    #[arg(long = "api-key", env = "COURTWATCH_API_KEY", value_name = "KEY")]
    pub api_key: Option<String>,

    /// Override the per-table invalidation cool-down window.
    #[arg(long = "cooldown-ms", value_name = "MILLIS")]
    pub cooldown_ms: Option<u64>,

    /// Override the first reconnect delay.
    #[arg(long = "reconnect-base-ms", value_name = "MILLIS")]
    pub reconnect_base_ms: Option<u64>,

    /// Override the reconnect delay ceiling.
    #[arg(long = "reconnect-max-ms", value_name = "MILLIS")]
    pub reconnect_max_ms: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct TableOverride {
    /// Replace the watched table set; repeat for each table.
    #[arg(long = "table", value_name = "TABLE")]
    pub tables: Vec<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CheckMapArgs {
    #[command(flatten)]
    pub tables: TableOverride,

    /// Emit the map as JSON instead of one line per table.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}
