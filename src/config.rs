//! Configuration for the mcpi-fast-query command line tool.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::connection::Timeouts;
use crate::dispatcher::ShardingStrategy;
use crate::pipeline::DEFAULT_WINDOW;
use crate::protocol::BlockQueryKind;
use crate::region::{Position, Region, RegionError};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the query tool
#[derive(Parser, Debug)]
#[command(name = "mcpi-fast-query")]
#[command(author = "mcpi-fast-query authors")]
#[command(version = "0.1.0")]
#[command(about = "Bulk block queries against a Minecraft Pi server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server address (e.g., 127.0.0.1:4711)
    #[arg(short, long)]
    pub server: Option<String>,

    /// Maximum in-flight requests per connection
    #[arg(short, long)]
    pub window: Option<usize>,

    /// Number of parallel connections (1 = single pipeline, ordered output)
    #[arg(short = 'n', long)]
    pub connections: Option<usize>,

    /// How queries are split across connections
    #[arg(long, value_enum)]
    pub sharding: Option<ShardingMode>,

    /// What to query at each position
    #[arg(short, long, value_enum)]
    pub kind: Option<QueryMode>,

    /// First corner of the region, as x,y,z
    #[arg(long, allow_hyphen_values = true)]
    pub from: Option<Position>,

    /// Opposite corner of the region, as x,y,z
    #[arg(long, allow_hyphen_values = true)]
    pub to: Option<Position>,

    /// Connect timeout in milliseconds (0 = none)
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Read timeout in milliseconds (0 = none)
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Write timeout in milliseconds (0 = none)
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Sharding strategy names accepted in CLI and config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ShardingMode {
    RoundRobin,
    Contiguous,
}

impl From<ShardingMode> for ShardingStrategy {
    fn from(mode: ShardingMode) -> Self {
        match mode {
            ShardingMode::RoundRobin => ShardingStrategy::RoundRobin,
            ShardingMode::Contiguous => ShardingStrategy::Contiguous,
        }
    }
}

/// Query kind names accepted in CLI and config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum QueryMode {
    Block,
    BlockWithData,
    Height,
}

impl From<QueryMode> for BlockQueryKind {
    fn from(mode: QueryMode) -> Self {
        match mode {
            QueryMode::Block => BlockQueryKind::BlockType,
            QueryMode::BlockWithData => BlockQueryKind::BlockTypeWithData,
            QueryMode::Height => BlockQueryKind::WorldHeight,
        }
    }
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address of the block server
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub write_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: 0,
            write_timeout_ms: 0,
        }
    }
}

/// Pipelining configuration
#[derive(Debug, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_connections")]
    pub connections: usize,
    #[serde(default = "default_sharding")]
    pub sharding: ShardingMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            connections: default_connections(),
            sharding: default_sharding(),
        }
    }
}

/// Region to query
#[derive(Debug, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_kind")]
    pub kind: QueryMode,
    #[serde(default = "default_from")]
    pub from: [i64; 3],
    #[serde(default = "default_to")]
    pub to: [i64; 3],
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            from: default_from(),
            to: default_to(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:4711".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_window() -> usize {
    DEFAULT_WINDOW
}

fn default_connections() -> usize {
    1
}

fn default_sharding() -> ShardingMode {
    ShardingMode::RoundRobin
}

fn default_kind() -> QueryMode {
    QueryMode::BlockWithData
}

fn default_from() -> [i64; 3] {
    [-2, 0, -2]
}

fn default_to() -> [i64; 3] {
    [2, 0, 2]
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: String,
    pub timeouts: Timeouts,
    pub window: usize,
    pub connections: usize,
    pub sharding: ShardingStrategy,
    pub kind: BlockQueryKind,
    pub region: Region,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already parsed CLI arguments.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents)
                .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let server = toml_config.server;
        let from = cli.from.unwrap_or_else(|| toml_config.query.from.into());
        let to = cli.to.unwrap_or_else(|| toml_config.query.to.into());
        let region = Region::new(from, to).map_err(ConfigError::InvalidRegion)?;

        Ok(Config {
            server: cli.server.unwrap_or(server.address),
            timeouts: Timeouts {
                connect: millis(cli.connect_timeout_ms.unwrap_or(server.connect_timeout_ms)),
                read: millis(cli.read_timeout_ms.unwrap_or(server.read_timeout_ms)),
                write: millis(cli.write_timeout_ms.unwrap_or(server.write_timeout_ms)),
            },
            window: cli.window.unwrap_or(toml_config.pipeline.window).max(1),
            connections: cli
                .connections
                .unwrap_or(toml_config.pipeline.connections)
                .max(1),
            sharding: cli
                .sharding
                .unwrap_or(toml_config.pipeline.sharding)
                .into(),
            kind: cli.kind.unwrap_or(toml_config.query.kind).into(),
            region,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .path.display(), .source)]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {}", .path.display(), .source)]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid query region: {0}")]
    InvalidRegion(#[source] RegionError),
}
