//! Configuration module for the echo servers.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Default port of the echo service.
pub const DEFAULT_PORT: u16 = 4025;
/// Largest message handled by a single read.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 128;
pub const DEFAULT_BACKLOG: i32 = 10000;
/// Connections the tables are pre-sized for.
pub const DEFAULT_EXPECTED_CONNECTIONS: usize = 11000;
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1;
pub const DEFAULT_POOL_GC_THRESHOLD: usize = 10;
pub const DEFAULT_SIMPLE_GC_THRESHOLD: usize = 300;

/// Concurrency architecture of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    /// Poll dispatcher plus fixed worker pool
    #[default]
    Pool,
    /// Single-threaded poll loop
    Simple,
    /// One thread per connection
    Threaded,
}

impl ServerKind {
    fn default_gc_threshold(self) -> usize {
        match self {
            ServerKind::Simple => DEFAULT_SIMPLE_GC_THRESHOLD,
            ServerKind::Pool | ServerKind::Threaded => DEFAULT_POOL_GC_THRESHOLD,
        }
    }
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "echo-pool")]
#[command(author = "echo-pool authors")]
#[command(version = "0.1.0")]
#[command(about = "TCP echo server with several concurrency architectures", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:4025)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Server architecture
    #[arg(short = 's', long, value_enum)]
    pub server: Option<ServerKind>,

    /// Number of worker threads (pool server)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Job queue capacity, 0 for unbounded (pool server)
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Closed connections tolerated before compaction
    #[arg(long)]
    pub gc_threshold: Option<usize>,

    /// Readiness wait timeout in milliseconds
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Maximum bytes taken by one read
    #[arg(short = 'm', long)]
    pub max_message_size: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub io: IoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Server architecture
    #[serde(default)]
    pub kind: ServerKind,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_expected_connections")]
    pub expected_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            kind: ServerKind::default(),
            backlog: default_backlog(),
            expected_connections: default_expected_connections(),
        }
    }
}

/// Worker pool and dispatcher configuration
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// 0 = unbounded
    #[serde(default)]
    pub queue_capacity: usize,
    /// Defaults depend on the server kind
    pub gc_threshold: Option<usize>,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: 0,
            gc_threshold: None,
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

/// Socket I/O configuration
#[derive(Debug, Deserialize)]
pub struct IoConfig {
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
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

fn default_listen() -> String {
    format!("0.0.0.0:{DEFAULT_PORT}")
}

fn default_backlog() -> i32 {
    DEFAULT_BACKLOG
}

fn default_expected_connections() -> usize {
    DEFAULT_EXPECTED_CONNECTIONS
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_poll_timeout_ms() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub server: ServerKind,
    pub backlog: i32,
    pub expected_connections: usize,
    pub workers: usize,
    pub queue_capacity: usize,
    pub gc_threshold: usize,
    pub poll_timeout_ms: u64,
    pub max_message_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let kind = ServerKind::default();
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            server: kind,
            backlog: DEFAULT_BACKLOG,
            expected_connections: DEFAULT_EXPECTED_CONNECTIONS,
            workers: DEFAULT_WORKERS,
            queue_capacity: 0,
            gc_threshold: kind.default_gc_threshold(),
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen_str = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen_str
            .parse()
            .map_err(|_| ConfigError::Invalid("listen", listen_str.clone()))?;
        let server = cli.server.unwrap_or(toml_config.server.kind);

        let config = Config {
            listen,
            server,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            expected_connections: toml_config.server.expected_connections,
            workers: cli.workers.unwrap_or(toml_config.pool.workers),
            queue_capacity: cli
                .queue_capacity
                .unwrap_or(toml_config.pool.queue_capacity),
            gc_threshold: cli
                .gc_threshold
                .or(toml_config.pool.gc_threshold)
                .unwrap_or_else(|| server.default_gc_threshold()),
            poll_timeout_ms: cli
                .poll_timeout_ms
                .unwrap_or(toml_config.pool.poll_timeout_ms),
            max_message_size: cli
                .max_message_size
                .unwrap_or(toml_config.io.max_message_size),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers", "0".to_string()));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("max_message_size", "0".to_string()));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog", self.backlog.to_string()));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid value for {0}: '{1}'")]
    Invalid(&'static str, String),
}
