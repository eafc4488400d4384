//! Configuration for the echo server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echo-chamber")]
#[command(version = "0.1.0")]
#[command(about = "A concurrent TCP echo server with idle-connection eviction", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Accept backlog for the listening socket
    #[arg(short = 'b', long)]
    pub backlog: Option<u32>,

    /// Number of worker threads (0 = one per CPU core)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Idle timeout in seconds before a quiet connection is evicted
    #[arg(short = 't', long)]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Append log output to this file in addition to the console
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub idle: IdleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Accept backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Number of worker threads (0 = one per core)
    pub workers: Option<usize>,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Per-read buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            workers: None,
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// Idle-eviction configuration
#[derive(Debug, Deserialize)]
pub struct IdleConfig {
    /// Seconds of inactivity before a connection is evicted
    #[serde(default = "default_idle_timeout_secs")]
    pub timeout_secs: u64,
    /// Supervisor wake cadence in milliseconds
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_idle_timeout_secs(),
            tick_millis: default_tick_millis(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional append-only log file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_backlog() -> u32 {
    10
}

fn default_max_connections() -> usize {
    10_000
}

fn default_buffer_size() -> usize {
    4 * 1024
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_tick_millis() -> u64 {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: u32,
    /// 0 means one worker per CPU core.
    pub workers: usize,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub idle_timeout: Duration,
    pub tick_interval: Duration,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            workers: 0,
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            idle_timeout: Duration::from_secs(default_idle_timeout_secs()),
            tick_interval: Duration::from_millis(default_tick_millis()),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            workers: cli
                .workers
                .or(toml_config.server.workers)
                .unwrap_or_default(),
            max_connections: toml_config.server.max_connections,
            buffer_size: toml_config.server.buffer_size,
            idle_timeout: Duration::from_secs(
                cli.idle_timeout.unwrap_or(toml_config.idle.timeout_secs),
            ),
            tick_interval: Duration::from_millis(toml_config.idle.tick_millis),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            log_file: cli.log_file.or(toml_config.logging.file),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
