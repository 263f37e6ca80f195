//! Configuration module for the tcpframe server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. The result is a
//! single [`Config`] value handed to [`Server::new`](crate::Server::new);
//! nothing reads configuration from global state.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "tcpframe")]
#[command(author = "tcpframe authors")]
#[command(version = "0.1.0")]
#[command(about = "A length-prefixed binary protocol TCP server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of live connections
    #[arg(long)]
    pub max_conn: Option<usize>,

    /// Maximum accepted payload size in bytes (0 = unlimited)
    #[arg(long)]
    pub max_packet_size: Option<u32>,

    /// Number of dispatch workers (0 = dispatch each request on its own task)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and admission settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connections beyond this count are closed on accept
    #[serde(default = "default_max_conn")]
    pub max_conn: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            host: default_host(),
            port: default_port(),
            max_conn: default_max_conn(),
        }
    }
}

/// Wire protocol limits
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    /// Largest accepted payload; 0 disables the check.
    ///
    /// With 0 a single header can declare up to 4 GiB. The body buffer grows
    /// as bytes arrive rather than up front, but a peer that keeps sending
    /// can still drive one connection to that size.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_packet_size: default_max_packet_size(),
        }
    }
}

/// Dispatch worker pool settings
#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Capacity of each worker's request queue
    #[serde(default = "default_queue_len")]
    pub max_task_len: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_task_len: default_queue_len(),
        }
    }
}

/// Per-connection settings
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Capacity of each connection's outbound queue
    #[serde(default = "default_queue_len")]
    pub max_msg_chan_len: usize,
    /// How long a buffered send waits on a full outbound queue
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_msg_chan_len: default_queue_len(),
            send_timeout_ms: default_send_timeout_ms(),
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

fn default_name() -> String {
    "tcpframe".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7777
}

fn default_max_conn() -> usize {
    12000
}

fn default_max_packet_size() -> u32 {
    4096
}

fn default_pool_size() -> usize {
    10
}

fn default_queue_len() -> usize {
    1024
}

fn default_send_timeout_ms() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub max_conn: usize,
    pub max_packet_size: u32,
    pub worker_pool_size: usize,
    pub max_worker_task_len: usize,
    pub max_msg_chan_len: usize,
    pub send_timeout_ms: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut config = Config::from(toml_config);

        // Merge CLI args with TOML config (CLI takes precedence)
        if let Some(host) = cli.host {
            config.host = host;
        }
        if let Some(port) = cli.port {
            config.port = port;
        }
        if let Some(max_conn) = cli.max_conn {
            config.max_conn = max_conn;
        }
        if let Some(max_packet_size) = cli.max_packet_size {
            config.max_packet_size = max_packet_size;
        }
        if let Some(workers) = cli.workers {
            config.worker_pool_size = workers;
        }
        if cli.log_level != "info" {
            config.log_level = cli.log_level;
        }

        Ok(config)
    }

    /// `host:port` string for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl From<TomlConfig> for Config {
    fn from(toml: TomlConfig) -> Self {
        Config {
            name: toml.server.name,
            host: toml.server.host,
            port: toml.server.port,
            max_conn: toml.server.max_conn,
            max_packet_size: toml.protocol.max_packet_size,
            worker_pool_size: toml.workers.pool_size,
            max_worker_task_len: toml.workers.max_task_len,
            max_msg_chan_len: toml.connection.max_msg_chan_len,
            send_timeout_ms: toml.connection.send_timeout_ms,
            log_level: toml.logging.level,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        TomlConfig::default().into()
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{path}': {err}", path = .0.display(), err = .1)]
    TomlParse(PathBuf, toml::de::Error),
}
