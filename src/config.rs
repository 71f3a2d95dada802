//! Configuration module for echo-over-redis.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echo-over-redis")]
#[command(author = "echo-over-redis authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP echo server that probes a Redis store for every chunk", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:55555)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Address of the Redis store (e.g., 127.0.0.1:6379)
    #[arg(short = 's', long)]
    pub store: Option<String>,

    /// What to write back for each chunk
    #[arg(short = 'r', long, value_enum)]
    pub reply: Option<ReplyMode>,

    /// Number of worker threads (1 = single-threaded event loop)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// What a session writes back for each chunk it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    /// The chunk exactly as received; the probe result is only observed.
    #[default]
    Chunk,
    /// The store's reply to the probe, or the chunk if the probe failed.
    Store,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum number of concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Chunks a connection may have waiting on their probe
    #[serde(default = "default_pipeline_depth")]
    pub pipeline_depth: usize,
    #[serde(default)]
    pub reply: ReplyMode,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            pipeline_depth: default_pipeline_depth(),
            reply: ReplyMode::default(),
            workers: None,
        }
    }
}

/// Store-related configuration
#[derive(Debug, Deserialize)]
pub struct StoreSection {
    /// Address of the store
    #[serde(default = "default_store_address")]
    pub address: String,
    /// Username for AUTH; `default` with an empty password skips AUTH
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Name reported to the store via SETNAME (empty = none)
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Database selected after connecting
    pub database: Option<u32>,
    /// Negotiate RESP3 with HELLO
    #[serde(default = "default_true")]
    pub resp3: bool,
    /// Command used for each probe; the chunk is its only argument
    #[serde(default = "default_probe_command")]
    pub probe_command: String,
    /// Argument of the health check PING
    #[serde(default = "default_client_name")]
    pub health_check_id: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Interval between health checks (0 = disabled)
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Wait before reconnecting (0 = never reconnect)
    #[serde(default = "default_reconnect_wait_ms")]
    pub reconnect_wait_ms: u64,
    /// TCP keepalive idle time (0 = disabled)
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Probes that may queue for the store connection
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Largest payload accepted as a command argument
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            address: default_store_address(),
            username: default_username(),
            password: String::new(),
            client_name: default_client_name(),
            database: None,
            resp3: true,
            probe_command: default_probe_command(),
            health_check_id: default_client_name(),
            connect_timeout_ms: default_connect_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            reconnect_wait_ms: default_reconnect_wait_ms(),
            keepalive_secs: default_keepalive_secs(),
            queue_depth: default_queue_depth(),
            max_payload: default_max_payload(),
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
    "127.0.0.1:55555".to_string()
}

fn default_max_connections() -> usize {
    10000
}

fn default_pipeline_depth() -> usize {
    64
}

fn default_store_address() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_username() -> String {
    "default".to_string()
}

fn default_client_name() -> String {
    "echo-over-redis".to_string()
}

fn default_true() -> bool {
    true
}

fn default_probe_command() -> String {
    "PING".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    1_000
}

fn default_health_check_interval_ms() -> u64 {
    2_000
}

fn default_reconnect_wait_ms() -> u64 {
    1_000
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_queue_depth() -> usize {
    1024
}

fn default_max_payload() -> usize {
    512 * 1024 * 1024 // proto-max-bulk-len
}

fn default_log_level() -> String {
    "info".to_string()
}

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Resolved listener settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub max_connections: usize,
    pub pipeline_depth: usize,
    pub reply: ReplyMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let section = ServerSection::default();
        Self {
            listen: section.listen,
            max_connections: section.max_connections,
            pipeline_depth: section.pipeline_depth,
            reply: section.reply,
        }
    }
}

/// Resolved store client settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub address: String,
    pub username: String,
    pub password: String,
    pub client_name: String,
    pub database: Option<u32>,
    pub resp3: bool,
    pub probe_command: String,
    pub health_check_id: String,
    pub connect_timeout: Duration,
    pub probe_timeout: Duration,
    pub health_check_interval: Option<Duration>,
    pub reconnect_wait: Option<Duration>,
    pub keepalive: Option<Duration>,
    pub queue_depth: usize,
    pub max_payload: usize,
}

impl From<StoreSection> for StoreConfig {
    fn from(section: StoreSection) -> Self {
        Self {
            address: section.address,
            username: section.username,
            password: section.password,
            client_name: section.client_name,
            database: section.database,
            resp3: section.resp3,
            probe_command: section.probe_command,
            health_check_id: section.health_check_id,
            connect_timeout: Duration::from_millis(section.connect_timeout_ms),
            probe_timeout: Duration::from_millis(section.probe_timeout_ms),
            health_check_interval: non_zero_ms(section.health_check_interval_ms),
            reconnect_wait: non_zero_ms(section.reconnect_wait_ms),
            keepalive: (section.keepalive_secs > 0)
                .then(|| Duration::from_secs(section.keepalive_secs)),
            queue_depth: section.queue_depth,
            max_payload: section.max_payload,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreSection::default().into()
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub workers: Option<usize>,
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

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            mut store,
            logging,
        } = toml_config;

        if let Some(address) = cli.store {
            store.address = address;
        }

        let config = Config {
            server: ServerConfig {
                listen: cli.listen.unwrap_or(server.listen),
                max_connections: server.max_connections,
                pipeline_depth: server.pipeline_depth,
                reply: cli.reply.unwrap_or(server.reply),
            },
            store: store.into(),
            workers: cli.workers.or(server.workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid("server.max_connections must be positive"));
        }
        if self.server.pipeline_depth == 0 {
            return Err(ConfigError::Invalid("server.pipeline_depth must be positive"));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("server.workers must be positive"));
        }
        if self.store.queue_depth == 0 {
            return Err(ConfigError::Invalid("store.queue_depth must be positive"));
        }
        if self.store.probe_timeout.is_zero() {
            return Err(ConfigError::Invalid("store.probe_timeout_ms must be positive"));
        }
        if self.store.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("store.connect_timeout_ms must be positive"));
        }
        if self.store.probe_command.trim().is_empty() {
            return Err(ConfigError::Invalid("store.probe_command must not be empty"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["echo-over-redis"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:55555");
        assert_eq!(config.server.reply, ReplyMode::Chunk);
        assert_eq!(config.store.address, "127.0.0.1:6379");
        assert_eq!(config.store.probe_command, "PING");
        assert!(config.store.resp3);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:7000"
            pipeline_depth = 8
            reply = "store"
            workers = 4

            [store]
            address = "10.0.0.5:6380"
            password = "hunter2"
            database = 3
            resp3 = false
            health_check_interval_ms = 0
            reconnect_wait_ms = 250

            [logging]
            level = "debug"
        "#;

        let parsed: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::merge(cli(&[]), parsed).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:7000");
        assert_eq!(config.server.pipeline_depth, 8);
        assert_eq!(config.server.reply, ReplyMode::Store);
        assert_eq!(config.workers, Some(4));
        assert_eq!(config.store.address, "10.0.0.5:6380");
        assert_eq!(config.store.password, "hunter2");
        assert_eq!(config.store.database, Some(3));
        assert!(!config.store.resp3);
        assert_eq!(config.store.health_check_interval, None);
        assert_eq!(config.store.reconnect_wait, Some(Duration::from_millis(250)));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let parsed: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:7000"
            [store]
            address = "10.0.0.5:6380"
            "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&[
                "-l",
                "127.0.0.1:0",
                "--store",
                "localhost:6379",
                "--reply",
                "store",
                "--log-level",
                "trace",
            ]),
            parsed,
        )
        .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:0");
        assert_eq!(config.store.address, "localhost:6379");
        assert_eq!(config.server.reply, ReplyMode::Store);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let parsed: TomlConfig = toml::from_str("[server]\npipeline_depth = 0\n").unwrap();
        assert!(matches!(
            Config::merge(cli(&[]), parsed),
            Err(ConfigError::Invalid(_))
        ));

        let parsed: TomlConfig = toml::from_str("[store]\nprobe_timeout_ms = 0\n").unwrap();
        assert!(Config::merge(cli(&[]), parsed).is_err());

        assert!(Config::merge(cli(&["-w", "0"]), TomlConfig::default()).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_cli(cli(&["-c", "/nonexistent/echo-over-redis.toml"])).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
    }
}
