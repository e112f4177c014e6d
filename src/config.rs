//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and `HEATLINE_*` environment overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hub::KeepaliveConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub recorder: RecorderConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_driver")]
    pub driver: String,

    /// JSON-lines file published into the memory broker at startup
    #[serde(default)]
    pub seed_file: Option<String>,
}

fn default_driver() -> String {
    "memory".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            seed_file: None,
        }
    }
}

/// Fan-out hub configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// How far back competition activations are replayed
    #[serde(default = "default_history")]
    pub history_secs: u64,

    #[serde(default = "default_ping_period")]
    pub ping_period_secs: u64,

    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,

    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_history() -> u64 {
    24 * 60 * 60
}

fn default_pong_wait() -> u64 {
    60
}

fn default_ping_period() -> u64 {
    default_pong_wait() * 9 / 10
}

fn default_write_wait() -> u64 {
    10
}

fn default_max_connections() -> usize {
    1000
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            history_secs: default_history(),
            ping_period_secs: default_ping_period(),
            pong_wait_secs: default_pong_wait(),
            write_wait_secs: default_write_wait(),
            max_connections: default_max_connections(),
        }
    }
}

impl HubConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn history(&self) -> Duration {
        Duration::from_secs(self.history_secs)
    }

    pub fn keepalive(&self) -> KeepaliveConfig {
        KeepaliveConfig {
            ping_period: Duration::from_secs(self.ping_period_secs),
            pong_wait: Duration::from_secs(self.pong_wait_secs),
            write_wait: Duration::from_secs(self.write_wait_secs),
        }
    }
}

/// Recorder and replay configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    /// Recording file, appended to by `record` and read by `replay`
    #[serde(default = "default_recording_file")]
    pub file: String,

    /// Base URL of the hub to record from
    #[serde(default = "default_hub_url")]
    pub url: String,

    /// Record a single competition instead of the competition list
    #[serde(default)]
    pub competition: Option<String>,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_replay_port")]
    pub port: u16,

    /// Divides the waits between replayed frames
    #[serde(default = "default_speed")]
    pub speed: u32,
}

fn default_recording_file() -> String {
    "log.json".to_string()
}

fn default_hub_url() -> String {
    "ws://127.0.0.1:8080".to_string()
}

fn default_replay_port() -> u16 {
    3000
}

fn default_speed() -> u32 {
    1
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            file: default_recording_file(),
            url: default_hub_url(),
            competition: None,
            host: default_host(),
            port: default_replay_port(),
            speed: default_speed(),
        }
    }
}

impl RecorderConfig {
    /// Replay server socket address
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Hub endpoint the recorder connects to
    pub fn endpoint(&self) -> String {
        let base = self.url.trim_end_matches('/');
        match &self.competition {
            Some(id) => format!("{}/v1/competitions/{}", base, id),
            None => format!("{}/v1/competitions", base),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides, then validate
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Result<Self, ConfigError> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("heatline").join("config.toml")),
            Some(PathBuf::from("/etc/heatline/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return Ok(config);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `HEATLINE_*` overrides looked up through `var`
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Broker overrides
        if let Some(driver) = var("HEATLINE_BROKER_DRIVER") {
            self.broker.driver = driver;
        }
        if let Some(seed) = var("HEATLINE_BROKER_SEED_FILE") {
            self.broker.seed_file = Some(seed);
        }

        // Hub overrides
        if let Some(host) = var("HEATLINE_HUB_HOST") {
            self.hub.host = host;
        }
        if let Some(port) = var("HEATLINE_HUB_PORT").and_then(|p| p.parse().ok()) {
            self.hub.port = port;
        }
        if let Some(secs) = var("HEATLINE_HUB_HISTORY_SECS").and_then(|s| s.parse().ok()) {
            self.hub.history_secs = secs;
        }

        // Recorder overrides
        if let Some(file) = var("HEATLINE_RECORDER_FILE") {
            self.recorder.file = file;
        }
        if let Some(url) = var("HEATLINE_RECORDER_URL") {
            self.recorder.url = url;
        }
        if let Some(speed) = var("HEATLINE_RECORDER_SPEED").and_then(|s| s.parse().ok()) {
            self.recorder.speed = speed;
        }

        // Logging overrides
        if let Some(level) = var("HEATLINE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("HEATLINE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Reject settings the hub cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.driver != "memory" {
            return Err(ConfigError::Invalid(format!(
                "unknown broker driver {:?}",
                self.broker.driver
            )));
        }
        let hub = &self.hub;
        if hub.pong_wait_secs == 0 || hub.ping_period_secs == 0 || hub.write_wait_secs == 0 {
            return Err(ConfigError::Invalid(
                "keepalive intervals must be positive".to_string(),
            ));
        }
        if hub.ping_period_secs >= hub.pong_wait_secs {
            return Err(ConfigError::Invalid(format!(
                "ping period ({}s) must be shorter than pong wait ({}s)",
                hub.ping_period_secs, hub.pong_wait_secs
            )));
        }
        if self.recorder.speed == 0 {
            return Err(ConfigError::Invalid("replay speed must be at least 1".to_string()));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Invalid(format!(
                "unknown log format {:?}",
                self.logging.format
            )));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Heatline Configuration
#
# Environment variables override these settings:
# - HEATLINE_BROKER_DRIVER
# - HEATLINE_BROKER_SEED_FILE
# - HEATLINE_HUB_HOST
# - HEATLINE_HUB_PORT
# - HEATLINE_HUB_HISTORY_SECS
# - HEATLINE_RECORDER_FILE
# - HEATLINE_RECORDER_URL
# - HEATLINE_RECORDER_SPEED
# - HEATLINE_LOG_LEVEL
# - HEATLINE_LOG_FORMAT

[broker]
# Broker driver; "memory" keeps everything in process
driver = "memory"

# JSON-lines file of {"subject", "time", "event"} records to publish at startup
# seed_file = "seed.jsonl"

[hub]
# Hub host
host = "0.0.0.0"

# Hub port
port = 8080

# How far back competition activations are replayed (seconds)
history_secs = 86400

# Interval between keepalive pings (seconds)
ping_period_secs = 54

# How long to wait for a pong before dropping the connection (seconds)
pong_wait_secs = 60

# Deadline for writing a single frame (seconds)
write_wait_secs = 10

# Maximum number of concurrent connections
max_connections = 1000

[recorder]
# Recording file
file = "log.json"

# Hub to record from
url = "ws://127.0.0.1:8080"

# Record a single competition
# competition = "competition-id"

# Replay server address
host = "0.0.0.0"
port = 3000

# Divide the waits between replayed frames by this factor
speed = 1

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
