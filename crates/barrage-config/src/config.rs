//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level SDK configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Connection, heartbeat and framing settings.
    pub network: NetworkConfig,
    /// Inbound queue and dispatch worker settings.
    pub dispatch: DispatchConfig,
    /// Token issuance endpoint settings.
    pub token: TokenConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Per-room connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Barrage server dialled when a room is joined without an explicit host.
    pub default_server: String,
    /// Port dialled when a room is joined with port 0.
    pub default_port: u16,
    /// Immediate retries after a failed dial before backing off.
    pub connect_retries: u32,
    /// Spacing between immediate dial retries, in milliseconds.
    pub connect_retry_delay_ms: u64,
    /// First backoff delay once the immediate retries are spent, in milliseconds.
    pub backoff_initial_ms: u64,
    /// Upper bound on the backoff delay, in milliseconds.
    pub backoff_max_ms: u64,
    /// Delay between login and the first heartbeat, in milliseconds.
    pub heartbeat_initial_delay_ms: u64,
    /// Heartbeat period, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Consecutive write failures that trigger a reconnect.
    pub heartbeat_failure_threshold: u32,
    /// Pause after EOF or a timed-out read, in milliseconds.
    pub read_retry_delay_ms: u64,
    /// Consecutive EOF/timeout reads that trigger a reconnect.
    pub read_failure_threshold: u32,
    /// Largest accepted frame body, in bytes.
    pub max_frame_size: u32,
}

/// Dispatch pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Number of dispatch workers. `1` keeps handler calls in arrival order.
    pub workers: usize,
    /// Capacity of the inbound queue shared by all rooms.
    pub inbound_capacity: usize,
    /// Ceiling on rooms a session manages at once; also sizes the reconnect
    /// queue. Joins past it fail with `RoomLimitReached`, on top of the
    /// empty and already-joined checks.
    pub max_rooms: usize,
}

/// Token issuance endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TokenConfig {
    /// Scheme and host of the open API, without a trailing slash.
    pub base_url: String,
    /// HTTP request timeout, in seconds.
    pub request_timeout_secs: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            default_server: "openapi-danmu.douyu.com".to_string(),
            default_port: 80,
            connect_retries: 3,
            connect_retry_delay_ms: 1_000,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
            heartbeat_initial_delay_ms: 3_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_failure_threshold: 10,
            read_retry_delay_ms: 1_000,
            read_failure_threshold: 30,
            max_frame_size: 1_048_576,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            inbound_capacity: 30,
            max_rooms: 4096,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openapi.douyu.com".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Platform config directory for the SDK, e.g. `~/.config/barrage`.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("barrage"))
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
