//! Configuration management for the crashpoint game server
//!
//! This module provides a centralized configuration system with validation,
//! defaults, and environment variable support.

use crate::errors::{ConfigurationError, CrashResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub game: GameConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub hub: HubConfig,
}

/// HTTP + WebSocket listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub listen_address: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

/// Round lifecycle parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    /// Time between round starts, in milliseconds
    pub round_period_ms: u64,
    /// Length of the betting window at the start of each round
    pub betting_window_ms: u64,
    /// Multiplier tick period during the live phase
    pub tick_ms: u64,
    /// Upper bound on the derived crash point
    pub max_crash: f64,
    /// Smallest accepted stake, in fiat
    pub min_stake_fiat: f64,
    /// Largest accepted stake, in fiat
    pub max_stake_fiat: f64,
}

/// Price oracle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Base URL of the CoinGecko-compatible price upstream
    pub upstream_url: String,
    /// Cache entry lifetime before a refresh is attempted
    pub cache_ttl_ms: u64,
    /// Upstream request timeout
    pub fetch_timeout_ms: u64,
}

/// Broadcast hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Keep-alive ping interval per observer
    pub keep_alive_secs: u64,
    /// Observers silent for longer than this are reaped
    pub idle_timeout_secs: u64,
    /// Pending outbound events per observer before it is dropped
    pub observer_queue_bound: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 3000,
            allowed_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./crashpoint_data".to_string(),
        }
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            round_period_ms: 10_000,
            betting_window_ms: 3_000,
            tick_ms: 100,
            max_crash: 120.0,
            min_stake_fiat: 0.01,
            max_stake_fiat: 10_000.0,
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            upstream_url: "https://api.coingecko.com/api/v3".to_string(),
            cache_ttl_ms: 10_000,
            fetch_timeout_ms: 5_000,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: 30,
            idle_timeout_secs: 120,
            observer_queue_bound: 256,
        }
    }
}

impl GameConfig {
    pub fn round_period(&self) -> Duration {
        Duration::from_millis(self.round_period_ms)
    }

    pub fn betting_window(&self) -> Duration {
        Duration::from_millis(self.betting_window_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl OracleConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    config_path: Option<String>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> CrashResult<AppConfig> {
        let mut config = if let Some(ref path) = self.config_path {
            self.load_from_file(path)?
        } else {
            AppConfig::default()
        };

        self.apply_env_overrides(&mut config)?;
        self.validate(&config)?;

        Ok(config)
    }

    /// Load configuration from TOML file
    fn load_from_file(&self, path: &str) -> CrashResult<AppConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e))
        })?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) -> CrashResult<()> {
        if let Ok(port) = env::var("CRASHPOINT_PORT") {
            config.api.port = port.parse().map_err(|_| ConfigurationError::InvalidValue {
                field: "CRASHPOINT_PORT".to_string(),
                value: port,
                reason: "Invalid port number".to_string(),
            })?;
        }
        if let Ok(addr) = env::var("CRASHPOINT_LISTEN_ADDRESS") {
            config.api.listen_address = addr;
        }
        if let Ok(data_dir) = env::var("CRASHPOINT_DATA_DIR") {
            config.storage.data_dir = data_dir;
        }
        if let Ok(url) = env::var("CRASHPOINT_UPSTREAM_URL") {
            config.oracle.upstream_url = url;
        }
        if let Ok(ttl) = env::var("CRASHPOINT_CACHE_TTL_MS") {
            config.oracle.cache_ttl_ms =
                ttl.parse().map_err(|_| ConfigurationError::InvalidValue {
                    field: "CRASHPOINT_CACHE_TTL_MS".to_string(),
                    value: ttl,
                    reason: "Invalid duration".to_string(),
                })?;
        }
        if let Ok(period) = env::var("CRASHPOINT_ROUND_PERIOD_MS") {
            config.game.round_period_ms =
                period.parse().map_err(|_| ConfigurationError::InvalidValue {
                    field: "CRASHPOINT_ROUND_PERIOD_MS".to_string(),
                    value: period,
                    reason: "Invalid duration".to_string(),
                })?;
        }
        if let Ok(max_crash) = env::var("CRASHPOINT_MAX_CRASH") {
            config.game.max_crash =
                max_crash.parse().map_err(|_| ConfigurationError::InvalidValue {
                    field: "CRASHPOINT_MAX_CRASH".to_string(),
                    value: max_crash,
                    reason: "Invalid multiplier".to_string(),
                })?;
        }

        Ok(())
    }

    /// Validate configuration values
    fn validate(&self, config: &AppConfig) -> CrashResult<()> {
        if config.api.port == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "api.port".to_string(),
                value: "0".to_string(),
                reason: "Port cannot be zero".to_string(),
            }
            .into());
        }

        if config.storage.data_dir.is_empty() {
            return Err(ConfigurationError::MissingRequired("storage.data_dir".to_string()).into());
        }

        if config.game.tick_ms == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "game.tick_ms".to_string(),
                value: "0".to_string(),
                reason: "Tick period cannot be zero".to_string(),
            }
            .into());
        }

        if config.game.round_period_ms < config.game.betting_window_ms {
            return Err(ConfigurationError::InvalidValue {
                field: "game.round_period_ms".to_string(),
                value: config.game.round_period_ms.to_string(),
                reason: "Round period must cover the betting window".to_string(),
            }
            .into());
        }

        if config.game.max_crash < 1.0 {
            return Err(ConfigurationError::InvalidValue {
                field: "game.max_crash".to_string(),
                value: config.game.max_crash.to_string(),
                reason: "Crash cap must be at least 1.00".to_string(),
            }
            .into());
        }

        if config.game.min_stake_fiat <= 0.0
            || config.game.max_stake_fiat < config.game.min_stake_fiat
        {
            return Err(ConfigurationError::InvalidValue {
                field: "game.min_stake_fiat".to_string(),
                value: config.game.min_stake_fiat.to_string(),
                reason: "Stake bounds must be positive and ordered".to_string(),
            }
            .into());
        }

        if config.oracle.fetch_timeout_ms == 0 || config.oracle.fetch_timeout_ms > 5_000 {
            return Err(ConfigurationError::InvalidValue {
                field: "oracle.fetch_timeout_ms".to_string(),
                value: config.oracle.fetch_timeout_ms.to_string(),
                reason: "Upstream timeout must be within (0, 5000] ms".to_string(),
            }
            .into());
        }

        if config.hub.observer_queue_bound == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "hub.observer_queue_bound".to_string(),
                value: "0".to_string(),
                reason: "Observer queue bound cannot be zero".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, config: &AppConfig, path: &str) -> CrashResult<()> {
        let toml_string = toml::to_string_pretty(config).map_err(|e| {
            ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, toml_string).map_err(|e| {
            ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into()
        })
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
