//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::index::IndexConfig;
use crate::kv::CompressionType;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub index: IndexSection,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Index storage and worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IndexSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_worker_tick")]
    pub worker_tick_ms: u64,

    #[serde(default = "default_bucket_cache_capacity")]
    pub bucket_cache_capacity: u64,

    #[serde(default = "default_schema_cache_capacity")]
    pub schema_cache_capacity: u64,

    #[serde(default = "default_sequence_cache_capacity")]
    pub sequence_cache_capacity: u64,

    #[serde(default)]
    pub compression: CompressionType,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("tsindex").to_string_lossy().to_string())
        .unwrap_or_else(|| "./tsindex_data".to_string())
}

fn default_worker_tick() -> u64 {
    100
}

fn default_bucket_cache_capacity() -> u64 {
    1024
}

fn default_schema_cache_capacity() -> u64 {
    1024
}

fn default_sequence_cache_capacity() -> u64 {
    100_000
}

impl Default for IndexSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            worker_tick_ms: default_worker_tick(),
            bucket_cache_capacity: default_bucket_cache_capacity(),
            schema_cache_capacity: default_schema_cache_capacity(),
            sequence_cache_capacity: default_sequence_cache_capacity(),
            compression: CompressionType::default(),
        }
    }
}

impl IndexSection {
    /// Data directory with a leading `~/` expanded
    pub fn data_dir(&self) -> PathBuf {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(&self.data_dir)),
            None => PathBuf::from(&self.data_dir),
        }
    }

    /// Runtime settings for the index databases
    pub fn to_index_config(&self) -> IndexConfig {
        IndexConfig {
            worker_tick: Duration::from_millis(self.worker_tick_ms),
            bucket_cache_capacity: self.bucket_cache_capacity,
            schema_cache_capacity: self.schema_cache_capacity,
            sequence_cache_capacity: self.sequence_cache_capacity,
            compression: self.compression,
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

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("tsindex").join("config.toml")),
            Some(PathBuf::from("/etc/tsindex/config.toml")),
            Some(PathBuf::from("./tsindex.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Check values serde cannot check
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.index.worker_tick_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "index.worker_tick_ms".to_string(),
                error: "must be greater than 0".to_string(),
            });
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Invalid {
                field: "logging.format".to_string(),
                error: format!("expected \"pretty\" or \"json\", got {:?}", self.logging.format),
            });
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(data_dir) = lookup("TSINDEX_DATA_DIR") {
            self.index.data_dir = data_dir;
        }
        if let Some(tick) = lookup("TSINDEX_WORKER_TICK_MS") {
            match tick.parse() {
                Ok(ms) => self.index.worker_tick_ms = ms,
                Err(_) => tracing::warn!("Ignoring invalid TSINDEX_WORKER_TICK_MS: {}", tick),
            }
        }

        if let Some(level) = lookup("TSINDEX_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("TSINDEX_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid config value for {field}: {error}")]
    Invalid { field: String, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# tsindex Configuration
#
# Environment variables override these settings:
# - TSINDEX_DATA_DIR
# - TSINDEX_WORKER_TICK_MS
# - TSINDEX_LOG_LEVEL
# - TSINDEX_LOG_FORMAT

[index]
# Directory holding the meta database and monthly series indexes
data_dir = "~/.local/share/tsindex"

# How often notify workers drain their queues (ms)
worker_tick_ms = 100

# Decoded buckets kept per key-value store
bucket_cache_capacity = 1024

# Metric schemas kept in the read cache
schema_cache_capacity = 1024

# Per-metric series sequences kept per index database
sequence_cache_capacity = 100000

# Table payload compression: none or lz4
compression = "lz4"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
