use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Trait for abstracting environment variable access
pub trait EnvProvider {
    fn get(&self, key: &str) -> Option<String>;
}

/// System environment variable provider for production use
pub struct SystemEnvProvider;

impl EnvProvider for SystemEnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("JSON parsing error: {0}")]
    JsonParsing(#[from] serde_json::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable error: {0}")]
    Environment(String),

    #[error("Unsupported configuration file format: {0}")]
    UnsupportedFormat(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Schema cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub hardware: HardwareConfig,
    pub network: NetworkConfig,
    pub validation: ValidationConfig,
}

/// Sizing and aging of compiled artifacts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries allowed beyond the registered ones before LRU eviction kicks in
    pub max_entries: usize,
    /// How long a remotely fetched schema text is trusted before it is re-checked
    pub max_age_ms: u64,
    /// Idle time after which a transient, conflicting artifact is dropped
    pub max_stale_age_ms: u64,
    /// Period of the background maintenance pass
    pub maintenance_interval_ms: u64,
}

/// Debounce settings for acceleration reloads
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HardwareConfig {
    /// Quiet period after the latest newly pending artifact
    pub min_age_ms: u64,
    /// Reload is forced once the oldest pending artifact has waited this long
    pub max_age_ms: u64,
    /// Minimum spacing between two reloads
    pub latency_ms: u64,
}

/// Remote schema access
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Remote URLs must match this pattern to be fetched
    pub allow_pattern: String,
    /// Allow schemas under `policy:` URIs to pull in remote references
    pub allow_remote_from_policy: bool,
    /// HTTP request timeout in seconds
    pub timeout_seconds: u64,
    /// Number of retry attempts for failed downloads
    pub retry_attempts: u32,
    /// Retry delay in milliseconds
    pub retry_delay_ms: u64,
    /// Cap for the exponential retry delay
    pub max_retry_delay_ms: u64,
    /// Largest remote schema accepted, in bytes
    pub max_schema_size: u64,
}

/// Validation behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Validate in software when the acceleration engine declines
    pub software_fallback: bool,
    /// Permit DOCTYPE declarations in schema documents
    pub allow_doctype: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            max_age_ms: 300_000,
            max_stale_age_ms: 1_200_000,
            maintenance_interval_ms: 600_000,
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            min_age_ms: 500,
            max_age_ms: 30_000,
            latency_ms: 10_000,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            allow_pattern: "^https?://".to_string(),
            allow_remote_from_policy: false,
            timeout_seconds: 30,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            max_schema_size: 1_000_000,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            software_fallback: true,
            allow_doctype: false,
        }
    }
}

impl NetworkConfig {
    /// Compile the remote URL allow pattern
    pub fn allow_regex(&self) -> Result<Regex> {
        Regex::new(&self.allow_pattern).map_err(|e| {
            ConfigError::Validation(format!(
                "Invalid remote URL allow pattern '{}': {}",
                self.allow_pattern, e
            ))
        })
    }
}

/// Configuration manager for loading and merging configurations
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration with precedence: defaults -> file -> environment
    pub async fn load_config(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path).await?,
            None => Self::find_config_file().await?.unwrap_or_default(),
        };

        config = Self::apply_environment_overrides(config)?;

        Self::validate_config(&config)?;

        Ok(config)
    }

    /// Load configuration from a file (TOML or JSON)
    pub async fn load_from_file(path: &Path) -> Result<Config> {
        let content = tokio::fs::read_to_string(path).await?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(toml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some(ext) => Err(ConfigError::UnsupportedFormat(ext.to_string())),
            None => {
                // Try to parse as TOML first, then JSON
                if let Ok(config) = toml::from_str::<Config>(&content) {
                    Ok(config)
                } else {
                    Ok(serde_json::from_str(&content)?)
                }
            }
        }
    }

    /// Find configuration file in standard locations
    pub async fn find_config_file() -> Result<Option<Config>> {
        let config_names = [
            "xsd-cache.toml",
            "xsd-cache.json",
            ".xsd-cache.toml",
            ".xsd-cache.json",
        ];

        for name in &config_names {
            let path = PathBuf::from(name);
            if path.exists() {
                return Ok(Some(Self::load_from_file(&path).await?));
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let app_config_dir = config_dir.join("xsd-cache");
            for name in &config_names {
                let path = app_config_dir.join(name);
                if path.exists() {
                    return Ok(Some(Self::load_from_file(&path).await?));
                }
            }
        }

        Ok(None)
    }

    /// Apply environment variable overrides using the system environment
    pub fn apply_environment_overrides(config: Config) -> Result<Config> {
        Self::apply_environment_overrides_with(&SystemEnvProvider, config)
    }

    /// Apply environment variable overrides with a custom environment provider
    pub fn apply_environment_overrides_with(
        env: &impl EnvProvider,
        mut config: Config,
    ) -> Result<Config> {
        // Cache settings
        if let Some(value) = env.get("XSD_CACHE_MAX_ENTRIES") {
            config.cache.max_entries = parse_env("XSD_CACHE_MAX_ENTRIES", &value)?;
        }
        if let Some(value) = env.get("XSD_CACHE_MAX_AGE_MS") {
            config.cache.max_age_ms = parse_env("XSD_CACHE_MAX_AGE_MS", &value)?;
        }
        if let Some(value) = env.get("XSD_CACHE_MAX_STALE_AGE_MS") {
            config.cache.max_stale_age_ms = parse_env("XSD_CACHE_MAX_STALE_AGE_MS", &value)?;
        }
        if let Some(value) = env.get("XSD_CACHE_MAINTENANCE_INTERVAL_MS") {
            config.cache.maintenance_interval_ms =
                parse_env("XSD_CACHE_MAINTENANCE_INTERVAL_MS", &value)?;
        }

        // Hardware settings
        if let Some(value) = env.get("XSD_CACHE_HARDWARE_MIN_AGE_MS") {
            config.hardware.min_age_ms = parse_env("XSD_CACHE_HARDWARE_MIN_AGE_MS", &value)?;
        }
        if let Some(value) = env.get("XSD_CACHE_HARDWARE_MAX_AGE_MS") {
            config.hardware.max_age_ms = parse_env("XSD_CACHE_HARDWARE_MAX_AGE_MS", &value)?;
        }
        if let Some(value) = env.get("XSD_CACHE_HARDWARE_LATENCY_MS") {
            config.hardware.latency_ms = parse_env("XSD_CACHE_HARDWARE_LATENCY_MS", &value)?;
        }

        // Network settings
        if let Some(value) = env.get("XSD_CACHE_REMOTE_ALLOW_PATTERN") {
            config.network.allow_pattern = value;
        }
        if let Some(value) = env.get("XSD_CACHE_ALLOW_REMOTE_FROM_POLICY") {
            config.network.allow_remote_from_policy =
                parse_env("XSD_CACHE_ALLOW_REMOTE_FROM_POLICY", &value)?;
        }
        if let Some(value) = env.get("XSD_CACHE_TIMEOUT") {
            config.network.timeout_seconds = parse_env("XSD_CACHE_TIMEOUT", &value)?;
        }
        if let Some(value) = env.get("XSD_CACHE_RETRY_ATTEMPTS") {
            config.network.retry_attempts = parse_env("XSD_CACHE_RETRY_ATTEMPTS", &value)?;
        }
        if let Some(value) = env.get("XSD_CACHE_MAX_SCHEMA_SIZE") {
            config.network.max_schema_size = parse_env("XSD_CACHE_MAX_SCHEMA_SIZE", &value)?;
        }

        // Validation settings
        if let Some(value) = env.get("XSD_CACHE_SOFTWARE_FALLBACK") {
            config.validation.software_fallback =
                parse_env("XSD_CACHE_SOFTWARE_FALLBACK", &value)?;
        }
        if let Some(value) = env.get("XSD_CACHE_ALLOW_DOCTYPE") {
            config.validation.allow_doctype = parse_env("XSD_CACHE_ALLOW_DOCTYPE", &value)?;
        }

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate_config(config: &Config) -> Result<()> {
        if config.cache.max_entries == 0 {
            return Err(ConfigError::Validation(
                "Cache max entries must be greater than 0".to_string(),
            ));
        }

        if config.cache.max_age_ms == 0 || config.cache.max_stale_age_ms == 0 {
            return Err(ConfigError::Validation(
                "Cache ages must be greater than 0".to_string(),
            ));
        }

        if config.cache.maintenance_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "Maintenance interval must be greater than 0".to_string(),
            ));
        }

        if config.hardware.min_age_ms == 0
            || config.hardware.max_age_ms == 0
            || config.hardware.latency_ms == 0
        {
            return Err(ConfigError::Validation(
                "Hardware reload timings must be greater than 0".to_string(),
            ));
        }

        if config.hardware.min_age_ms > config.hardware.max_age_ms {
            return Err(ConfigError::Validation(format!(
                "Hardware min age ({}ms) cannot exceed max age ({}ms)",
                config.hardware.min_age_ms, config.hardware.max_age_ms
            )));
        }

        if config.network.timeout_seconds == 0 {
            return Err(ConfigError::Validation(
                "Timeout must be greater than 0".to_string(),
            ));
        }

        if config.network.retry_attempts > 10 {
            return Err(ConfigError::Validation(
                "Retry attempts cannot exceed 10".to_string(),
            ));
        }

        if config.network.max_schema_size == 0 {
            return Err(ConfigError::Validation(
                "Max schema size must be greater than 0".to_string(),
            ));
        }

        config.network.allow_regex()?;

        Ok(())
    }

    /// Convert configuration to Duration for network timeout
    pub fn get_timeout_duration(config: &Config) -> Duration {
        Duration::from_secs(config.network.timeout_seconds)
    }

    /// Convert configuration to Duration for the maintenance period
    pub fn get_maintenance_interval(config: &Config) -> Duration {
        Duration::from_millis(config.cache.maintenance_interval_ms)
    }

    /// Period at which pending acceleration reloads are re-checked
    pub fn get_hardware_check_interval(config: &Config) -> Duration {
        let period = config.hardware.min_age_ms.min(config.hardware.latency_ms);
        Duration::from_millis(period.max(50))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Environment(format!("Invalid {} value: {}", key, value)))
}
