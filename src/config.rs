use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cpu::CpuAlgo;
use crate::pool::PoolCredentials;
use crate::retry::RetryConfig;
use crate::strategy::PoolStrategy;

pub const DEFAULT_API_PORT: u16 = 4028;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
    #[error("Cannot read config file {0}: {1}")]
    File(String, String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Pools
    pub pools: Vec<PoolCredentials>,
    pub pool_strategy: PoolStrategy,
    pub rotate_period: u32,

    // Devices
    pub cpu_threads: usize,
    pub cpu_algo: CpuAlgo,
    pub gpu_enabled: bool,

    // Scanning
    pub queue_depth: usize,
    pub scan_time_secs: u64,
    pub scan_slice: u32,
    pub pop_timeout_ms: u64,
    pub max_rolls: u32,

    // Device health
    pub device_sick_after: u32,
    pub device_dead_after: u32,
    pub device_timeout_secs: u64,

    // Pool health
    pub pool_sick_after: u32,
    pub pool_dead_after: u32,
    pub health_check_interval_ms: u64,

    // Network and error recovery
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub fetch_timeout_ms: u64,

    // Admin API
    pub api_listen: bool,
    pub api_network: bool,
    pub api_port: u16,
    pub api_description: String,

    // Monitoring and logging
    pub metrics_enabled: bool,
    pub metrics_port: u16,
    pub log_level: String,

    pub shutdown_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let cpu_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            pools: Vec::new(),
            pool_strategy: PoolStrategy::Failover,
            rotate_period: 10,

            cpu_threads,
            cpu_algo: CpuAlgo::Midstate,
            gpu_enabled: false,

            queue_depth: 2,
            scan_time_secs: 60,
            scan_slice: 1 << 20,
            pop_timeout_ms: 500,
            max_rolls: 60,

            device_sick_after: 3,
            device_dead_after: 10,
            device_timeout_secs: 60,

            pool_sick_after: 2,
            pool_dead_after: 5,
            health_check_interval_ms: 30000,

            max_retries: 3,
            retry_delay_ms: 1000,
            fetch_timeout_ms: 10000,

            api_listen: true,
            api_network: false,
            api_port: DEFAULT_API_PORT,
            api_description: concat!("hashmill ", env!("CARGO_PKG_VERSION")).to_string(),

            metrics_enabled: false,
            metrics_port: 9108,
            log_level: "info".to_string(),

            shutdown_timeout_ms: 5000,
        }
    }
}

fn parse<T: FromStr>(name: &str, val: String) -> Result<T, ConfigError> {
    val.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnvVar(name.to_string(), val))
}

fn flag(val: &str) -> bool {
    matches!(val.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// `url,user,pass;url,user,pass;...`
pub fn parse_pools(val: &str) -> Result<Vec<PoolCredentials>, ConfigError> {
    val.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, ',').map(str::trim);
            match (parts.next(), parts.next(), parts.next()) {
                (Some(url), Some(user), pass) if !url.is_empty() => Ok(PoolCredentials {
                    url: url.to_string(),
                    user: user.to_string(),
                    pass: pass.unwrap_or("").to_string(),
                }),
                _ => Err(ConfigError::InvalidEnvVar("POOLS".to_string(), entry.to_string())),
            }
        })
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Starts from `CONFIG_FILE` (if set) or the defaults, then applies the
    /// environment on top.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match get("CONFIG_FILE") {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        // Pools
        match get("POOLS") {
            Some(val) => config.pools = parse_pools(&val)?,
            None if config.pools.is_empty() => {
                return Err(ConfigError::MissingEnvVar("POOLS".to_string()));
            }
            None => {}
        }

        if let Some(val) = get("POOL_STRATEGY") {
            config.pool_strategy = val
                .parse()
                .map_err(|_| ConfigError::InvalidEnvVar("POOL_STRATEGY".to_string(), val))?;
        }

        if let Some(val) = get("ROTATE_PERIOD") {
            config.rotate_period = parse("ROTATE_PERIOD", val)?;
        }

        // Devices
        if let Some(val) = get("CPU_THREADS") {
            config.cpu_threads = parse("CPU_THREADS", val)?;
        }

        if let Some(val) = get("CPU_ALGO") {
            config.cpu_algo = parse("CPU_ALGO", val)?;
        }

        if let Some(val) = get("GPU_ENABLED") {
            config.gpu_enabled = flag(&val);
        }

        // Scanning
        if let Some(val) = get("QUEUE_DEPTH") {
            config.queue_depth = parse("QUEUE_DEPTH", val)?;
        }

        if let Some(val) = get("SCAN_TIME_SECS") {
            config.scan_time_secs = parse("SCAN_TIME_SECS", val)?;
        }

        if let Some(val) = get("SCAN_SLICE") {
            config.scan_slice = parse("SCAN_SLICE", val)?;
        }

        if let Some(val) = get("POP_TIMEOUT_MS") {
            config.pop_timeout_ms = parse("POP_TIMEOUT_MS", val)?;
        }

        if let Some(val) = get("MAX_ROLLS") {
            config.max_rolls = parse("MAX_ROLLS", val)?;
        }

        // Health
        if let Some(val) = get("DEVICE_SICK_AFTER") {
            config.device_sick_after = parse("DEVICE_SICK_AFTER", val)?;
        }

        if let Some(val) = get("DEVICE_DEAD_AFTER") {
            config.device_dead_after = parse("DEVICE_DEAD_AFTER", val)?;
        }

        if let Some(val) = get("DEVICE_TIMEOUT_SECS") {
            config.device_timeout_secs = parse("DEVICE_TIMEOUT_SECS", val)?;
        }

        if let Some(val) = get("POOL_SICK_AFTER") {
            config.pool_sick_after = parse("POOL_SICK_AFTER", val)?;
        }

        if let Some(val) = get("POOL_DEAD_AFTER") {
            config.pool_dead_after = parse("POOL_DEAD_AFTER", val)?;
        }

        if let Some(val) = get("HEALTH_CHECK_INTERVAL_MS") {
            config.health_check_interval_ms = parse("HEALTH_CHECK_INTERVAL_MS", val)?;
        }

        // Error handling
        if let Some(val) = get("MAX_RETRIES") {
            config.max_retries = parse("MAX_RETRIES", val)?;
        }

        if let Some(val) = get("RETRY_DELAY_MS") {
            config.retry_delay_ms = parse("RETRY_DELAY_MS", val)?;
        }

        if let Some(val) = get("FETCH_TIMEOUT_MS") {
            config.fetch_timeout_ms = parse("FETCH_TIMEOUT_MS", val)?;
        }

        // Admin API
        if let Some(val) = get("API_LISTEN") {
            config.api_listen = flag(&val);
        }

        if let Some(val) = get("API_NETWORK") {
            config.api_network = flag(&val);
        }

        if let Some(val) = get("API_PORT") {
            config.api_port = parse("API_PORT", val)?;
        }

        if let Some(val) = get("API_DESCRIPTION") {
            config.api_description = val;
        }

        // Monitoring and logging
        if let Some(val) = get("METRICS_ENABLED") {
            config.metrics_enabled = flag(&val);
        }

        if let Some(val) = get("METRICS_PORT") {
            config.metrics_port = parse("METRICS_PORT", val)?;
        }

        if let Some(val) = get("LOG_LEVEL") {
            config.log_level = val;
        }

        if let Some(val) = get("SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout_ms = parse("SHUTDOWN_TIMEOUT_MS", val)?;
        }

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::File(path.display().to_string(), e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::File(path.display().to_string(), e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pools.is_empty() {
            return Err(ConfigError::ValidationError("at least one pool is required".to_string()));
        }

        if let Some(p) = self.pools.iter().find(|p| !p.url.starts_with("http")) {
            return Err(ConfigError::ValidationError(format!("pool URL {} must be an HTTP URL", p.url)));
        }

        if self.cpu_threads == 0 && !self.gpu_enabled {
            return Err(ConfigError::ValidationError("no devices: CPU_THREADS is 0 and GPU is disabled".to_string()));
        }

        if self.queue_depth == 0 {
            return Err(ConfigError::ValidationError("QUEUE_DEPTH must be greater than 0".to_string()));
        }

        if self.scan_slice == 0 {
            return Err(ConfigError::ValidationError("SCAN_SLICE must be greater than 0".to_string()));
        }

        if self.scan_time_secs == 0 {
            return Err(ConfigError::ValidationError("SCAN_TIME_SECS must be greater than 0".to_string()));
        }

        if self.device_dead_after < self.device_sick_after || self.pool_dead_after < self.pool_sick_after {
            return Err(ConfigError::ValidationError("dead thresholds must not be below sick thresholds".to_string()));
        }

        if self.api_listen && self.metrics_enabled && self.api_port == self.metrics_port {
            return Err(ConfigError::ValidationError("API_PORT and METRICS_PORT must differ".to_string()));
        }

        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            retry_delay: self.get_retry_delay(),
            ..RetryConfig::default()
        }
    }

    pub fn get_retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn get_health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn scan_time(&self) -> Duration {
        Duration::from_secs(self.scan_time_secs)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
