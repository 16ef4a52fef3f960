use backon::ExponentialBuilder;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::domain::FULL_ALLOCATION_BPS;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub planner: PlannerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub dry_run: DryRunConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerConfig {
    /// Minimum blended APY gain (bps) for a shift step to be worth taking
    pub min_change_bps: u32,
    /// Maximum share (bps) any one farm may gain or lose in a single plan
    pub max_single_farm_shift_bps: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Interval between operation status polls in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl ExecutorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Seconds between APY refreshes (default: 60)
    #[serde(default = "default_refresh_interval")]
    pub interval_secs: u64,
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_refresh_interval(),
        }
    }
}

fn default_refresh_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Seconds a transfer may stay in bridging before it is failed (default: 30 min)
    #[serde(default = "default_bridge_timeout")]
    pub timeout_secs: u64,
    /// Interval between bridge status polls in milliseconds
    #[serde(default = "default_bridge_poll_interval")]
    pub poll_interval_ms: u64,
}

impl BridgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_bridge_timeout(),
            poll_interval_ms: default_bridge_poll_interval(),
        }
    }
}

fn default_bridge_timeout() -> u64 {
    1800
}

fn default_bridge_poll_interval() -> u64 {
    5000
}

/// Backoff for transient gateway read failures. Writes are never retried.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_min_delay")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl RetryConfig {
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_max_times(self.max_retries)
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_jitter()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            min_delay_ms: default_min_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

fn default_max_retries() -> usize {
    5
}

fn default_min_delay() -> u64 {
    200
}

fn default_max_delay() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// In-memory chain used when no live gateway is configured
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DryRunConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Farms the simulated chain starts with
    #[serde(default)]
    pub farms: Vec<SeedFarm>,
    /// Status polls before a simulated operation resolves
    #[serde(default)]
    pub confirmation_polls: u32,
    /// Release reads answered pending after a simulated bridge lock confirms
    #[serde(default)]
    pub release_polls: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedFarm {
    pub protocol: String,
    pub apy_bps: u32,
    pub allocation_bps: u32,
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("planner.min_change_bps", 10)?
            .set_default("planner.max_single_farm_shift_bps", 3000)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("HARVEST_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (HARVEST_PLANNER__MIN_CHANGE_BPS, etc.)
            .add_source(
                Environment::with_prefix("HARVEST")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Create a default configuration for CLI and test usage
    pub fn default_config() -> Self {
        Self {
            planner: PlannerConfig {
                min_change_bps: 10,
                max_single_farm_shift_bps: 3000,
            },
            executor: ExecutorConfig::default(),
            refresh: RefreshConfig::default(),
            bridge: BridgeConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
            dry_run: DryRunConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.planner.max_single_farm_shift_bps > FULL_ALLOCATION_BPS {
            errors.push(format!(
                "max_single_farm_shift_bps must not exceed {FULL_ALLOCATION_BPS}"
            ));
        }

        if self.executor.poll_interval_ms == 0 {
            errors.push("executor.poll_interval_ms must be positive".to_string());
        }

        if self.refresh.interval_secs == 0 {
            errors.push("refresh.interval_secs must be positive".to_string());
        }

        if self.bridge.timeout_secs == 0 {
            errors.push("bridge.timeout_secs must be positive".to_string());
        }

        if self.retry.min_delay_ms > self.retry.max_delay_ms {
            errors.push("retry.min_delay_ms should not exceed retry.max_delay_ms".to_string());
        }

        if self.dry_run.enabled {
            let mut seen = std::collections::HashSet::new();
            for farm in &self.dry_run.farms {
                if !seen.insert(farm.protocol.as_str()) {
                    errors.push(format!("duplicate dry-run farm: {}", farm.protocol));
                }
                if farm.allocation_bps > FULL_ALLOCATION_BPS {
                    errors.push(format!(
                        "dry-run farm {} allocation exceeds {FULL_ALLOCATION_BPS} bps",
                        farm.protocol
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
