//! Engine configuration from environment variables
//!
//! Recognized options: max iterations (rows) per worker, parallelism, wall-clock
//! timeout and the kind filter selecting which tiers a scheduled run targets.

use super::coordinator::RunOptions;
use super::types::StaleKind;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration for the stale processing runtime
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Maximum `process_one` iterations per worker per run
    pub max_iterations: usize,

    /// Number of concurrent workers per run
    pub parallelism: usize,

    /// Wall-clock limit for a single coordinator run
    pub timeout: Duration,

    /// Kinds processed by each scheduled cycle (always run in level order)
    pub kinds: Vec<StaleKind>,

    /// Scheduler interval in milliseconds
    pub interval_ms: u64,

    /// How long a transaction may wait on the SQLite write lock
    pub busy_timeout_ms: u64,

    /// SolarFlux publication channel size
    pub flux_channel_buffer: usize,

    /// Publish freshly computed rows to SolarFlux
    pub flux_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "/var/lib/datum-rollup/rollup.db".to_string(),
            max_iterations: 1_000,
            parallelism: 1,
            timeout: Duration::from_secs(300),
            kinds: StaleKind::LEVEL_ORDER.to_vec(),
            interval_ms: 60_000,
            busy_timeout_ms: 5_000,
            flux_channel_buffer: 1_000,
            flux_enabled: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `ROLLUP_DB_PATH` (default: /var/lib/datum-rollup/rollup.db)
    /// - `STALE_MAX_ITERATIONS` (default: 1000)
    /// - `STALE_PARALLELISM` (default: 1)
    /// - `STALE_TIMEOUT_SECS` (default: 300)
    /// - `STALE_KINDS` (default: all kinds, e.g. `hour,day,month,audit-day`)
    /// - `STALE_INTERVAL_MS` (default: 60000)
    /// - `SQLITE_BUSY_TIMEOUT_MS` (default: 5000)
    /// - `FLUX_CHANNEL_BUFFER` (default: 1000)
    /// - `ENABLE_FLUX` (default: false)
    ///
    /// Unlike a missing variable, an unparsable one is an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let kinds = match env::var("STALE_KINDS") {
            Ok(list) => parse_kind_filter(&list)?,
            Err(_) => defaults.kinds,
        };

        let config = Self {
            db_path: env::var("ROLLUP_DB_PATH").unwrap_or(defaults.db_path),
            max_iterations: parse_var("STALE_MAX_ITERATIONS", defaults.max_iterations)?,
            parallelism: parse_var("STALE_PARALLELISM", defaults.parallelism)?,
            timeout: Duration::from_secs(parse_var(
                "STALE_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )?),
            kinds,
            interval_ms: parse_var("STALE_INTERVAL_MS", defaults.interval_ms)?,
            busy_timeout_ms: parse_var("SQLITE_BUSY_TIMEOUT_MS", defaults.busy_timeout_ms)?,
            flux_channel_buffer: parse_var("FLUX_CHANNEL_BUFFER", defaults.flux_channel_buffer)?,
            flux_enabled: parse_var("ENABLE_FLUX", defaults.flux_enabled)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.run_options().validate()?;

        if self.kinds.is_empty() {
            return Err(ConfigError::InvalidValue(
                "STALE_KINDS must name at least one kind".to_string(),
            ));
        }

        if self.interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "STALE_INTERVAL_MS must be positive".to_string(),
            ));
        }

        if self.flux_channel_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "FLUX_CHANNEL_BUFFER must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            max_iterations_per_worker: self.max_iterations,
            parallelism: self.parallelism,
            wall_clock_timeout: self.timeout,
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Parse a comma-separated kind list, e.g. `hour,day,audit-raw`
///
/// The result is de-duplicated and sorted into level order.
pub fn parse_kind_filter(list: &str) -> Result<Vec<StaleKind>, ConfigError> {
    let mut kinds = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let kind = StaleKind::from_str(name)?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    kinds.sort_by_key(|k| k.level());
    Ok(kinds)
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().to_lowercase().parse::<T>().map_err(|_| {
            ConfigError::InvalidValue(format!("{} has unparsable value '{}'", name, raw))
        }),
        Err(_) => Ok(default),
    }
}
