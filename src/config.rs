//! Configuration management for the tick-daemon framework.
//!
//! Settings load from multiple sources with clear precedence — defaults,
//! then an optional TOML file, then `TICKD_`-prefixed environment variables
//! — built on figment. `validate()` enforces the framework's data-model
//! invariants and is called once by the controller before init.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::{Figment, Provider};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::MIN_RESTART_SECS;

/// Log level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level logging (most verbose).
    Trace,
    /// Debug level logging.
    Debug,
    /// Info level logging (default).
    #[default]
    Info,
    /// Warning level logging.
    Warn,
    /// Error level logging.
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Logging level.
    pub level: LogLevel,
    /// Log file path; stdout when unset.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            file: None,
        }
    }
}

/// Singleton lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease file path for the file-backed provider; unset disables it.
    pub path: Option<PathBuf>,
    /// Lease time-to-live in seconds.
    pub ttl_secs: f64,
    /// Grace padding added to the TTL before a lease is considered expired.
    pub padding_secs: f64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: None,
            ttl_secs: 30.0,
            padding_secs: 2.0,
        }
    }
}

/// Worker mediator defaults. Individual mediators may override the timeout
/// and retry settings per method / per pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Pool size for new mediators.
    pub workers: usize,
    /// Default per-call timeout in seconds, used when no per-method bound
    /// was registered.
    pub timeout_secs: f64,
    /// Maximum transport re-send attempts before a call is failed.
    pub retries: u32,
    /// Bounded depth of each transport lane.
    pub queue_depth: usize,
    /// Queue depth above which new calls are refused.
    pub high_water: usize,
    /// Queue depth below which refused mediators accept work again.
    pub low_water: usize,
    /// Seconds a terminal call is retained before garbage collection.
    pub gc_grace_secs: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            timeout_secs: 30.0,
            retries: 3,
            queue_depth: 1024,
            high_water: 512,
            low_water: 64,
            gc_grace_secs: 60.0,
        }
    }
}

/// Main daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Daemon name/identifier; keys the lock lease and the log label.
    pub name: String,
    /// Seconds between iterations; 0 runs the loop as fast as possible.
    pub loop_interval: f64,
    /// Probability an iteration counts as idle when `loop_interval` is 0.
    pub idle_probability: f64,
    /// Re-exec the daemon after this many seconds of uptime; unset disables
    /// auto-restart. Must be at least [`MIN_RESTART_SECS`].
    pub auto_restart_interval: Option<u64>,
    /// Install the signal reception facility. Disabled in embedded tests.
    pub signals: bool,
    /// Logging configuration.
    pub logging: LogConfig,
    /// Singleton lock configuration.
    pub lock: LockConfig,
    /// Worker mediator defaults.
    pub worker: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::from("tick-daemon"),
            loop_interval: 1.0,
            idle_probability: 0.5,
            auto_restart_interval: None,
            signals: true,
            logging: LogConfig::default(),
            lock: LockConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Config {
    /// Create a new config with defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the default configuration fails validation.
    pub fn new() -> Result<Self> {
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or fails validation.
    pub fn load() -> Result<Self> {
        Self::load_from_file(crate::DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file path, then the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or the merged
    /// configuration fails validation.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(crate::ENV_PREFIX).split("_"))
            .extract()
            .map_err(Error::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration using an explicit figment provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider fails to yield a valid configuration.
    pub fn load_with_provider<P: Provider>(provider: P) -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(provider)
            .extract()
            .map_err(Error::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration against the framework invariants.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("daemon name must not be empty"));
        }
        if !self.loop_interval.is_finite() || self.loop_interval < 0.0 {
            return Err(Error::config(format!(
                "loop_interval must be a non-negative number, got {}",
                self.loop_interval
            )));
        }
        if !(0.0..=1.0).contains(&self.idle_probability) {
            return Err(Error::config(format!(
                "idle_probability must be within [0, 1], got {}",
                self.idle_probability
            )));
        }
        if let Some(interval) = self.auto_restart_interval {
            if interval < MIN_RESTART_SECS {
                return Err(Error::config(format!(
                    "auto_restart_interval must be at least {MIN_RESTART_SECS}s, got {interval}s"
                )));
            }
        }
        if self.lock.ttl_secs <= 0.0 || self.lock.padding_secs < 0.0 {
            return Err(Error::config(
                "lock ttl must be positive and padding non-negative",
            ));
        }
        if self.worker.workers == 0 {
            return Err(Error::config("worker pool size must be at least 1"));
        }
        if self.worker.timeout_secs <= 0.0 {
            return Err(Error::config("worker timeout must be positive"));
        }
        if self.worker.low_water >= self.worker.high_water
            || self.worker.high_water > self.worker.queue_depth
        {
            return Err(Error::config(
                "worker water marks must satisfy low < high <= queue_depth",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::new().unwrap();
        assert_eq!(config.name, "tick-daemon");
        assert!(config.signals);
        assert!(config.auto_restart_interval.is_none());
    }

    #[test]
    fn test_rejects_negative_interval() {
        let mut config = Config::default();
        config.loop_interval = -0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_idle_probability_out_of_range() {
        let mut config = Config::default();
        config.idle_probability = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_short_auto_restart() {
        let mut config = Config::default();
        config.auto_restart_interval = Some(MIN_RESTART_SECS - 1);
        assert!(config.validate().is_err());

        config.auto_restart_interval = Some(MIN_RESTART_SECS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_water_marks() {
        let mut config = Config::default();
        config.worker.low_water = config.worker.high_water;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tickd.toml");
        std::fs::write(
            &path,
            "name = \"sieve\"\nloop_interval = 0.25\n\n[worker]\nworkers = 4\n",
        )
        .unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.name, "sieve");
        assert!((config.loop_interval - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.worker.workers, 4);
        // Untouched sections keep their defaults.
        assert_eq!(config.worker.retries, 3);
    }
}
