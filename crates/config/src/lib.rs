//! # Config - Persistent Storage Settings
//!
//! Runtime knobs for the persistent storage service: how often the background
//! worker reconciles the whole device, how much slack the watchdog gives it,
//! and what the worker thread is called.
//!
//! ## Environment
//!
//! [`StorageConfig::from_env`] reads the following variables, falling back to
//! the defaults for anything unset:
//!
//! ```text
//! PSTORE_FLUSH_INTERVAL_MS    Background full-flush cadence in ms  (default: 10000)
//! PSTORE_WATCHDOG_MULTIPLIER  Watchdog budget, in flush intervals  (default: 10)
//! PSTORE_WORKER_NAME          Name of the flush worker thread      (default: "persistent-flush")
//! ```
//!
//! ## Example
//!
//! ```rust
//! use config::StorageConfig;
//! use std::time::Duration;
//!
//! let cfg = StorageConfig::default().with_flush_interval(Duration::from_millis(500));
//! assert_eq!(cfg.watchdog_budget(), Duration::from_millis(5000));
//! ```

use std::time::Duration;

use thiserror::Error;

/// Default cadence of the synthesized full-device flush.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Default watchdog budget, expressed in flush intervals.
pub const DEFAULT_WATCHDOG_MULTIPLIER: u32 = 10;

/// Default name given to the background flush thread.
pub const DEFAULT_WORKER_NAME: &str = "persistent-flush";

/// Errors produced while loading or validating a [`StorageConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable was set but could not be parsed.
    #[error("invalid value for {key}: {value:?}")]
    Invalid {
        /// The offending variable.
        key: &'static str,
        /// The raw value found.
        value: String,
    },

    /// The flush interval must be non-zero, otherwise the worker would spin.
    #[error("flush interval must be greater than zero")]
    ZeroFlushInterval,

    /// The watchdog multiplier must be at least one interval.
    #[error("watchdog multiplier must be at least 1")]
    ZeroWatchdogMultiplier,

    /// Thread names may not be empty or contain NUL bytes.
    #[error("invalid worker thread name: {0:?}")]
    WorkerName(String),
}

/// Settings for a persistent storage instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// With no explicit flush requests, the worker flushes the whole device
    /// at least this often.
    pub flush_interval: Duration,
    /// The watchdog slot is registered with a budget of
    /// `flush_interval * watchdog_multiplier`.
    pub watchdog_multiplier: u32,
    /// Name of the background flush thread.
    pub worker_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            watchdog_multiplier: DEFAULT_WATCHDOG_MULTIPLIER,
            worker_name: DEFAULT_WORKER_NAME.to_string(),
        }
    }
}

impl StorageConfig {
    /// Loads the configuration from `PSTORE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable is present but malformed,
    /// or any validation error from [`StorageConfig::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup.
    ///
    /// [`from_env`](Self::from_env) is this with `std::env::var`; tests supply
    /// a map instead so they never touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(raw) = lookup("PSTORE_FLUSH_INTERVAL_MS") {
            let ms: u64 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "PSTORE_FLUSH_INTERVAL_MS",
                value: raw.clone(),
            })?;
            cfg.flush_interval = Duration::from_millis(ms);
        }

        if let Some(raw) = lookup("PSTORE_WATCHDOG_MULTIPLIER") {
            cfg.watchdog_multiplier = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "PSTORE_WATCHDOG_MULTIPLIER",
                value: raw.clone(),
            })?;
        }

        if let Some(raw) = lookup("PSTORE_WORKER_NAME") {
            cfg.worker_name = raw;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the invariants the storage worker relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroFlushInterval);
        }
        if self.watchdog_multiplier == 0 {
            return Err(ConfigError::ZeroWatchdogMultiplier);
        }
        if self.worker_name.is_empty() || self.worker_name.contains('\0') {
            return Err(ConfigError::WorkerName(self.worker_name.clone()));
        }
        Ok(())
    }

    /// Sets the background flush cadence.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the watchdog multiplier.
    #[must_use]
    pub fn with_watchdog_multiplier(mut self, multiplier: u32) -> Self {
        self.watchdog_multiplier = multiplier;
        self
    }

    /// Sets the worker thread name.
    #[must_use]
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    /// The liveness budget handed to the watchdog when the worker registers.
    #[must_use]
    pub fn watchdog_budget(&self) -> Duration {
        self.flush_interval.saturating_mul(self.watchdog_multiplier)
    }
}
