//! Configuration management for the registration service.
//!
//! Loads configuration from environment variables with sensible defaults.

use eventflow_runtime::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Invalid configuration value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting that must be positive is zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    /// A setting could not be parsed
    #[error("{name} is invalid: {reason}")]
    Invalid {
        /// Setting name
        name: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Capacity ledger configuration
    pub ledger: LedgerConfig,
    /// Registration retry configuration
    pub retry: RetryConfig,
    /// Mirror synchronization configuration
    pub sync: SyncConfig,
    /// Change notifier configuration
    pub notifier: NotifierConfig,
    /// Process configuration
    pub server: ServerConfig,
}

/// Capacity ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Lifetime of an uncommitted reservation in milliseconds
    pub lease_ttl_ms: u64,
    /// Longest wait for a per-event lock in milliseconds
    pub lock_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: 10_000,
            lock_timeout_ms: 2_000,
        }
    }
}

impl LedgerConfig {
    /// Lease lifetime
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// Lock wait bound
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Retry configuration for contended operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Delay before the second attempt in milliseconds
    pub initial_delay_ms: u64,
    /// Backoff cap in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 25,
            max_delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    /// Build the retry policy
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.max_attempts)
            .initial_delay(Duration::from_millis(self.initial_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .jitter(0.2)
            .build()
    }
}

/// Mirror synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Optimistic write attempts per mirrored record
    pub mirror_write_attempts: u32,
    /// Seconds between reconciliation passes
    pub reconcile_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mirror_write_attempts: 8,
            reconcile_interval_secs: 30,
        }
    }
}

impl SyncConfig {
    /// Interval between reconciliation passes
    #[must_use]
    pub const fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// Change notifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Number of changes kept for resumption
    pub retention: usize,
    /// Per-observer channel capacity
    pub channel_capacity: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            retention: 1_024,
            channel_capacity: 256,
        }
    }
}

/// Process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Log filter (trace, debug, info, warn, error or a full directive)
    pub log_level: String,
    /// Prometheus scrape address
    pub metrics_addr: String,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout: u64,
    /// Provision a demo administrator and events at startup
    pub seed_demo: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_addr: "0.0.0.0:9090".to_string(),
            shutdown_timeout: 10,
            seed_demo: false,
        }
    }
}

impl ServerConfig {
    /// Parsed metrics address
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the address does not parse.
    pub fn metrics_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.metrics_addr.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
            name: "METRICS_ADDR",
            reason: e.to_string(),
        })
    }

    /// Log filter built from `log_level`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the directive does not parse.
    pub fn log_filter(&self) -> Result<EnvFilter, ConfigError> {
        EnvFilter::try_new(&self.log_level).map_err(|e| ConfigError::Invalid {
            name: "RUST_LOG",
            reason: e.to_string(),
        })
    }

    /// Graceful shutdown timeout
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

fn var_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables fall back to their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ledger: LedgerConfig {
                lease_ttl_ms: var_or("EVENTFLOW_LEASE_TTL_MS", defaults.ledger.lease_ttl_ms),
                lock_timeout_ms: var_or(
                    "EVENTFLOW_LOCK_TIMEOUT_MS",
                    defaults.ledger.lock_timeout_ms,
                ),
            },
            retry: RetryConfig {
                max_attempts: var_or("EVENTFLOW_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts),
                initial_delay_ms: var_or(
                    "EVENTFLOW_RETRY_INITIAL_DELAY_MS",
                    defaults.retry.initial_delay_ms,
                ),
                max_delay_ms: var_or("EVENTFLOW_RETRY_MAX_DELAY_MS", defaults.retry.max_delay_ms),
            },
            sync: SyncConfig {
                mirror_write_attempts: var_or(
                    "EVENTFLOW_MIRROR_WRITE_ATTEMPTS",
                    defaults.sync.mirror_write_attempts,
                ),
                reconcile_interval_secs: var_or(
                    "EVENTFLOW_RECONCILE_INTERVAL_SECS",
                    defaults.sync.reconcile_interval_secs,
                ),
            },
            notifier: NotifierConfig {
                retention: var_or("EVENTFLOW_FEED_RETENTION", defaults.notifier.retention),
                channel_capacity: var_or(
                    "EVENTFLOW_OBSERVER_BUFFER",
                    defaults.notifier.channel_capacity,
                ),
            },
            server: ServerConfig {
                log_level: env::var("RUST_LOG").unwrap_or(defaults.server.log_level),
                metrics_addr: env::var("METRICS_ADDR").unwrap_or(defaults.server.metrics_addr),
                shutdown_timeout: var_or("SHUTDOWN_TIMEOUT_SECS", defaults.server.shutdown_timeout),
                seed_demo: var_or("EVENTFLOW_SEED_DEMO", defaults.server.seed_demo),
            },
        }
    }

    /// Reject settings the system cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 8] = [
            ("EVENTFLOW_LEASE_TTL_MS", self.ledger.lease_ttl_ms),
            ("EVENTFLOW_LOCK_TIMEOUT_MS", self.ledger.lock_timeout_ms),
            ("EVENTFLOW_RETRY_MAX_ATTEMPTS", u64::from(self.retry.max_attempts)),
            ("EVENTFLOW_MIRROR_WRITE_ATTEMPTS", u64::from(self.sync.mirror_write_attempts)),
            ("EVENTFLOW_RECONCILE_INTERVAL_SECS", self.sync.reconcile_interval_secs),
            (
                "EVENTFLOW_FEED_RETENTION",
                u64::try_from(self.notifier.retention).unwrap_or(u64::MAX),
            ),
            (
                "EVENTFLOW_OBSERVER_BUFFER",
                u64::try_from(self.notifier.channel_capacity).unwrap_or(u64::MAX),
            ),
            ("SHUTDOWN_TIMEOUT_SECS", self.server.shutdown_timeout),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*name));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid {
                name: "EVENTFLOW_RETRY_INITIAL_DELAY_MS",
                reason: "must not exceed EVENTFLOW_RETRY_MAX_DELAY_MS".to_string(),
            });
        }
        self.server.metrics_addr()?;
        self.server.log_filter()?;
        Ok(())
    }
}
