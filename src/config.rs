//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup and fails fast on malformed values. Every field has
//! a default, so an empty environment yields a usable config.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::queue::{OrderingMode, QueueConfig};
use crate::telemetry::TelemetryConfig;
use crate::worker::WorkerConfig;

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Number of workers draining the queue.
    pub workers: usize,
    /// Backoff after a `NoneAvailable` answer.
    pub poll_interval: Duration,
    /// Grant lease; `None` means grants never expire.
    pub lease: Option<Duration>,
    pub ordering: OrderingMode,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            lease: None,
            ordering: OrderingMode::default(),
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

/// On-disk shape. Durations are plain milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    workers: Option<usize>,
    poll_interval_ms: Option<u64>,
    lease_ms: Option<u64>,
    ordering: Option<OrderingMode>,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            workers: parse_var(&lookup, "KEYQ_WORKERS")?.unwrap_or(defaults.workers),
            poll_interval: parse_var(&lookup, "KEYQ_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            lease: parse_var(&lookup, "KEYQ_LEASE_MS")?.map(Duration::from_millis),
            ordering: match lookup("KEYQ_ORDERING") {
                Some(raw) => raw
                    .parse()
                    .map_err(|e| Error::Config(format!("KEYQ_ORDERING: {e}")))?,
                None => defaults.ordering,
            },
            otel_endpoint: lookup("OTEL_ENDPOINT").filter(|s| !s.is_empty()),
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
        };
        config.validate()
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad config: {e}")))?;
        let defaults = Self::default();
        Self {
            workers: file.workers.unwrap_or(defaults.workers),
            poll_interval: file
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            lease: file.lease_ms.map(Duration::from_millis),
            ordering: file.ordering.unwrap_or(defaults.ordering),
            otel_endpoint: file.otel_endpoint,
            log_level: file.log_level.unwrap_or(defaults.log_level),
        }
        .validate()
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            ordering: self.ordering,
            lease: self.lease,
            ..QueueConfig::default()
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
        }
    }

    pub fn telemetry_config(&self, service_name: &str) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: self.otel_endpoint.clone(),
            service_name: service_name.to_string(),
            log_level: self.log_level.clone(),
        }
    }

    fn validate(self) -> Result<Self> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.lease.is_some_and(|lease| lease.is_zero()) {
            return Err(Error::Config("lease must be greater than zero".to_string()));
        }
        Ok(self)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("{name}={raw}: {e}")))
        })
        .transpose()
}
