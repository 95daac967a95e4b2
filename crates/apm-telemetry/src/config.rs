// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::error::ConfigError;
use crate::rate_limiter::{RateLimit, DEFAULT_MAX_TRACKED_CATEGORIES};

const DEFAULT_BACKEND_URL: &str = "http://localhost:9200";
const DEFAULT_REQUEST_INDEX: &str = "apm-requests";

/// Per-category reporting limits, parsed from `name:rate` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimits {
    limits: HashMap<String, RateLimit>,
}

impl RateLimits {
    /// Comma separated `name:rate` pairs. Names may contain spaces and
    /// colons; the rate is whatever follows the last colon. Malformed pairs
    /// are skipped.
    #[must_use]
    pub fn from_env_string(env_limits: &str) -> Self {
        let mut limits = HashMap::new();
        for pair in env_limits.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let parsed = pair.rsplit_once(':').and_then(|(name, rate)| {
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                rate.parse::<RateLimit>().ok().map(|rate| (name.to_string(), rate))
            });
            match parsed {
                Some((name, rate)) => {
                    limits.insert(name, rate);
                }
                None => warn!("Ignoring malformed reporting rate limit '{pair}'"),
            }
        }
        RateLimits { limits }
    }

    #[must_use]
    pub fn limits(&self) -> &HashMap<String, RateLimit> {
        &self.limits
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the search backend.
    pub backend_url: String,
    pub backend_username: Option<String>,
    pub backend_password: Option<String>,
    /// Timeout for each backend request.
    pub backend_timeout: Duration,
    /// Period of the reporter's timer-driven flush.
    pub flush_delay: Duration,
    pub max_batch_size: usize,
    pub max_queue_size: usize,
    /// Non-root frames faster than this are pruned from call trees.
    pub min_execution_time: Duration,
    /// Global gate on call-tree collection.
    pub profiler_rate: RateLimit,
    /// Reporting gate for categories without an override.
    pub default_reporting_rate: RateLimit,
    pub reporting_rate_limits: RateLimits,
    /// Reporting categories holding a token bucket at any one time.
    pub max_tracked_categories: usize,
    /// How long a reconciliation waits before its first search.
    pub not_before_delay: Duration,
    /// How long a reconciliation keeps searching before it is dropped.
    pub reconciliation_deadline: Duration,
    pub reconciliation_interval: Duration,
    pub reconciliation_queue_size: usize,
    /// Target index of request documents.
    pub request_index: String,
    pub shutdown_timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            backend_username: None,
            backend_password: None,
            backend_timeout: Duration::from_secs(5),
            flush_delay: Duration::from_millis(1000),
            max_batch_size: 100,
            max_queue_size: 10_000,
            min_execution_time: Duration::from_micros(100),
            profiler_rate: RateLimit::Unbounded,
            default_reporting_rate: RateLimit::Unbounded,
            reporting_rate_limits: RateLimits::default(),
            max_tracked_categories: DEFAULT_MAX_TRACKED_CATEGORIES,
            not_before_delay: Duration::from_millis(1000),
            reconciliation_deadline: Duration::from_secs(60),
            reconciliation_interval: Duration::from_millis(1000),
            reconciliation_queue_size: 10_000,
            request_index: DEFAULT_REQUEST_INDEX.to_string(),
            shutdown_timeout: Duration::from_secs(5),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Reads the configuration from `APM_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn new() -> Result<Config, ConfigError> {
        let defaults = Config::default();

        let max_batch_size = env_parse("APM_MAX_BATCH_SIZE", defaults.max_batch_size)?;
        let max_queue_size = env_parse("APM_MAX_QUEUE_SIZE", defaults.max_queue_size)?;
        let reconciliation_queue_size = env_parse(
            "APM_RECONCILIATION_QUEUE_SIZE",
            defaults.reconciliation_queue_size,
        )?;
        ensure_positive("APM_MAX_BATCH_SIZE", max_batch_size)?;
        ensure_positive("APM_MAX_QUEUE_SIZE", max_queue_size)?;
        let max_tracked_categories = env_parse(
            "APM_MAX_TRACKED_CATEGORIES",
            defaults.max_tracked_categories,
        )?;
        ensure_positive("APM_RECONCILIATION_QUEUE_SIZE", reconciliation_queue_size)?;
        ensure_positive("APM_MAX_TRACKED_CATEGORIES", max_tracked_categories)?;

        Ok(Config {
            backend_url: env::var("APM_BACKEND_URL").unwrap_or(defaults.backend_url),
            backend_username: env::var("APM_BACKEND_USERNAME").ok(),
            backend_password: env::var("APM_BACKEND_PASSWORD").ok(),
            backend_timeout: env_millis("APM_BACKEND_TIMEOUT_MS", defaults.backend_timeout)?,
            flush_delay: env_millis("APM_FLUSH_DELAY_MS", defaults.flush_delay)?,
            max_batch_size,
            max_queue_size,
            min_execution_time: env_parse(
                "APM_MIN_EXECUTION_TIME_US",
                u64::try_from(defaults.min_execution_time.as_micros()).unwrap_or(u64::MAX),
            )
            .map(Duration::from_micros)?,
            profiler_rate: env_parse("APM_PROFILER_RATE_PER_SECOND", defaults.profiler_rate)?,
            default_reporting_rate: env_parse(
                "APM_REPORTING_RATE_PER_SECOND",
                defaults.default_reporting_rate,
            )?,
            reporting_rate_limits: env::var("APM_REPORTING_RATE_LIMITS")
                .map(|limits| RateLimits::from_env_string(&limits))
                .unwrap_or_default(),
            max_tracked_categories,
            not_before_delay: env_millis(
                "APM_RECONCILIATION_NOT_BEFORE_MS",
                defaults.not_before_delay,
            )?,
            reconciliation_deadline: env_millis(
                "APM_RECONCILIATION_DEADLINE_MS",
                defaults.reconciliation_deadline,
            )?,
            reconciliation_interval: env_millis(
                "APM_RECONCILIATION_INTERVAL_MS",
                defaults.reconciliation_interval,
            )?,
            reconciliation_queue_size,
            request_index: env::var("APM_REQUEST_INDEX").unwrap_or(defaults.request_index),
            shutdown_timeout: env_millis("APM_SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout)?,
            log_level: env::var("APM_LOG_LEVEL")
                .map(|level| level.to_lowercase())
                .unwrap_or(defaults.log_level),
        })
    }
}

fn env_parse<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue {
                var,
                value,
                reason: e.to_string(),
            }),
        Err(_) => Ok(default),
    }
}

fn env_millis(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    env_parse(var, default_ms).map(Duration::from_millis)
}

fn ensure_positive(var: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            var,
            value: value.to_string(),
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use std::collections::HashMap;
    use std::env;
    use std::time::Duration;

    use crate::config::{self, RateLimits};
    use crate::rate_limiter::RateLimit;

    const VARS: &[&str] = &[
        "APM_BACKEND_URL",
        "APM_BACKEND_USERNAME",
        "APM_BACKEND_PASSWORD",
        "APM_BACKEND_TIMEOUT_MS",
        "APM_FLUSH_DELAY_MS",
        "APM_MAX_BATCH_SIZE",
        "APM_MAX_QUEUE_SIZE",
        "APM_MIN_EXECUTION_TIME_US",
        "APM_PROFILER_RATE_PER_SECOND",
        "APM_REPORTING_RATE_PER_SECOND",
        "APM_REPORTING_RATE_LIMITS",
        "APM_MAX_TRACKED_CATEGORIES",
        "APM_RECONCILIATION_NOT_BEFORE_MS",
        "APM_RECONCILIATION_DEADLINE_MS",
        "APM_RECONCILIATION_INTERVAL_MS",
        "APM_RECONCILIATION_QUEUE_SIZE",
        "APM_REQUEST_INDEX",
        "APM_SHUTDOWN_TIMEOUT_MS",
        "APM_LOG_LEVEL",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = config::Config::new().unwrap();
        assert_eq!(config.backend_url, "http://localhost:9200");
        assert_eq!(config.flush_delay, Duration::from_millis(1000));
        assert_eq!(config.max_batch_size, 100);
        assert_eq!(config.max_queue_size, 10_000);
        assert_eq!(config.min_execution_time, Duration::from_micros(100));
        assert_eq!(config.profiler_rate, RateLimit::Unbounded);
        assert!(config.reporting_rate_limits.is_empty());
        assert_eq!(config.max_tracked_categories, 10_000);
        assert_eq!(config.request_index, "apm-requests");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear_env();
        env::set_var("APM_BACKEND_URL", "http://127.0.0.1:3333");
        env::set_var("APM_FLUSH_DELAY_MS", "250");
        env::set_var("APM_MAX_BATCH_SIZE", "50");
        env::set_var("APM_MIN_EXECUTION_TIME_US", "2000");
        env::set_var("APM_PROFILER_RATE_PER_SECOND", "5");
        env::set_var("APM_REPORTING_RATE_PER_SECOND", "0");
        env::set_var("APM_RECONCILIATION_DEADLINE_MS", "30000");
        env::set_var("APM_MAX_TRACKED_CATEGORIES", "64");
        env::set_var("APM_LOG_LEVEL", "DEBUG");
        let config = config::Config::new().unwrap();
        clear_env();

        assert_eq!(config.backend_url, "http://127.0.0.1:3333");
        assert_eq!(config.flush_delay, Duration::from_millis(250));
        assert_eq!(config.max_batch_size, 50);
        assert_eq!(config.min_execution_time, Duration::from_millis(2));
        assert_eq!(config.profiler_rate, RateLimit::per_second(5.0));
        assert_eq!(config.default_reporting_rate, RateLimit::Disabled);
        assert_eq!(config.reconciliation_deadline, Duration::from_secs(30));
        assert_eq!(config.max_tracked_categories, 64);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    #[serial]
    fn test_invalid_number_is_error() {
        clear_env();
        env::set_var("APM_MAX_QUEUE_SIZE", "lots");
        let config = config::Config::new();
        clear_env();
        let error = config.unwrap_err().to_string();
        assert!(error.starts_with("Invalid value for APM_MAX_QUEUE_SIZE: 'lots'"));
    }

    #[test]
    #[serial]
    fn test_zero_batch_size_is_error() {
        clear_env();
        env::set_var("APM_MAX_BATCH_SIZE", "0");
        let config = config::Config::new();
        clear_env();
        assert_eq!(
            config.unwrap_err().to_string(),
            "Invalid value for APM_MAX_BATCH_SIZE: '0' (must be at least 1)"
        );
    }

    #[test]
    #[serial]
    fn test_invalid_rate_is_error() {
        clear_env();
        env::set_var("APM_PROFILER_RATE_PER_SECOND", "fast");
        let config = config::Config::new();
        clear_env();
        assert!(config.is_err());
    }

    #[test]
    #[serial]
    fn test_reporting_rate_limits_from_env() {
        clear_env();
        env::set_var(
            "APM_REPORTING_RATE_LIMITS",
            "GET /checkout:2.5, spans:unbounded,broken,:4",
        );
        let config = config::Config::new().unwrap();
        clear_env();
        let expected = HashMap::from([
            ("GET /checkout".to_string(), RateLimit::per_second(2.5)),
            ("spans".to_string(), RateLimit::Unbounded),
        ]);
        assert_eq!(config.reporting_rate_limits.limits(), &expected);
    }

    #[test]
    fn test_rate_limits_no_valid_entries() {
        assert!(RateLimits::from_env_string("").is_empty());
        assert!(RateLimits::from_env_string(" , , ").is_empty());
        assert!(RateLimits::from_env_string("a:fast,b").is_empty());
    }

    #[test]
    fn test_rate_limits_name_with_colon() {
        let limits = RateLimits::from_env_string("db:query:0");
        assert_eq!(limits.limits().get("db:query"), Some(&RateLimit::Disabled));
    }
}
