//! Configuration types for courierq.
//!
//! All settings have production defaults and can be overridden from
//! `COURIER_*` environment variables through [`CourierConfig::from_env`].

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CourierError, CourierResult};

/// Prefix for every recognized environment variable.
pub const ENV_PREFIX: &str = "COURIER_";

/// Main configuration for courierq.
///
/// # Examples
///
/// ```rust
/// use courierq::config::{CourierConfig, WorkerConfig};
///
/// let config = CourierConfig {
///     workers: WorkerConfig {
///         concurrency: 4,
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Worker pool settings
    pub workers: WorkerConfig,

    /// Stream, scheduled set and dead letter settings
    pub queue: QueueConfig,

    /// Backoff and retry budget
    pub retry: RetryPolicy,

    /// Duplicate suppression
    pub dedupe: DedupeConfig,

    /// Queue depth sampling
    pub metrics: MetricsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent consumers per process
    pub concurrency: usize,

    /// Entries read from the stream per iteration
    pub batch_size: usize,

    /// How long a stream read blocks waiting for new entries (in milliseconds)
    pub block_ms: u64,

    /// Due entries moved from the scheduled set per iteration
    pub schedule_drain_limit: usize,

    /// Pause after a store error inside the worker loop (in milliseconds)
    pub error_backoff_ms: u64,

    /// Time to wait for workers to finish their current record on stop (in seconds)
    pub shutdown_timeout_secs: u64,

    /// Prefix of the consumer names registered in the consumer group
    pub consumer_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            batch_size: 10,
            block_ms: 5000,
            schedule_drain_limit: 100,
            error_backoff_ms: 1000,
            shutdown_timeout_secs: 30,
            consumer_prefix: "courier".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Create a worker configuration with a specific concurrency.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the blocking read wait.
    pub fn with_block_ms(mut self, block_ms: u64) -> Self {
        self.block_ms = block_ms;
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout_secs: u64) -> Self {
        self.shutdown_timeout_secs = timeout_secs;
        self
    }
}

/// Coordination store layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Durable stream key
    pub stream: String,

    /// Consumer group name
    pub group: String,

    /// Scheduled set key
    pub scheduled_key: String,

    /// Dead letter store key
    pub dead_letter_key: String,

    /// Approximate trim threshold for the stream
    pub max_stream_length: usize,

    /// How long an entry may stay unacknowledged before another consumer may
    /// claim it (in milliseconds)
    pub visibility_timeout_ms: u64,

    /// Redis connection string; `None` disables the queue entirely
    pub redis_url: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream: "courier:email:stream".to_string(),
            group: "courier-email-workers".to_string(),
            scheduled_key: "courier:email:scheduled".to_string(),
            dead_letter_key: "courier:email:dead".to_string(),
            max_stream_length: 10_000,
            visibility_timeout_ms: 180_000, // 3 minutes
            redis_url: None,
        }
    }
}

impl QueueConfig {
    /// Configuration pointing at a Redis instance.
    pub fn redis(connection_string: impl Into<String>) -> Self {
        Self {
            redis_url: Some(connection_string.into()),
            ..Default::default()
        }
    }

    /// Set the visibility timeout.
    pub fn with_visibility_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.visibility_timeout_ms = timeout_ms;
        self
    }

    /// Set the stream trim threshold.
    pub fn with_max_stream_length(mut self, max_len: usize) -> Self {
        self.max_stream_length = max_len;
        self
    }

    /// Visibility timeout as a duration.
    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout_ms.millis()
    }
}

/// Retry policy configuration.
///
/// The delay after the n-th failure is `min(base_delay_ms * 2^(n-1), max_delay_ms)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total delivery attempts before a job is dead-lettered
    pub max_attempts: u32,

    /// Delay after the first failure (in milliseconds)
    pub base_delay_ms: u64,

    /// Upper bound on any single delay (in milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 15_000, // 15 seconds
            max_delay_ms: 300_000, // 5 minutes
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy with the given budget and default delays.
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Create a retry policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
        }
    }

    /// Delay to apply after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        crate::utils::calculate_backoff(attempt, self.base_delay_ms, self.max_delay_ms).millis()
    }
}

/// Duplicate suppression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeConfig {
    /// Whether fingerprints are claimed at all
    pub enabled: bool,

    /// Key prefix for claims
    pub prefix: String,

    /// Minimum lifetime of a claim (in milliseconds)
    pub ttl_ms: u64,

    /// Extra lifetime beyond a job's next due time (in milliseconds)
    pub grace_ms: u64,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "courier:email:dedupe".to_string(),
            ttl_ms: 86_400_000, // 24 hours
            grace_ms: 900_000,  // 15 minutes
        }
    }
}

impl DedupeConfig {
    /// Disabled deduplication.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Queue depth sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the periodic depth sampler runs alongside the workers
    pub enable_sampler: bool,

    /// Sampling interval (in milliseconds)
    pub interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable_sampler: true,
            interval_ms: 15_000,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(CourierError::config(format!("unknown log level '{other}'"))),
        }
    }
}

/// Helper trait for converting durations in configuration.
pub trait DurationExt {
    /// Convert seconds to Duration
    fn secs(self) -> Duration;
    /// Convert milliseconds to Duration
    fn millis(self) -> Duration;
}

impl DurationExt for u64 {
    fn secs(self) -> Duration {
        Duration::from_secs(self)
    }

    fn millis(self) -> Duration {
        Duration::from_millis(self)
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> CourierResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| CourierError::config(format!("{ENV_PREFIX}{key}: invalid value '{raw}'")))
}

fn parse_flag(key: &str, raw: &str) -> CourierResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(CourierError::config(format!(
            "{ENV_PREFIX}{key}: expected a boolean, got '{raw}'"
        ))),
    }
}

impl CourierConfig {
    /// Build a configuration from `COURIER_*` environment variables on top of
    /// the defaults.
    pub fn from_env() -> CourierResult<Self> {
        Self::from_lookup(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Build a configuration from an arbitrary key lookup. Keys are given
    /// without the `COURIER_` prefix.
    pub fn from_lookup<F>(lookup: F) -> CourierResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("STREAM") {
            config.queue.stream = v;
        }
        if let Some(v) = get("GROUP") {
            config.queue.group = v;
        }
        if let Some(v) = get("SCHEDULED_KEY") {
            config.queue.scheduled_key = v;
        }
        if let Some(v) = get("DEAD_LETTER_KEY") {
            config.queue.dead_letter_key = v;
        }
        if let Some(v) = get("MAX_STREAM_LENGTH") {
            config.queue.max_stream_length = parse_var("MAX_STREAM_LENGTH", &v)?;
        }
        if let Some(v) = get("VISIBILITY_TIMEOUT_MS") {
            config.queue.visibility_timeout_ms = parse_var("VISIBILITY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("REDIS_URL") {
            config.queue.redis_url = Some(v);
        }
        if let Some(v) = get("BACKOFF_BASE_MS") {
            config.retry.base_delay_ms = parse_var("BACKOFF_BASE_MS", &v)?;
        }
        if let Some(v) = get("BACKOFF_MAX_MS") {
            config.retry.max_delay_ms = parse_var("BACKOFF_MAX_MS", &v)?;
        }
        if let Some(v) = get("MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_var("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("CONCURRENCY") {
            config.workers.concurrency = parse_var("CONCURRENCY", &v)?;
        }
        if let Some(v) = get("BATCH_SIZE") {
            config.workers.batch_size = parse_var("BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("BLOCK_MS") {
            config.workers.block_ms = parse_var("BLOCK_MS", &v)?;
        }
        if let Some(v) = get("SCHEDULE_DRAIN_LIMIT") {
            config.workers.schedule_drain_limit = parse_var("SCHEDULE_DRAIN_LIMIT", &v)?;
        }
        if let Some(v) = get("METRICS_INTERVAL_MS") {
            config.metrics.interval_ms = parse_var("METRICS_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("DEDUPE_ENABLED") {
            config.dedupe.enabled = parse_flag("DEDUPE_ENABLED", &v)?;
        }
        if let Some(v) = get("DEDUPE_PREFIX") {
            config.dedupe.prefix = v;
        }
        if let Some(v) = get("DEDUPE_TTL_MS") {
            config.dedupe.ttl_ms = parse_var("DEDUPE_TTL_MS", &v)?;
        }
        if let Some(v) = get("DEDUPE_GRACE_MS") {
            config.dedupe.grace_ms = parse_var("DEDUPE_GRACE_MS", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            config.logging.level = v.parse()?;
        }
        if let Some(v) = get("LOG_JSON") {
            config.logging.json_format = parse_flag("LOG_JSON", &v)?;
        }

        Ok(config)
    }

    /// Create a configuration for testing: one worker, short waits, fast retries.
    pub fn testing() -> Self {
        Self {
            workers: WorkerConfig {
                concurrency: 1,
                batch_size: 5,
                block_ms: 20,
                error_backoff_ms: 10,
                shutdown_timeout_secs: 5,
                ..Default::default()
            },
            queue: QueueConfig {
                visibility_timeout_ms: 200,
                ..Default::default()
            },
            retry: RetryPolicy::fixed(3, 10),
            dedupe: DedupeConfig::default(),
            metrics: MetricsConfig {
                enable_sampler: false,
                interval_ms: 50,
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.workers.concurrency == 0 {
            errors.push("Worker concurrency must be greater than 0".to_string());
        }

        if self.workers.batch_size == 0 {
            errors.push("Batch size must be greater than 0".to_string());
        }

        if self.workers.schedule_drain_limit == 0 {
            errors.push("Schedule drain limit must be greater than 0".to_string());
        }

        if self.queue.visibility_timeout_ms == 0 {
            errors.push("Visibility timeout must be greater than 0".to_string());
        }

        if self.queue.max_stream_length == 0 {
            errors.push("Max stream length must be greater than 0".to_string());
        }

        if self.queue.stream.is_empty() || self.queue.group.is_empty() {
            errors.push("Stream and consumer group names must not be empty".to_string());
        }

        if self.retry.max_attempts == 0 {
            errors.push("Retry max attempts must be greater than 0".to_string());
        }

        if self.retry.base_delay_ms == 0 {
            errors.push("Retry base delay must be greater than 0".to_string());
        }

        if self.retry.max_delay_ms == 0 || self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push("Retry max delay must be greater than or equal to base delay".to_string());
        }

        if self.metrics.interval_ms == 0 {
            errors.push("Metrics interval must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = CourierConfig::default();
        assert!(config.workers.concurrency > 0);
        assert_eq!(config.retry.base_delay_ms, 15_000);
        assert_eq!(config.retry.max_delay_ms, 300_000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.queue.visibility_timeout_ms, 180_000);
        assert_eq!(config.dedupe.grace_ms, 900_000);
        assert_eq!(config.metrics.interval_ms, 15_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_testing_config() {
        let config = CourierConfig::testing();
        assert_eq!(config.workers.concurrency, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CourierConfig::default();

        config.workers.concurrency = 0;
        assert!(config.validate().is_err());
        config.workers.concurrency = 1;

        config.retry.base_delay_ms = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("base delay")));
        config.retry.base_delay_ms = 15_000;

        config.retry.max_delay_ms = 1_000;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("max delay")));
        config.retry.max_delay_ms = 300_000;

        config.retry.max_attempts = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("max attempts")));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = CourierConfig::from_lookup(lookup(&[
            ("STREAM", "mail:stream"),
            ("GROUP", "mailers"),
            ("VISIBILITY_TIMEOUT_MS", "60000"),
            ("MAX_ATTEMPTS", "7"),
            ("CONCURRENCY", "3"),
            ("DEDUPE_ENABLED", "false"),
            ("DEDUPE_GRACE_MS", "1000"),
            ("REDIS_URL", "redis://localhost:6379"),
            ("LOG_LEVEL", "warn"),
        ]))
        .unwrap();

        assert_eq!(config.queue.stream, "mail:stream");
        assert_eq!(config.queue.group, "mailers");
        assert_eq!(config.queue.visibility_timeout_ms, 60_000);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.workers.concurrency, 3);
        assert!(!config.dedupe.enabled);
        assert_eq!(config.dedupe.grace_ms, 1_000);
        assert_eq!(config.queue.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.logging.level, LogLevel::Warn);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = CourierConfig::from_lookup(lookup(&[("BATCH_SIZE", "lots")])).unwrap_err();
        assert!(err.to_string().contains("COURIER_BATCH_SIZE"));

        let err = CourierConfig::from_lookup(lookup(&[("DEDUPE_ENABLED", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("boolean"));
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let config = CourierConfig::from_lookup(lookup(&[("STREAM", "  ")])).unwrap();
        assert_eq!(config.queue.stream, "courier:email:stream");
    }

    #[test]
    fn test_retry_policies() {
        let fixed = RetryPolicy::fixed(2, 1000);
        assert_eq!(fixed.max_attempts, 2);
        assert_eq!(fixed.delay_for(1), Duration::from_millis(1000));
        assert_eq!(fixed.delay_for(4), Duration::from_millis(1000));

        let exponential = RetryPolicy::exponential(5);
        assert_eq!(exponential.delay_for(3), Duration::from_millis(60_000));
    }

    #[test]
    fn test_duration_ext() {
        assert_eq!(5u64.secs(), Duration::from_secs(5));
        assert_eq!(1500u64.millis(), Duration::from_millis(1500));
    }
}
