use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use relay_core::estimation::{CostClass, TimeoutEstimator};
use relay_core::protocol::DEFAULT_LOCAL_PORT;

/// Errors raised while reading worker configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("BROKERS must list at least one broker (host:port or URL)")]
    NoBrokers,

    #[error("{key} has an invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Normalized broker base URLs, in configured order.
    pub brokers: Vec<String>,
    pub worker_id: String,
    pub capabilities: Vec<String>,
    /// Port advertised to brokers at registration.
    pub local_port: u16,
    /// Endpoint of the local processing backend.
    pub backend_url: String,
    /// Root for per-job working directories.
    pub work_dir: PathBuf,

    // ---- polling ----
    pub poll_interval: Duration,
    /// Default timeout for broker calls without a tighter bound.
    pub http_timeout: Duration,
    pub poll_timeout: Duration,
    pub health_timeout: Duration,
    pub health_check_interval: Duration,
    pub max_consecutive_failures: u32,
    pub connection_retry_delay: Duration,
    /// Startup connection attempts, `0` for unbounded.
    pub max_startup_attempts: u32,
    /// Consecutive empty polls before periodic idle logging kicks in.
    pub max_empty_polls: u64,

    // ---- processing ----
    pub base_processing_timeout: Duration,
    pub mask_increment: Duration,
    pub max_timeout_mask: Duration,
    pub complex_increment: Duration,
    pub max_timeout_complex: Duration,
    pub fallback_timeout: Duration,
    pub processing_extra_buffer: Duration,
    pub file_check_interval: Duration,
    pub output_wait: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            worker_id: format!("worker_{}", chrono::Utc::now().timestamp()),
            capabilities: vec!["photo_processing".to_string()],
            local_port: DEFAULT_LOCAL_PORT,
            backend_url: format!("http://localhost:{DEFAULT_LOCAL_PORT}"),
            work_dir: std::env::temp_dir().join("relay-worker"),
            poll_interval: Duration::from_secs(2),
            http_timeout: Duration::from_secs(300),
            poll_timeout: Duration::from_secs(10),
            health_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            max_consecutive_failures: 5,
            connection_retry_delay: Duration::from_secs(5),
            max_startup_attempts: 0,
            max_empty_polls: 50,
            base_processing_timeout: Duration::from_secs(2),
            mask_increment: Duration::from_secs(5),
            max_timeout_mask: Duration::from_secs(120),
            complex_increment: Duration::from_secs(3),
            max_timeout_complex: Duration::from_secs(60),
            fallback_timeout: Duration::from_secs(30),
            processing_extra_buffer: Duration::from_secs(10),
            file_check_interval: Duration::from_millis(500),
            output_wait: Duration::from_secs(20),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default                     |
    /// |--------------------------------|-----------------------------|
    /// | `BROKERS`                      | (required)                  |
    /// | `WORKER_ID`                    | `worker_<unix ts>`          |
    /// | `CAPABILITIES`                 | `photo_processing`          |
    /// | `LOCAL_PORT`                   | `7777`                      |
    /// | `BACKEND_URL`                  | `http://localhost:<port>`   |
    /// | `WORK_DIR`                     | `<tmp>/relay-worker`        |
    /// | `POLL_INTERVAL_MS`             | `2000`                      |
    /// | `HTTP_TIMEOUT_SECS`            | `300`                       |
    /// | `POLL_TIMEOUT_SECS`            | `10`                        |
    /// | `HEALTH_TIMEOUT_SECS`          | `5`                         |
    /// | `HEALTH_CHECK_INTERVAL_SECS`   | `30`                        |
    /// | `MAX_CONSECUTIVE_FAILURES`     | `5`                         |
    /// | `CONNECTION_RETRY_DELAY_SECS`  | `5`                         |
    /// | `MAX_STARTUP_ATTEMPTS`         | `0` (unbounded)             |
    /// | `MAX_EMPTY_POLLS`              | `50`                        |
    /// | `BASE_PROCESSING_TIMEOUT_SECS` | `2`                         |
    /// | `MASK_INCREMENT_SECS`          | `5`                         |
    /// | `MAX_TIMEOUT_MASK_SECS`        | `120`                       |
    /// | `COMPLEX_INCREMENT_SECS`       | `3`                         |
    /// | `MAX_TIMEOUT_COMPLEX_SECS`     | `60`                        |
    /// | `FALLBACK_TIMEOUT_SECS`        | `30`                        |
    /// | `PROCESSING_EXTRA_BUFFER_SECS` | `10`                        |
    /// | `FILE_CHECK_INTERVAL_MS`       | `500`                       |
    /// | `OUTPUT_WAIT_SECS`             | `20`                        |
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();

        let brokers = parse_brokers(&std::env::var("BROKERS").unwrap_or_default());
        if brokers.is_empty() {
            return Err(ConfigError::NoBrokers);
        }

        let local_port = env_or("LOCAL_PORT", d.local_port)?;
        let capabilities = match std::env::var("CAPABILITIES") {
            Ok(raw) => split_list(&raw),
            Err(_) => d.capabilities,
        };

        Ok(Self {
            brokers,
            worker_id: std::env::var("WORKER_ID").unwrap_or(d.worker_id),
            capabilities,
            local_port,
            backend_url: std::env::var("BACKEND_URL")
                .unwrap_or_else(|_| format!("http://localhost:{local_port}")),
            work_dir: env_or("WORK_DIR", d.work_dir)?,
            poll_interval: millis("POLL_INTERVAL_MS", d.poll_interval)?,
            http_timeout: secs("HTTP_TIMEOUT_SECS", d.http_timeout)?,
            poll_timeout: secs("POLL_TIMEOUT_SECS", d.poll_timeout)?,
            health_timeout: secs("HEALTH_TIMEOUT_SECS", d.health_timeout)?,
            health_check_interval: secs("HEALTH_CHECK_INTERVAL_SECS", d.health_check_interval)?,
            max_consecutive_failures: env_or("MAX_CONSECUTIVE_FAILURES", d.max_consecutive_failures)?,
            connection_retry_delay: secs("CONNECTION_RETRY_DELAY_SECS", d.connection_retry_delay)?,
            max_startup_attempts: env_or("MAX_STARTUP_ATTEMPTS", d.max_startup_attempts)?,
            max_empty_polls: env_or("MAX_EMPTY_POLLS", d.max_empty_polls)?,
            base_processing_timeout: secs("BASE_PROCESSING_TIMEOUT_SECS", d.base_processing_timeout)?,
            mask_increment: secs("MASK_INCREMENT_SECS", d.mask_increment)?,
            max_timeout_mask: secs("MAX_TIMEOUT_MASK_SECS", d.max_timeout_mask)?,
            complex_increment: secs("COMPLEX_INCREMENT_SECS", d.complex_increment)?,
            max_timeout_complex: secs("MAX_TIMEOUT_COMPLEX_SECS", d.max_timeout_complex)?,
            fallback_timeout: secs("FALLBACK_TIMEOUT_SECS", d.fallback_timeout)?,
            processing_extra_buffer: secs("PROCESSING_EXTRA_BUFFER_SECS", d.processing_extra_buffer)?,
            file_check_interval: millis("FILE_CHECK_INTERVAL_MS", d.file_check_interval)?,
            output_wait: secs("OUTPUT_WAIT_SECS", d.output_wait)?,
        })
    }

    /// Timeout estimator built from the configured classes.
    pub fn estimator(&self) -> TimeoutEstimator {
        TimeoutEstimator {
            base: self.base_processing_timeout,
            classes: vec![
                CostClass::mask(self.mask_increment, self.max_timeout_mask),
                CostClass::complex(self.complex_increment, self.max_timeout_complex),
            ],
            fallback: self.fallback_timeout,
        }
    }
}

/// Parse a comma list of `host:port` pairs or URLs into base URLs.
pub fn parse_brokers(raw: &str) -> Vec<String> {
    split_list(raw)
        .into_iter()
        .map(|entry| {
            let url = if entry.starts_with("http://") || entry.starts_with("https://") {
                entry
            } else {
                format!("http://{entry}")
            };
            url.trim_end_matches('/').to_string()
        })
        .collect()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn secs(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

fn millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_millis() as u64).map(Duration::from_millis)
}
